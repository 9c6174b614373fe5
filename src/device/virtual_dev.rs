//! In-memory device standing in for a V4L2 node
//!
//! Buffers live in a memfd so mappings behave like driver memory, and every
//! call is recorded so callers can check which device calls a ring issued.
//! Capture devices fill each dequeued buffer with the frame sequence number.

use std::collections::{HashSet, VecDeque};
use std::fs::File;
use std::io;
use std::os::fd::RawFd;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use memmap2::{MmapMut, MmapOptions};
use tracing::debug;
use v4l::{Fraction, FourCC};

use super::{
    Blending, BufKind, BufferInfo, DeviceCaps, MemoryMode, PixFormat, Rect, UserPtr, VideoDevice,
};
use crate::capture::PixelFormat;
use crate::utils;

/// Device calls as recorded by [`VirtualDevice`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceOp {
    QueryCaps,
    GetFormat,
    SetFormat,
    ResetFormat,
    GetParm,
    SetParm,
    RequestBuffers,
    QueryBuffer,
    MapBuffer,
    Queue,
    Dequeue,
    StreamOn,
    StreamOff,
    GetCrop,
    SetCrop,
    SetRotation,
    GetWindow,
    SetWindow,
    SetBlending,
}

struct State {
    caps: DeviceCaps,
    format: PixFormat,
    crop: Rect,
    window: Rect,
    rotation: u32,
    interval: Fraction,
    blending_flags: u32,
    count: u32,
    buffer_len: usize,
    backing: Option<File>,
    writer: Option<MmapMut>,
    queued: VecDeque<u32>,
    streaming: bool,
    sequence: u64,
    grant: Option<u32>,
    failing: HashSet<DeviceOp>,
    misreport: Option<u32>,
    hook: Option<(DeviceOp, Hook)>,
    calls: Vec<DeviceOp>,
}

type Hook = Box<dyn FnOnce() + Send>;

pub struct VirtualDevice {
    kind: BufKind,
    state: Mutex<State>,
}

fn pix(width: u32, height: u32, fourcc: FourCC) -> PixFormat {
    PixFormat {
        width,
        height,
        fourcc,
        bytes_per_line: width * 2,
        size_image: width * height * 2,
    }
}

fn os_err(code: i32) -> io::Error {
    io::Error::from_raw_os_error(code)
}

impl VirtualDevice {
    fn new(kind: BufKind, caps: DeviceCaps, width: u32, height: u32, format: PixelFormat) -> Self {
        let state = State {
            caps,
            format: pix(width, height, format.fourcc()),
            crop: Rect::new(0, 0, width, height),
            window: Rect::new(0, 0, width, height),
            rotation: 0,
            interval: Fraction::new(1, 30),
            blending_flags: 0,
            count: 0,
            buffer_len: 0,
            backing: None,
            writer: None,
            queued: VecDeque::new(),
            streaming: false,
            sequence: 0,
            grant: None,
            failing: HashSet::new(),
            misreport: None,
            hook: None,
            calls: Vec::new(),
        };
        Self {
            kind,
            state: Mutex::new(state),
        }
    }

    /// A streaming capture source.
    pub fn capture(width: u32, height: u32, format: PixelFormat) -> Self {
        let caps = DeviceCaps {
            driver: "virtual".into(),
            card: "Virtual Capture".into(),
            capture: true,
            output: false,
            streaming: true,
        };
        Self::new(BufKind::Capture, caps, width, height, format)
    }

    /// A streaming output overlay.
    pub fn output(width: u32, height: u32, format: PixelFormat) -> Self {
        let caps = DeviceCaps {
            driver: "virtual".into(),
            card: "Virtual Overlay".into(),
            capture: false,
            output: true,
            streaming: true,
        };
        Self::new(BufKind::Output, caps, width, height, format)
    }

    /// Override the reported capabilities.
    pub fn with_caps(self, caps: DeviceCaps) -> Self {
        self.state().caps = caps;
        self
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record `op` and fail it if a failure was armed.
    fn enter(&self, op: DeviceOp) -> io::Result<MutexGuard<'_, State>> {
        let hook = {
            let mut state = self.state();
            match state.hook.take() {
                Some((armed, hook)) if armed == op => Some(hook),
                other => {
                    state.hook = other;
                    None
                }
            }
        };
        if let Some(hook) = hook {
            hook();
        }

        let mut state = self.state();
        state.calls.push(op);
        if state.failing.remove(&op) {
            debug!("Injected failure for {:?}", op);
            return Err(os_err(libc::EIO));
        }
        Ok(state)
    }

    /// Make the next call of `op` fail with EIO.
    pub fn fail_next(&self, op: DeviceOp) {
        self.state().failing.insert(op);
    }

    /// Run `hook` right before the next call of `op` reaches the device.
    pub fn before_next(&self, op: DeviceOp, hook: impl FnOnce() + Send + 'static) {
        self.state().hook = Some((op, Box::new(hook)));
    }

    /// Make the next dequeue report `index` without taking a buffer back.
    pub fn misreport_next_dequeue(&self, index: u32) {
        self.state().misreport = Some(index);
    }

    /// Grant `count` buffers regardless of how many are requested.
    pub fn grant_buffers(&self, count: Option<u32>) {
        self.state().grant = count;
    }

    pub fn calls(&self) -> Vec<DeviceOp> {
        self.state().calls.clone()
    }

    pub fn count(&self, op: DeviceOp) -> usize {
        self.state().calls.iter().filter(|&&c| c == op).count()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    pub fn is_streaming(&self) -> bool {
        self.state().streaming
    }

    pub fn queued_len(&self) -> usize {
        self.state().queued.len()
    }

    pub fn rotation(&self) -> u32 {
        self.state().rotation
    }

    pub fn current_crop(&self) -> Rect {
        self.state().crop
    }

    pub fn current_window(&self) -> Rect {
        self.state().window
    }

    pub fn blending_flags(&self) -> u32 {
        self.state().blending_flags
    }
}

impl State {
    fn fill_frame(&mut self, index: u32) -> u32 {
        self.sequence += 1;
        let used = (self.format.size_image as usize).min(self.buffer_len);
        let start = index as usize * self.buffer_len;
        let pattern = self.sequence as u8;
        if let Some(writer) = self.writer.as_mut() {
            writer[start..start + used].fill(pattern);
        }
        used as u32
    }

    fn frame_time(&self) -> Duration {
        let denominator = self.interval.denominator.max(1) as u64;
        Duration::from_nanos(self.sequence * 1_000_000_000 * self.interval.numerator as u64 / denominator)
    }
}

impl VideoDevice for VirtualDevice {
    fn raw_fd(&self) -> RawFd {
        -1
    }

    fn capabilities(&self) -> io::Result<DeviceCaps> {
        Ok(self.enter(DeviceOp::QueryCaps)?.caps.clone())
    }

    fn format(&self, kind: BufKind) -> io::Result<PixFormat> {
        let state = self.enter(DeviceOp::GetFormat)?;
        match kind {
            BufKind::Overlay => Ok(pix(state.window.width, state.window.height, state.format.fourcc)),
            _ => Ok(state.format),
        }
    }

    fn set_format(
        &self,
        kind: BufKind,
        width: u32,
        height: u32,
        fourcc: FourCC,
    ) -> io::Result<PixFormat> {
        let mut state = self.enter(DeviceOp::SetFormat)?;
        if kind != self.kind {
            return Err(os_err(libc::EINVAL));
        }
        if state.streaming {
            return Err(os_err(libc::EBUSY));
        }
        if PixelFormat::from_fourcc(fourcc).is_none() || width == 0 || height == 0 {
            return Err(os_err(libc::EINVAL));
        }
        state.format = pix(width, height, fourcc);
        Ok(state.format)
    }

    fn reset_format(&self, _kind: BufKind) -> io::Result<PixFormat> {
        Ok(self.enter(DeviceOp::ResetFormat)?.format)
    }

    fn frame_interval(&self) -> io::Result<Fraction> {
        let state = self.enter(DeviceOp::GetParm)?;
        Ok(Fraction::new(state.interval.numerator, state.interval.denominator))
    }

    fn set_frame_interval(&self, interval: Fraction) -> io::Result<Fraction> {
        let mut state = self.enter(DeviceOp::SetParm)?;
        if interval.denominator == 0 {
            return Err(os_err(libc::EINVAL));
        }
        state.interval = Fraction::new(interval.numerator, interval.denominator);
        Ok(Fraction::new(interval.numerator, interval.denominator))
    }

    fn request_buffers(&self, kind: BufKind, memory: MemoryMode, count: u32) -> io::Result<u32> {
        let mut state = self.enter(DeviceOp::RequestBuffers)?;
        if kind != self.kind {
            return Err(os_err(libc::EINVAL));
        }
        if state.streaming {
            return Err(os_err(libc::EBUSY));
        }

        state.queued.clear();
        state.writer = None;
        state.backing = None;

        let granted = if count == 0 { 0 } else { state.grant.unwrap_or(count) };
        state.count = granted;
        state.buffer_len = utils::page_align(state.format.size_image as usize);
        if granted == 0 || memory == MemoryMode::UserPtr {
            return Ok(granted);
        }

        let file = utils::memfd("virtual-buffers", state.buffer_len * granted as usize)?;
        let writer = unsafe { MmapOptions::new().map_mut(&file)? };
        state.backing = Some(file);
        state.writer = Some(writer);
        Ok(granted)
    }

    fn query_buffer(&self, _kind: BufKind, _memory: MemoryMode, index: u32) -> io::Result<BufferInfo> {
        let state = self.enter(DeviceOp::QueryBuffer)?;
        if index >= state.count {
            return Err(os_err(libc::EINVAL));
        }
        Ok(BufferInfo {
            index,
            length: state.buffer_len as u32,
            offset: index * state.buffer_len as u32,
            ..Default::default()
        })
    }

    fn map_buffer(&self, info: &BufferInfo) -> io::Result<MmapMut> {
        let state = self.enter(DeviceOp::MapBuffer)?;
        let file = state.backing.as_ref().ok_or_else(|| os_err(libc::EINVAL))?;
        unsafe {
            MmapOptions::new()
                .offset(info.offset as u64)
                .len(info.length as usize)
                .map_mut(file)
        }
    }

    fn queue(
        &self,
        _kind: BufKind,
        memory: MemoryMode,
        index: u32,
        user: Option<UserPtr>,
    ) -> io::Result<()> {
        let mut state = self.enter(DeviceOp::Queue)?;
        if index >= state.count || state.queued.contains(&index) {
            return Err(os_err(libc::EINVAL));
        }
        if memory == MemoryMode::UserPtr && user.map_or(true, |u| u.len < state.buffer_len) {
            return Err(os_err(libc::EFAULT));
        }
        state.queued.push_back(index);
        Ok(())
    }

    fn dequeue(&self, _kind: BufKind, _memory: MemoryMode) -> io::Result<BufferInfo> {
        let mut state = self.enter(DeviceOp::Dequeue)?;
        if !state.streaming {
            return Err(os_err(libc::EINVAL));
        }
        if let Some(index) = state.misreport.take() {
            return Ok(BufferInfo {
                index,
                mapped: true,
                ..Default::default()
            });
        }
        // A driver would block here; there is nothing to wait for in memory
        let index = state.queued.pop_front().ok_or_else(|| os_err(libc::EAGAIN))?;
        let bytes_used = if self.kind == BufKind::Capture {
            state.fill_frame(index)
        } else {
            state.format.size_image
        };
        Ok(BufferInfo {
            index,
            length: state.buffer_len as u32,
            offset: index * state.buffer_len as u32,
            bytes_used,
            timestamp: state.frame_time(),
            mapped: true,
        })
    }

    fn stream_on(&self, _kind: BufKind) -> io::Result<()> {
        let mut state = self.enter(DeviceOp::StreamOn)?;
        if state.count == 0 {
            return Err(os_err(libc::EINVAL));
        }
        state.streaming = true;
        Ok(())
    }

    fn stream_off(&self, _kind: BufKind) -> io::Result<()> {
        let mut state = self.enter(DeviceOp::StreamOff)?;
        state.streaming = false;
        // Stream off hands every queued buffer back
        state.queued.clear();
        Ok(())
    }

    fn crop(&self, _kind: BufKind) -> io::Result<Rect> {
        Ok(self.enter(DeviceOp::GetCrop)?.crop)
    }

    fn set_crop(&self, _kind: BufKind, rect: Rect) -> io::Result<()> {
        let mut state = self.enter(DeviceOp::SetCrop)?;
        if rect.width == 0 || rect.height == 0 {
            return Err(os_err(libc::EINVAL));
        }
        state.crop = rect;
        Ok(())
    }

    fn set_rotation(&self, degrees: u32) -> io::Result<()> {
        let mut state = self.enter(DeviceOp::SetRotation)?;
        if degrees % 90 != 0 || degrees >= 360 {
            return Err(os_err(libc::EINVAL));
        }
        state.rotation = degrees;
        Ok(())
    }

    fn window(&self) -> io::Result<Rect> {
        Ok(self.enter(DeviceOp::GetWindow)?.window)
    }

    fn set_window(&self, rect: Rect) -> io::Result<Rect> {
        let mut state = self.enter(DeviceOp::SetWindow)?;
        state.window = rect;
        Ok(rect)
    }

    fn set_blending(&self, blending: Blending) -> io::Result<()> {
        let mut state = self.enter(DeviceOp::SetBlending)?;
        state.blending_flags = blending.apply_flags(state.blending_flags);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> VirtualDevice {
        let dev = VirtualDevice::capture(64, 48, PixelFormat::Yuyv);
        assert_eq!(dev.request_buffers(BufKind::Capture, MemoryMode::Mmap, 3).unwrap(), 3);
        dev
    }

    #[test]
    fn dequeue_requires_streaming() {
        let dev = device();
        dev.queue(BufKind::Capture, MemoryMode::Mmap, 0, None).unwrap();
        assert!(dev.dequeue(BufKind::Capture, MemoryMode::Mmap).is_err());
        dev.stream_on(BufKind::Capture).unwrap();
        assert_eq!(dev.dequeue(BufKind::Capture, MemoryMode::Mmap).unwrap().index, 0);
    }

    #[test]
    fn capture_dequeue_fills_the_mapped_buffer() {
        let dev = device();
        let info = dev.query_buffer(BufKind::Capture, MemoryMode::Mmap, 1).unwrap();
        let map = dev.map_buffer(&info).unwrap();
        dev.queue(BufKind::Capture, MemoryMode::Mmap, 1, None).unwrap();
        dev.stream_on(BufKind::Capture).unwrap();

        let done = dev.dequeue(BufKind::Capture, MemoryMode::Mmap).unwrap();
        assert_eq!(done.bytes_used, 64 * 48 * 2);
        assert!(map[..done.bytes_used as usize].iter().all(|&b| b == 1));
    }

    #[test]
    fn stream_off_returns_queued_buffers() {
        let dev = device();
        dev.queue(BufKind::Capture, MemoryMode::Mmap, 0, None).unwrap();
        dev.queue(BufKind::Capture, MemoryMode::Mmap, 1, None).unwrap();
        dev.stream_on(BufKind::Capture).unwrap();
        dev.stream_off(BufKind::Capture).unwrap();
        assert_eq!(dev.queued_len(), 0);
    }

    #[test]
    fn injected_failure_is_one_shot() {
        let dev = device();
        dev.fail_next(DeviceOp::Queue);
        assert!(dev.queue(BufKind::Capture, MemoryMode::Mmap, 0, None).is_err());
        assert!(dev.queue(BufKind::Capture, MemoryMode::Mmap, 0, None).is_ok());
        assert_eq!(dev.count(DeviceOp::Queue), 2);
    }

    #[test]
    fn hook_runs_once_before_its_call() {
        let dev = device();
        let ran = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let seen = ran.clone();
        dev.before_next(DeviceOp::Queue, move || {
            seen.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });
        dev.stream_on(BufKind::Capture).unwrap();
        assert_eq!(ran.load(std::sync::atomic::Ordering::SeqCst), 0);
        dev.queue(BufKind::Capture, MemoryMode::Mmap, 0, None).unwrap();
        dev.queue(BufKind::Capture, MemoryMode::Mmap, 1, None).unwrap();
        assert_eq!(ran.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn misreported_dequeue_keeps_the_queue() {
        let dev = device();
        dev.queue(BufKind::Capture, MemoryMode::Mmap, 0, None).unwrap();
        dev.stream_on(BufKind::Capture).unwrap();
        dev.misreport_next_dequeue(7);
        assert_eq!(dev.dequeue(BufKind::Capture, MemoryMode::Mmap).unwrap().index, 7);
        assert_eq!(dev.queued_len(), 1);
        assert_eq!(dev.dequeue(BufKind::Capture, MemoryMode::Mmap).unwrap().index, 0);
    }

    #[test]
    fn double_queue_is_rejected() {
        let dev = device();
        dev.queue(BufKind::Capture, MemoryMode::Mmap, 2, None).unwrap();
        assert!(dev.queue(BufKind::Capture, MemoryMode::Mmap, 2, None).is_err());
    }
}
