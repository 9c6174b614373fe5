//! Frame-owning side of an overlay: queue, dequeue, crop and resize

use std::os::fd::RawFd;
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use super::coordinator;
use super::handle::OverlayHandle;
use super::shared::SharedControlBlock;
use crate::buffer::{BufferPool, BufferSlot, SlotRef, SlotState};
use crate::capture::PixelFormat;
use crate::device::{BufKind, DeviceChannel, MemoryMode, Rect, V4l2Device, VideoDevice};
use crate::error::{Error, Result};
use crate::utils;

/// Where a slot lives in device memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferMapping {
    pub fd: RawFd,
    pub length: usize,
    pub offset: u32,
    pub addr: usize,
}

pub struct OutputRing {
    channel: DeviceChannel,
    shared: Option<SharedControlBlock>,
    pool: BufferPool,
    width: u32,
    height: u32,
    format: PixelFormat,
    num_buffers: u32,
    crop: Option<Rect>,
    /// A crop or queue happened, geometry is fixed from here on.
    geometry_fixed: bool,
    cacheable: bool,
}

impl OutputRing {
    /// Attach through the device descriptor carried by `handle`.
    pub fn open(handle: &OverlayHandle, memory: MemoryMode) -> Result<Self> {
        let fd = utils::dup_fd(handle.ctl_fd).map_err(|e| Error::Open {
            path: format!("fd:{}", handle.ctl_fd),
            reason: e.to_string(),
        })?;
        Self::initialize(Arc::new(V4l2Device::from_fd(fd)), handle, memory)
    }

    /// Attach to the shared block named by `handle` and map the overlay buffers.
    #[instrument(skip(device))]
    pub fn initialize(device: Arc<dyn VideoDevice>, handle: &OverlayHandle, memory: MemoryMode) -> Result<Self> {
        let fd = utils::dup_fd(handle.shared_fd)
            .map_err(|e| Error::SharedBlock(format!("shared fd {}: {}", handle.shared_fd, e)))?;
        let shared = SharedControlBlock::open(fd, handle.shared_size)?;

        let mut channel = DeviceChannel::with_device(device, BufKind::Output, memory)?;
        let stream_en = {
            let mut guard = shared.lock()?;
            guard.set_data_ready(false);
            guard.stream_en()
        };
        channel.sync_streaming(stream_en);

        if memory == MemoryMode::UserPtr {
            channel.request_buffers(handle.num_buffers)?;
        }
        let mut pool = BufferPool::new();
        pool.map(&channel, handle.num_buffers)?;

        info!(
            "Output ring ready: {}x{} {:?}, {} buffers ({:?})",
            handle.width, handle.height, handle.format, handle.num_buffers, memory
        );
        Ok(Self {
            channel,
            shared: Some(shared),
            pool,
            width: handle.width,
            height: handle.height,
            format: handle.format,
            num_buffers: handle.num_buffers,
            crop: None,
            geometry_fixed: false,
            cacheable: false,
        })
    }

    fn shared(&self) -> Result<&SharedControlBlock> {
        self.shared.as_ref().ok_or(Error::NotInitialized)
    }

    /// Consume a pending flush pulse, dropping all local slot ownership.
    fn check_flushed(&mut self) -> Result<()> {
        let flushed = self.shared()?.lock()?.take_streaming_reset();
        if flushed {
            info!("Buffers flushed by stream off, {} were queued", self.pool.in_flight());
            self.pool.reset_ownership();
            metrics::gauge!("overlay_queue_depth").set(0.0);
            return Err(Error::StreamFlushed);
        }
        Ok(())
    }

    /// Hand a filled slot to the display. Returns the queue depth.
    ///
    /// A successful queue marks the frame side ready and starts streaming
    /// if it is not on yet.
    #[instrument(skip(self))]
    pub fn queue_buffer(&mut self, slot: SlotRef) -> Result<usize> {
        self.check_flushed()?;

        let index = self.pool.resolve(slot)?;
        let buffer = self.pool.slot(index)?;
        if buffer.state() == SlotState::QueuedToDevice {
            return Err(Error::Buffer(format!("slot {} is already queued", index)));
        }
        let user = (self.pool.memory() == MemoryMode::UserPtr).then(|| buffer.user_ptr());

        self.channel.queue(index as u32, user)?;
        self.pool.mark_queued(index)?;
        self.geometry_fixed = true;
        let depth = self.pool.in_flight();
        metrics::gauge!("overlay_queue_depth").set(depth as f64);

        if let Some(shared) = self.shared.as_ref() {
            let mut guard = shared.lock()?;
            guard.set_data_ready(true);
            if !guard.stream_en() {
                if let Err(e) = coordinator::enable_streaming(&mut guard, &mut self.channel) {
                    warn!("Stream enable after queue failed: {}", e);
                }
            }
        }
        Ok(depth)
    }

    /// Take back a slot the display is done with.
    ///
    /// Fails with [`Error::WouldBlock`] while the device is not streaming.
    #[instrument(skip(self))]
    pub fn dequeue_buffer(&mut self) -> Result<SlotRef> {
        self.check_flushed()?;

        if !self.shared()?.lock()?.stream_en() {
            return Err(Error::WouldBlock);
        }

        let info = match self.channel.dequeue() {
            Ok(info) => info,
            Err(e) => {
                // The control side may have stopped the stream under us
                self.check_flushed()?;
                if !self.shared()?.lock()?.stream_en() {
                    debug!("Dequeue interrupted by stream off: {}", e);
                    return Err(Error::WouldBlock);
                }
                return Err(e);
            }
        };
        let index = info.index as usize;
        if index >= self.pool.len() {
            return Err(Error::SlotIndex {
                index,
                count: self.pool.len(),
            });
        }
        self.pool.mark_dequeued(index)?;
        metrics::gauge!("overlay_queue_depth").set(self.pool.in_flight() as f64);
        self.pool.slot_ref(index)
    }

    /// Crop the source frames. An unchanged crop makes no device call.
    #[instrument(skip(self))]
    pub fn set_crop(&mut self, rect: Rect) -> Result<()> {
        let shared = self.shared.as_ref().ok_or(Error::NotInitialized)?;
        let mut guard = shared.lock()?;
        guard.set_data_ready(true);
        self.geometry_fixed = true;

        if self.crop == Some(rect) {
            debug!("Crop unchanged");
            return Ok(());
        }
        info!("Crop window {:?}", rect);

        coordinator::disable_streaming(&mut guard, &mut self.channel)?;
        let cropped = self.channel.set_crop(rect);
        if cropped.is_ok() {
            self.crop = Some(rect);
        }
        // Streaming comes back even when the crop was rejected
        let enabled = coordinator::enable_streaming(&mut guard, &mut self.channel);
        cropped?;
        enabled?;
        Ok(())
    }

    pub fn get_crop(&self) -> Result<Rect> {
        self.channel.crop()
    }

    /// Change the source frame size. Only allowed before the first crop or queue.
    #[instrument(skip(self))]
    pub fn resize_input(&mut self, width: u32, height: u32) -> Result<()> {
        if (width, height) == (self.width, self.height) {
            debug!("Input already {}x{}", width, height);
            return Ok(());
        }
        let shared = self.shared.as_ref().ok_or(Error::NotInitialized)?;
        if self.geometry_fixed || shared.snapshot()?.data_ready {
            return Err(Error::GeometryLocked);
        }

        let mut guard = shared.lock()?;
        coordinator::disable_streaming(&mut guard, &mut self.channel)?;

        self.pool.unmap();
        self.channel.configure(width, height, self.format, None)?;
        self.channel.set_crop(Rect::new(0, 0, width, height))?;
        debug!("Requesting {} buffers, cacheable={}", self.num_buffers, self.cacheable);
        let granted = self.channel.request_buffers(self.num_buffers)?;
        self.pool.map(&self.channel, granted)?;
        self.num_buffers = granted;
        self.width = width;
        self.height = height;
        info!("Input resized to {}x{}, {} buffers", width, height, granted);

        coordinator::enable_streaming(&mut guard, &mut self.channel)?;
        Ok(())
    }

    /// Only possible before the frame side went ready.
    pub fn set_cacheable_buffers(&mut self, cacheable: bool) -> Result<()> {
        if self.shared()?.snapshot()?.data_ready {
            return Err(Error::GeometryLocked);
        }
        self.cacheable = cacheable;
        Ok(())
    }

    pub fn buffer_count(&self) -> usize {
        self.pool.len()
    }

    pub fn in_flight(&self) -> usize {
        self.pool.in_flight()
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    /// Reference to slot `index` of the current mapping.
    pub fn slot(&self, index: usize) -> Result<SlotRef> {
        self.pool.slot_ref(index)
    }

    /// Slots the producer may fill, that is every slot not queued to the device.
    pub fn available_slots(&self) -> Vec<SlotRef> {
        self.pool
            .slots()
            .filter(|s| s.state() != SlotState::QueuedToDevice)
            .filter_map(|s| self.pool.slot_ref(s.index() as usize).ok())
            .collect()
    }

    pub fn buffer(&self, slot: SlotRef) -> Result<&BufferSlot> {
        self.pool.slot(self.pool.resolve(slot)?)
    }

    pub fn buffer_mut(&mut self, slot: SlotRef) -> Result<&mut [u8]> {
        let index = self.pool.resolve(slot)?;
        Ok(self.pool.slot_mut(index)?.as_mut_slice())
    }

    pub fn buffer_address(&self, slot: SlotRef) -> Result<BufferMapping> {
        let buffer = self.buffer(slot)?;
        Ok(BufferMapping {
            fd: self.channel.device().raw_fd(),
            length: buffer.len(),
            offset: buffer.offset(),
            addr: buffer.as_slice().as_ptr() as usize,
        })
    }

    /// Unmap every buffer and let go of the shared block.
    pub fn close(&mut self) -> Result<()> {
        let Some(shared) = self.shared.take() else {
            return Ok(());
        };
        {
            let mut guard = shared.lock()?;
            self.pool.unmap();
            guard.set_data_ready(false);
        }
        info!("Output ring closed");
        Ok(())
    }
}

impl Drop for OutputRing {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Closing output ring failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceOp, VirtualDevice};
    use crate::overlay::OverlayControl;

    fn overlay() -> (Arc<VirtualDevice>, OverlayControl, OutputRing) {
        let dev = Arc::new(VirtualDevice::output(640, 480, PixelFormat::Uyvy));
        let mut ctl = OverlayControl::with_device(dev.clone(), MemoryMode::Mmap);
        let handle = ctl.create_overlay(640, 480, None).unwrap();
        let ring = OutputRing::initialize(dev.clone(), &handle, MemoryMode::Mmap).unwrap();
        (dev, ctl, ring)
    }

    #[test]
    fn initialize_takes_a_reference() {
        let (_dev, ctl, ring) = overlay();
        assert_eq!(ctl.shared().unwrap().ref_count(), 2);
        assert_eq!(ring.buffer_count(), 3);
        drop(ring);
        assert_eq!(ctl.shared().unwrap().ref_count(), 1);
    }

    #[test]
    fn dequeue_interrupted_by_stream_off_reports_flush() {
        let (dev, mut ctl, mut ring) = overlay();
        ctl.commit().unwrap();
        let slot = ring.slot(0).unwrap();
        ring.queue_buffer(slot).unwrap();

        let fd = ctl.shared().unwrap().try_clone_fd().unwrap();
        let other = SharedControlBlock::open(fd, ctl.handle().unwrap().shared_size).unwrap();
        let device = dev.clone();
        dev.before_next(DeviceOp::Dequeue, move || {
            let mut guard = other.lock().unwrap();
            device.stream_off(BufKind::Output).unwrap();
            guard.set_streaming_reset(true);
            guard.set_stream_en(false);
            guard.set_data_ready(false);
        });

        assert!(matches!(ring.dequeue_buffer(), Err(Error::StreamFlushed)));
        assert_eq!(ring.in_flight(), 0);
        assert!(matches!(ring.dequeue_buffer(), Err(Error::WouldBlock)));
    }

    #[test]
    fn dequeue_would_block_before_streaming() {
        let (dev, _ctl, mut ring) = overlay();
        assert!(matches!(ring.dequeue_buffer(), Err(Error::WouldBlock)));
        assert_eq!(dev.count(DeviceOp::Dequeue), 0);
    }

    #[test]
    fn first_queue_starts_streaming_once_control_committed() {
        let (dev, mut ctl, mut ring) = overlay();
        ctl.commit().unwrap();

        let slot = ring.slot(0).unwrap();
        assert_eq!(ring.queue_buffer(slot).unwrap(), 1);
        assert!(dev.is_streaming());

        let back = ring.dequeue_buffer().unwrap();
        assert_eq!(back, slot);
        assert_eq!(ring.in_flight(), 0);
    }

    #[test]
    fn repeated_crop_is_a_no_op() {
        let (dev, _ctl, mut ring) = overlay();
        let rect = Rect::new(0, 0, 320, 240);
        ring.set_crop(rect).unwrap();
        assert_eq!(dev.count(DeviceOp::SetCrop), 2);
        ring.set_crop(rect).unwrap();
        assert_eq!(dev.count(DeviceOp::SetCrop), 2);
        assert_eq!(ring.get_crop().unwrap(), rect);
    }

    #[test]
    fn resize_locks_after_queue() {
        let (_dev, _ctl, mut ring) = overlay();
        ring.resize_input(320, 240).unwrap();
        assert_eq!(ring.buffer_count(), 3);
        assert_eq!(ring.width(), 320);

        let slot = ring.slot(0).unwrap();
        ring.queue_buffer(slot).unwrap();
        assert!(matches!(ring.resize_input(160, 120), Err(Error::GeometryLocked)));
    }

    #[test]
    fn resize_to_same_size_makes_no_call() {
        let (dev, _ctl, mut ring) = overlay();
        dev.clear_calls();
        ring.resize_input(640, 480).unwrap();
        assert!(dev.calls().is_empty());
    }

    #[test]
    fn stale_slot_after_resize() {
        let (_dev, _ctl, mut ring) = overlay();
        let old = ring.slot(1).unwrap();
        ring.resize_input(320, 240).unwrap();
        assert!(matches!(ring.queue_buffer(old), Err(Error::ForeignSlot)));
    }

    #[test]
    fn cacheable_only_before_ready() {
        let (_dev, _ctl, mut ring) = overlay();
        ring.set_cacheable_buffers(true).unwrap();
        ring.set_crop(Rect::new(0, 0, 100, 100)).unwrap();
        assert!(matches!(ring.set_cacheable_buffers(false), Err(Error::GeometryLocked)));
    }

    #[test]
    fn buffer_address_describes_mapping() {
        let (_dev, _ctl, ring) = overlay();
        let slot = ring.slot(2).unwrap();
        let mapping = ring.buffer_address(slot).unwrap();
        assert_eq!(mapping.length, ring.buffer(slot).unwrap().len());
        assert_eq!(mapping.offset as usize, 2 * mapping.length);
        assert_ne!(mapping.addr, 0);
    }
}
