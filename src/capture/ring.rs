//! Capture ring: dequeue, copy out, requeue

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crossbeam::utils::CachePadded;
use tracing::{debug, info, instrument, warn};

use super::convert::{FrameScaler, NearestScaler, PixelConverter, Yuyv422ToRgb565};
use super::PixelFormat;
use crate::buffer::{BufferPool, SlotState};
use crate::device::{BufKind, DeviceChannel, MemoryMode};
use crate::error::{Error, Result};
use crate::CaptureConfig;

/// Invoked once per delivered frame with the filled destination and the
/// device timestamp in nanoseconds.
pub type FrameCallback = Box<dyn FnMut(&[u8], u64) + Send>;

/// Outcome of one [`CaptureRing::grab_frame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrabStatus {
    Delivered,
    /// The ring had starved; a buffer was requeued, a frame dropped, and the next one delivered.
    Recovered,
    /// Nothing was delivered.
    Dropped,
}

/// Counters shared with whoever watches the capture thread.
#[derive(Default)]
pub struct CaptureStats {
    frames: CachePadded<AtomicU64>,
    dropped: CachePadded<AtomicU64>,
}

impl CaptureStats {
    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn frame(&self) {
        self.frames.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("capture_frames_total").increment(1);
    }

    fn drop_frame(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("capture_dropped_frames_total").increment(1);
    }
}

/// Frames per second over windows of 32 frames.
pub struct FpsCounter {
    frames: u32,
    window_start: Instant,
    last: Option<f64>,
}

impl Default for FpsCounter {
    fn default() -> Self {
        Self {
            frames: 0,
            window_start: Instant::now(),
            last: None,
        }
    }
}

impl FpsCounter {
    const WINDOW: u32 = 32;

    /// Count a frame; returns a new rate at the end of each window.
    pub fn tick(&mut self) -> Option<f64> {
        self.frames += 1;
        if self.frames < Self::WINDOW {
            return None;
        }
        let now = Instant::now();
        let elapsed = now.duration_since(self.window_start).as_secs_f64();
        self.frames = 0;
        self.window_start = now;
        if elapsed <= 0.0 {
            return None;
        }
        let fps = Self::WINDOW as f64 / elapsed;
        self.last = Some(fps);
        Some(fps)
    }

    pub fn last(&self) -> Option<f64> {
        self.last
    }
}

#[derive(Clone, Copy)]
enum Transfer {
    Direct,
    Scaled { width: u32, height: u32 },
    Converted,
}

/// Capture side of the pipeline. Only the capture thread touches a ring.
pub struct CaptureRing {
    channel: DeviceChannel,
    pool: BufferPool,
    buffer_count: u32,
    fps: u32,
    width: u32,
    height: u32,
    format: PixelFormat,
    queued: u64,
    dequeued: u64,
    scaler: Box<dyn FrameScaler>,
    converter: Box<dyn PixelConverter>,
    callback: Option<FrameCallback>,
    fps_counter: FpsCounter,
    stats: Arc<CaptureStats>,
}

impl CaptureRing {
    /// Open the configured device node and negotiate its format.
    pub fn open(config: &CaptureConfig) -> Result<Self> {
        let channel = DeviceChannel::open(&config.device, BufKind::Capture, config.memory)?;
        Self::with_channel(channel, config)
    }

    /// Negotiate the configured format on an already opened channel.
    pub fn with_channel(mut channel: DeviceChannel, config: &CaptureConfig) -> Result<Self> {
        let fmt = channel.configure(config.width, config.height, config.format, Some(config.fps))?;
        info!(
            "Capture configured: {}x{} {:?} @ {} fps",
            fmt.width, fmt.height, config.format, config.fps
        );

        Ok(Self {
            channel,
            pool: BufferPool::new(),
            buffer_count: config.buffer_count,
            fps: config.fps,
            width: fmt.width,
            height: fmt.height,
            format: config.format,
            queued: 0,
            dequeued: 0,
            scaler: Box::new(NearestScaler),
            converter: Box::new(Yuyv422ToRgb565),
            callback: None,
            fps_counter: FpsCounter::default(),
            stats: Arc::new(CaptureStats::default()),
        })
    }

    pub fn set_frame_callback(&mut self, callback: FrameCallback) {
        self.callback = Some(callback);
    }

    pub fn set_scaler(&mut self, scaler: Box<dyn FrameScaler>) {
        self.scaler = scaler;
    }

    pub fn set_converter(&mut self, converter: Box<dyn PixelConverter>) {
        self.converter = converter;
    }

    pub fn stats(&self) -> Arc<CaptureStats> {
        self.stats.clone()
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

    /// Size of one native frame.
    pub fn frame_size(&self) -> usize {
        self.format.frame_size(self.width, self.height)
    }

    /// Buffers handed to the device and not yet returned.
    pub fn in_flight(&self) -> u64 {
        self.queued.saturating_sub(self.dequeued)
    }

    pub fn is_streaming(&self) -> bool {
        self.channel.is_streaming()
    }

    /// Map the buffer pool, queue every buffer and start streaming.
    #[instrument(skip(self))]
    pub fn start(&mut self) -> Result<()> {
        if !self.pool.is_mapped() {
            self.channel.request_buffers(self.buffer_count)?;
            self.pool.map(&self.channel, self.buffer_count)?;
        }

        for index in 0..self.pool.len() {
            if self.pool.slot(index)?.state() == SlotState::QueuedToDevice {
                continue;
            }
            self.queue_slot(index)?;
        }

        self.channel.stream_on()?;
        info!("Capture started with {} buffers at {} fps", self.pool.len(), self.fps);
        Ok(())
    }

    /// Stop streaming, leaving the pool mapped.
    ///
    /// Every buffer comes back to the ring, so a later [`start`](Self::start)
    /// queues them all again.
    pub fn stop(&mut self) -> Result<()> {
        if !self.channel.is_streaming() {
            return Ok(());
        }
        self.channel.stream_off()?;
        self.reclaim();
        Ok(())
    }

    /// Stop streaming and release every buffer.
    pub fn uninit(&mut self) -> Result<()> {
        self.channel.stream_off()?;
        self.reclaim();
        self.pool.unmap();
        if let Err(e) = self.channel.release_buffers() {
            warn!("Device kept its buffers: {}", e);
        }
        info!("Capture uninitialized");
        Ok(())
    }

    /// Stream off hands every buffer back.
    fn reclaim(&mut self) {
        self.pool.reset_ownership();
        self.queued = 0;
        self.dequeued = 0;
    }

    fn queue_slot(&mut self, index: usize) -> Result<()> {
        let user = match self.pool.memory() {
            MemoryMode::UserPtr => Some(self.pool.slot(index)?.user_ptr()),
            MemoryMode::Mmap => None,
        };
        self.channel.queue(index as u32, user)?;
        self.pool.mark_queued(index)?;
        self.queued += 1;
        Ok(())
    }

    /// Grab one frame into `dest`, scaling when `width`x`height` is not
    /// the negotiated capture size.
    pub fn grab_frame(&mut self, dest: &mut [u8], width: u32, height: u32) -> Result<GrabStatus> {
        let transfer = if (width, height) == (self.width, self.height) {
            Transfer::Direct
        } else if self.format.is_yuv422() {
            Transfer::Scaled { width, height }
        } else {
            return Err(Error::Config(format!("cannot scale {:?} frames", self.format)));
        };
        self.cycle(dest, transfer)
    }

    /// Grab one frame and convert it to RGB565 at the capture size.
    pub fn grab_converted(&mut self, dest: &mut [u8]) -> Result<GrabStatus> {
        if self.format != PixelFormat::Yuyv {
            return Err(Error::Config(format!("cannot convert {:?} frames", self.format)));
        }
        self.cycle(dest, Transfer::Converted)
    }

    fn cycle(&mut self, dest: &mut [u8], transfer: Transfer) -> Result<GrabStatus> {
        if !self.pool.is_mapped() {
            return Err(Error::NotInitialized);
        }

        let mut status = GrabStatus::Delivered;
        if self.in_flight() == 0 {
            // Starved: hand a buffer back rather than block on an empty queue
            self.stats.drop_frame();
            let held = self
                .pool
                .find(SlotState::OwnedByApplication)
                .or_else(|| self.pool.find(SlotState::Free));
            let requeued = match held {
                Some(index) => self.queue_slot(index),
                None => Err(Error::Buffer("no slot to requeue".into())),
            };
            if let Err(e) = requeued {
                warn!("Capture starved and requeue failed: {}", e);
                return Ok(GrabStatus::Dropped);
            }
            warn!("Capture starved, frame dropped");
            status = GrabStatus::Recovered;
        }

        let info = match self.channel.dequeue() {
            Ok(info) => info,
            Err(e) => {
                debug!("Dequeue failed, dropping frame: {}", e);
                self.stats.drop_frame();
                return Ok(GrabStatus::Dropped);
            }
        };
        let index = info.index as usize;
        if index >= self.pool.len() {
            warn!("Device returned slot {} of {}, dropping frame", index, self.pool.len());
            self.stats.drop_frame();
            return Ok(GrabStatus::Dropped);
        }
        self.dequeued += 1;
        self.pool.mark_dequeued(index)?;

        let copied = {
            let slot = self.pool.slot(index)?;
            let used = (info.bytes_used as usize).min(slot.len());
            self.transfer(transfer, &slot.as_slice()[..used], dest)
        };

        // Requeue even when the copy failed so the ring cannot starve
        if let Err(e) = self.queue_slot(index) {
            warn!("Requeue of slot {} failed: {}", index, e);
        }

        let filled = copied?;
        self.stats.frame();
        if let Some(fps) = self.fps_counter.tick() {
            debug!("Capture rate {:.1} fps", fps);
            metrics::gauge!("capture_fps").set(fps);
        }
        if let Some(callback) = self.callback.as_mut() {
            callback(&dest[..filled], info.timestamp.as_nanos() as u64);
        }
        Ok(status)
    }

    fn transfer(&self, transfer: Transfer, src: &[u8], dest: &mut [u8]) -> Result<usize> {
        let needed = match transfer {
            Transfer::Direct => src.len(),
            Transfer::Scaled { width, height } => self.format.frame_size(width, height),
            Transfer::Converted => PixelFormat::Rgb565.frame_size(self.width, self.height),
        };
        if dest.len() < needed {
            return Err(Error::Config(format!(
                "destination holds {} bytes, frame needs {}",
                dest.len(),
                needed
            )));
        }

        match transfer {
            Transfer::Direct => dest[..needed].copy_from_slice(src),
            Transfer::Scaled { width, height } => {
                self.scaler
                    .scale(src, self.width, self.height, &mut dest[..needed], width, height)
            }
            Transfer::Converted => {
                self.converter
                    .convert(src, &mut dest[..needed], self.width, self.height)
            }
        }
        Ok(needed)
    }
}

impl Drop for CaptureRing {
    fn drop(&mut self) {
        if let Err(e) = self.channel.stream_off() {
            warn!("Stream off on drop failed: {}", e);
        }
    }
}
