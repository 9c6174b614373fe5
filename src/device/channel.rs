//! Device-level control calls with an idempotent streaming gate

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};
use v4l::Fraction;

use super::{Blending, BufKind, BufferInfo, MemoryMode, PixFormat, Rect, UserPtr, V4l2Device, VideoDevice};
use crate::capture::PixelFormat;
use crate::error::{Error, Result};

/// One queue of a streaming device: format, buffers, crop, rotation and stream state.
///
/// The channel holds no buffers itself, see [`BufferPool`](crate::buffer::BufferPool).
pub struct DeviceChannel {
    device: Arc<dyn VideoDevice>,
    kind: BufKind,
    memory: MemoryMode,
    format: Option<PixFormat>,
    streaming: bool,
}

impl DeviceChannel {
    /// Open a V4L2 node and check it can stream on `kind`.
    pub fn open(path: impl AsRef<Path>, kind: BufKind, memory: MemoryMode) -> Result<Self> {
        let path = path.as_ref();
        let device = V4l2Device::open(path).map_err(|e| Error::Open {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::with_device(Arc::new(device), kind, memory)
    }

    /// Wrap an already opened device, checking its capabilities.
    pub fn with_device(device: Arc<dyn VideoDevice>, kind: BufKind, memory: MemoryMode) -> Result<Self> {
        let caps = device.capabilities().map_err(|e| Error::Open {
            path: format!("fd:{}", device.raw_fd()),
            reason: format!("capability query failed: {e}"),
        })?;

        let supported = match kind {
            BufKind::Capture => caps.capture,
            BufKind::Output | BufKind::Overlay => caps.output,
        };
        if !supported || !caps.streaming {
            return Err(Error::Open {
                path: caps.card,
                reason: format!("no streaming {:?} support", kind),
            });
        }

        info!("{} ({}) ready for {:?}", caps.card, caps.driver, kind);
        Ok(Self {
            device,
            kind,
            memory,
            format: None,
            streaming: false,
        })
    }

    pub fn device(&self) -> &Arc<dyn VideoDevice> {
        &self.device
    }

    pub fn kind(&self) -> BufKind {
        self.kind
    }

    pub fn memory(&self) -> MemoryMode {
        self.memory
    }

    /// Format negotiated by the last [`configure`](Self::configure).
    pub fn format(&self) -> Option<PixFormat> {
        self.format
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// Set the frame format and, for capture, negotiate the frame rate.
    ///
    /// Frame rate is read before it is written since some devices reject a
    /// bare set. Failing to negotiate it is only logged.
    #[instrument(skip(self))]
    pub fn configure(
        &mut self,
        width: u32,
        height: u32,
        format: PixelFormat,
        fps: Option<u32>,
    ) -> Result<PixFormat> {
        let negotiated = self
            .device
            .set_format(self.kind, width, height, format.fourcc())
            .map_err(|e| Error::Config(format!("{}x{} {:?}: {}", width, height, format, e)))?;

        if PixelFormat::from_fourcc(negotiated.fourcc) != Some(format) {
            return Err(Error::Config(format!(
                "device settled on {} instead of {:?}",
                negotiated.fourcc, format
            )));
        }
        if negotiated.width != width || negotiated.height != height {
            warn!(
                "Device adjusted {}x{} to {}x{}",
                width, height, negotiated.width, negotiated.height
            );
        }
        self.format = Some(negotiated);

        if let (BufKind::Capture, Some(fps)) = (self.kind, fps) {
            match self.negotiate_rate(fps) {
                Ok(actual) => debug!("Frame interval {}/{}", actual.numerator, actual.denominator),
                Err(e) => warn!("Frame rate {} not applied: {}", fps, e),
            }
        }
        Ok(negotiated)
    }

    fn negotiate_rate(&self, fps: u32) -> std::io::Result<Fraction> {
        self.device.frame_interval()?;
        self.device.set_frame_interval(Fraction::new(1, fps.max(1)))
    }

    /// Re-apply the current format after the device geometry changed underneath it.
    pub fn reinit_format(&mut self) -> Result<PixFormat> {
        let fmt = self
            .device
            .reset_format(self.kind)
            .map_err(|e| Error::device("reset format", e))?;
        self.format = Some(fmt);
        Ok(fmt)
    }

    /// Ask the device for `count` buffers.
    ///
    /// Capture requires the exact count. Output returns what the device granted.
    #[instrument(skip(self))]
    pub fn request_buffers(&self, count: u32) -> Result<u32> {
        let granted = self
            .device
            .request_buffers(self.kind, self.memory, count)
            .map_err(|e| Error::device("request buffers", e))?;

        if granted != count {
            if self.kind == BufKind::Capture {
                return Err(Error::Buffer(format!(
                    "requested {} capture buffers, device granted {}",
                    count, granted
                )));
            }
            info!("Requested {} output buffers, device granted {}", count, granted);
        }
        Ok(granted)
    }

    /// Hand every buffer back to the driver.
    pub fn release_buffers(&self) -> Result<()> {
        self.device
            .request_buffers(self.kind, self.memory, 0)
            .map_err(|e| Error::device("release buffers", e))?;
        Ok(())
    }

    pub(crate) fn query_buffer(&self, index: u32) -> Result<BufferInfo> {
        self.device
            .query_buffer(self.kind, self.memory, index)
            .map_err(|e| Error::device("query buffer", e))
    }

    pub fn queue(&self, index: u32, user: Option<UserPtr>) -> Result<()> {
        self.device
            .queue(self.kind, self.memory, index, user)
            .map_err(|e| Error::device("queue buffer", e))
    }

    /// Blocks until the device returns a buffer.
    pub fn dequeue(&self) -> Result<BufferInfo> {
        self.device
            .dequeue(self.kind, self.memory)
            .map_err(|e| Error::device("dequeue buffer", e))
    }

    /// Start streaming. A no-op when already on.
    #[instrument(skip(self))]
    pub fn stream_on(&mut self) -> Result<()> {
        if self.streaming {
            debug!("Already streaming");
            return Ok(());
        }
        if self.kind != BufKind::Capture {
            if let Err(e) = self.device.set_blending(Blending::STREAMING) {
                warn!("Overlay blending not applied: {}", e);
            }
        }
        self.device
            .stream_on(self.kind)
            .map_err(|e| Error::device("stream on", e))?;
        self.streaming = true;
        info!("Stream on");
        Ok(())
    }

    /// Stop streaming. A no-op when already off.
    #[instrument(skip(self))]
    pub fn stream_off(&mut self) -> Result<()> {
        if !self.streaming {
            debug!("Already stopped");
            return Ok(());
        }
        if self.kind != BufKind::Capture {
            if let Err(e) = self.device.set_blending(Blending::STOPPED) {
                warn!("Local alpha not cleared: {}", e);
            }
        }
        self.device
            .stream_off(self.kind)
            .map_err(|e| Error::device("stream off", e))?;
        self.streaming = false;
        info!("Stream off");
        Ok(())
    }

    /// Mirror a stream state changed by the cooperating process.
    pub fn sync_streaming(&mut self, streaming: bool) {
        self.streaming = streaming;
    }

    pub fn crop(&self) -> Result<Rect> {
        self.device
            .crop(self.kind)
            .map_err(|e| Error::device("get crop", e))
    }

    pub fn set_crop(&self, rect: Rect) -> Result<()> {
        self.device
            .set_crop(self.kind, rect)
            .map_err(|e| Error::device("set crop", e))
    }

    /// Rotate the output and re-apply the format, which the driver resets.
    pub fn set_rotation(&mut self, degrees: u32) -> Result<()> {
        if !matches!(degrees, 0 | 90 | 180 | 270) {
            return Err(Error::Config(format!("unsupported rotation {}", degrees)));
        }
        self.device
            .set_rotation(degrees)
            .map_err(|e| Error::device("set rotation", e))?;
        self.reinit_format()?;
        Ok(())
    }

    /// The overlay window on the display.
    pub fn position(&self) -> Result<Rect> {
        self.device.window().map_err(|e| Error::device("get window", e))
    }

    pub fn set_position(&self, rect: Rect) -> Result<Rect> {
        self.device
            .set_window(rect)
            .map_err(|e| Error::device("set window", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceCaps, DeviceOp, VirtualDevice};

    fn capture() -> (Arc<VirtualDevice>, DeviceChannel) {
        let dev = Arc::new(VirtualDevice::capture(640, 480, PixelFormat::Yuyv));
        let chan = DeviceChannel::with_device(dev.clone(), BufKind::Capture, MemoryMode::Mmap).unwrap();
        (dev, chan)
    }

    #[test]
    fn rejects_devices_without_streaming() {
        let dev = VirtualDevice::capture(640, 480, PixelFormat::Yuyv).with_caps(DeviceCaps {
            capture: true,
            streaming: false,
            ..Default::default()
        });
        let err = DeviceChannel::with_device(Arc::new(dev), BufKind::Capture, MemoryMode::Mmap);
        assert!(matches!(err, Err(Error::Open { .. })));
    }

    #[test]
    fn rejects_output_only_device_for_capture() {
        let dev = Arc::new(VirtualDevice::output(640, 480, PixelFormat::Uyvy));
        assert!(DeviceChannel::with_device(dev, BufKind::Capture, MemoryMode::Mmap).is_err());
    }

    #[test]
    fn stream_gate_is_idempotent() {
        let (dev, mut chan) = capture();
        chan.configure(640, 480, PixelFormat::Yuyv, None).unwrap();
        chan.request_buffers(3).unwrap();

        chan.stream_off().unwrap();
        assert_eq!(dev.count(DeviceOp::StreamOff), 0);

        chan.stream_on().unwrap();
        chan.stream_on().unwrap();
        assert_eq!(dev.count(DeviceOp::StreamOn), 1);

        chan.stream_off().unwrap();
        chan.stream_off().unwrap();
        assert_eq!(dev.count(DeviceOp::StreamOff), 1);
    }

    #[test]
    fn capture_requires_exact_buffer_count() {
        let (dev, chan) = capture();
        dev.grant_buffers(Some(2));
        assert!(matches!(chan.request_buffers(4), Err(Error::Buffer(_))));
    }

    #[test]
    fn output_accepts_granted_count() {
        let dev = Arc::new(VirtualDevice::output(640, 480, PixelFormat::Uyvy));
        let chan = DeviceChannel::with_device(dev.clone(), BufKind::Output, MemoryMode::Mmap).unwrap();
        dev.grant_buffers(Some(2));
        assert_eq!(chan.request_buffers(3).unwrap(), 2);
    }

    #[test]
    fn frame_rate_failure_is_not_fatal() {
        let (dev, mut chan) = capture();
        dev.fail_next(DeviceOp::SetParm);
        assert!(chan.configure(640, 480, PixelFormat::Yuyv, Some(30)).is_ok());
        assert_eq!(dev.count(DeviceOp::GetParm), 1);
    }

    #[test]
    fn rejected_format_is_a_config_error() {
        let (dev, mut chan) = capture();
        dev.fail_next(DeviceOp::SetFormat);
        let err = chan.configure(640, 480, PixelFormat::Yuyv, None);
        assert!(matches!(err, Err(Error::Config(_))));
    }

    #[test]
    fn rotation_must_be_a_right_angle() {
        let dev = Arc::new(VirtualDevice::output(640, 480, PixelFormat::Uyvy));
        let mut chan = DeviceChannel::with_device(dev.clone(), BufKind::Output, MemoryMode::Mmap).unwrap();
        assert!(matches!(chan.set_rotation(45), Err(Error::Config(_))));
        chan.set_rotation(270).unwrap();
        assert_eq!(dev.rotation(), 270);
        assert_eq!(dev.count(DeviceOp::ResetFormat), 1);
    }

    #[test]
    fn output_stream_applies_blending() {
        let dev = Arc::new(VirtualDevice::output(640, 480, PixelFormat::Uyvy));
        let mut chan = DeviceChannel::with_device(dev.clone(), BufKind::Output, MemoryMode::Mmap).unwrap();
        chan.request_buffers(3).unwrap();
        chan.stream_on().unwrap();
        assert_eq!(dev.blending_flags(), 0x0014);
        chan.stream_off().unwrap();
        assert_eq!(dev.count(DeviceOp::SetBlending), 2);
    }
}
