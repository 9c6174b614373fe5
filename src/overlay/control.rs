//! Geometry-owning side of an overlay: creation, position and rotation

use std::path::Path;
use std::sync::Arc;

use tracing::{error, info, instrument};

use super::coordinator::{self, EnableOutcome};
use super::handle::OverlayHandle;
use super::shared::SharedControlBlock;
use crate::buffer::DEFAULT_OVERLAY_BUFFERS;
use crate::capture::PixelFormat;
use crate::device::{BufKind, DeviceChannel, MemoryMode, Rect, V4l2Device, VideoDevice};
use crate::error::{Error, Result};

/// Rotation the overlay starts in. It has to be set before any other
/// overlay call so it can be changed later.
pub const DEFAULT_ROTATION: u32 = 90;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Placement {
    window: Rect,
    rotation: u32,
}

impl Placement {
    /// Position as the device expects it: axes swap for quarter turns.
    fn device_window(self) -> Rect {
        match self.rotation {
            90 | 270 => Rect::new(
                self.window.top,
                self.window.left,
                self.window.height,
                self.window.width,
            ),
            _ => self.window,
        }
    }
}

struct Overlay {
    channel: DeviceChannel,
    shared: SharedControlBlock,
    handle: OverlayHandle,
    applied: Placement,
    staged: Placement,
}

/// Creates the overlay and owns its placement on screen.
///
/// Position and rotation changes are staged and only reach the device on
/// [`commit`](Self::commit).
pub struct OverlayControl {
    device: Arc<dyn VideoDevice>,
    memory: MemoryMode,
    overlay: Option<Overlay>,
}

impl OverlayControl {
    pub fn open(path: impl AsRef<Path>, memory: MemoryMode) -> Result<Self> {
        let path = path.as_ref();
        let device = V4l2Device::open(path).map_err(|e| Error::Open {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self::with_device(Arc::new(device), memory))
    }

    pub fn with_device(device: Arc<dyn VideoDevice>, memory: MemoryMode) -> Self {
        Self {
            device,
            memory,
            overlay: None,
        }
    }

    /// Create the overlay and the shared block the frame side attaches to.
    ///
    /// `format` defaults to UYVY. Only one overlay may exist at a time.
    #[instrument(skip(self))]
    pub fn create_overlay(
        &mut self,
        width: u32,
        height: u32,
        format: Option<PixelFormat>,
    ) -> Result<OverlayHandle> {
        if self.overlay.is_some() {
            error!("Overlay already in use");
            return Err(Error::InUse);
        }
        let format = format.unwrap_or(PixelFormat::Uyvy);

        let shared = SharedControlBlock::create()?;
        let mut channel = DeviceChannel::with_device(self.device.clone(), BufKind::Output, self.memory)?;
        channel.configure(width, height, format, None)?;
        channel.set_rotation(DEFAULT_ROTATION)?;
        channel.set_crop(Rect::new(0, 0, width, height))?;
        let num_buffers = channel.request_buffers(DEFAULT_OVERLAY_BUFFERS)?;

        {
            let mut guard = shared.lock()?;
            guard.set_control_ready(false);
            guard.set_stream_en(false);
            guard.set_streaming_reset(false);
        }

        let handle = OverlayHandle {
            ctl_fd: self.device.raw_fd(),
            shared_fd: shared.raw_fd(),
            resizer_fd: None,
            width,
            height,
            format,
            num_buffers,
            shared_size: shared.size(),
        };
        info!(
            "Overlay created: {}x{} {:?}, {} buffers, shared fd={} size={}",
            width, height, format, num_buffers, handle.shared_fd, handle.shared_size
        );

        let placement = Placement {
            window: Rect::default(),
            rotation: DEFAULT_ROTATION,
        };
        self.overlay = Some(Overlay {
            channel,
            shared,
            handle: handle.clone(),
            applied: placement,
            staged: placement,
        });
        Ok(handle)
    }

    pub fn handle(&self) -> Option<&OverlayHandle> {
        self.overlay.as_ref().map(|o| &o.handle)
    }

    pub fn shared(&self) -> Option<&SharedControlBlock> {
        self.overlay.as_ref().map(|o| &o.shared)
    }

    fn overlay_mut(&mut self) -> Result<&mut Overlay> {
        self.overlay.as_mut().ok_or(Error::NotInitialized)
    }

    /// Stage a new window position in display coordinates.
    pub fn set_position(&mut self, left: i32, top: i32, width: u32, height: u32) -> Result<()> {
        self.overlay_mut()?.staged.window = Rect::new(left, top, width, height);
        Ok(())
    }

    /// Stage a rotation of 0, 90, 180 or 270 degrees.
    pub fn set_rotation(&mut self, degrees: u32) -> Result<()> {
        if !matches!(degrees, 0 | 90 | 180 | 270) {
            return Err(Error::Config(format!("unsupported rotation {}", degrees)));
        }
        self.overlay_mut()?.staged.rotation = degrees;
        Ok(())
    }

    /// Apply the staged position and rotation.
    ///
    /// Marks the control side ready. When the staged placement is already
    /// applied the only possible device call is the postponed stream on.
    #[instrument(skip(self))]
    pub fn commit(&mut self) -> Result<()> {
        let Overlay {
            channel,
            shared,
            applied,
            staged,
            ..
        } = self.overlay.as_mut().ok_or(Error::NotInitialized)?;

        let mut guard = shared.lock()?;
        guard.set_control_ready(true);

        let target = Placement {
            window: staged.device_window(),
            rotation: staged.rotation,
        };
        if target == *applied {
            info!("Placement unchanged, nothing to commit");
            // The frame side may have been waiting on this side only
            coordinator::enable_streaming(&mut guard, channel)?;
            return Ok(());
        }
        info!(
            "Placement {:?} rotated {} as window {:?}",
            staged.window, target.rotation, target.window
        );

        coordinator::disable_streaming(&mut guard, channel)?;
        if target.rotation != applied.rotation {
            channel.set_rotation(target.rotation)?;
            applied.rotation = target.rotation;
        }
        if target.window != applied.window {
            channel.set_position(target.window)?;
            applied.window = target.window;
        }
        if coordinator::enable_streaming(&mut guard, channel)? == EnableOutcome::Postponed {
            info!("Stream resumes once the frame side queues again");
        }
        Ok(())
    }

    /// The window as the device currently reports it.
    pub fn get_position(&self) -> Result<Rect> {
        let overlay = self.overlay.as_ref().ok_or(Error::NotInitialized)?;
        overlay.channel.position()
    }

    /// Stop streaming and release this side's hold on the shared block.
    pub fn destroy_overlay(&mut self) -> Result<()> {
        let Some(mut overlay) = self.overlay.take() else {
            return Ok(());
        };
        {
            let mut guard = overlay.shared.lock()?;
            if let Err(e) = coordinator::disable_streaming(&mut guard, &mut overlay.channel) {
                error!("Stream off while destroying overlay failed: {}", e);
            }
        }
        info!("Overlay destroyed");
        Ok(())
    }
}

impl Drop for OverlayControl {
    fn drop(&mut self) {
        if let Err(e) = self.destroy_overlay() {
            error!("Failed to destroy overlay: {}", e);
        }
    }
}
