use std::os::fd::RawFd;

use serde::{Deserialize, Serialize};

use crate::capture::PixelFormat;

/// Everything the frame-owning side needs to attach to an overlay.
///
/// Created by [`OverlayControl::create_overlay`](super::OverlayControl::create_overlay).
/// Descriptors are only meaningful in a process that received them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverlayHandle {
    pub ctl_fd: RawFd,
    pub shared_fd: RawFd,
    pub resizer_fd: Option<RawFd>,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Buffers the device actually granted.
    pub num_buffers: u32,
    pub shared_size: usize,
}

