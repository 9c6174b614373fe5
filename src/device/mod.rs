//! Streaming video devices and the channel wrapping their control calls

pub mod channel;
pub mod v4l2;
pub mod virtual_dev;

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use memmap2::MmapMut;
use serde::{Deserialize, Serialize};
use v4l::{buffer::Type, memory::Memory, Fraction, FourCC};

pub use channel::DeviceChannel;
pub use v4l2::V4l2Device;
pub use virtual_dev::{DeviceOp, VirtualDevice};

/// Which queue of the device a call addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufKind {
    Capture,
    Output,
    /// The overlay window placed on the display.
    Overlay,
}

impl BufKind {
    pub fn raw(self) -> u32 {
        match self {
            BufKind::Capture => Type::VideoCapture as u32,
            BufKind::Output => Type::VideoOutput as u32,
            BufKind::Overlay => Type::VideoOverlay as u32,
        }
    }
}

/// How buffer memory is provided to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MemoryMode {
    /// Driver-allocated buffers mapped into the process.
    #[default]
    Mmap,
    /// Process-allocated buffers handed to the driver by address.
    UserPtr,
}

impl MemoryMode {
    pub fn raw(self) -> u32 {
        match self {
            MemoryMode::Mmap => Memory::Mmap as u32,
            MemoryMode::UserPtr => Memory::UserPtr as u32,
        }
    }
}

/// The capability bits the rings care about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceCaps {
    pub driver: String,
    pub card: String,
    pub capture: bool,
    pub output: bool,
    pub streaming: bool,
}

/// Negotiated single-plane format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixFormat {
    pub width: u32,
    pub height: u32,
    pub fourcc: FourCC,
    pub bytes_per_line: u32,
    pub size_image: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(left: i32, top: i32, width: u32, height: u32) -> Self {
        Self {
            left,
            top,
            width,
            height,
        }
    }
}

/// A buffer as described by QUERYBUF / DQBUF.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferInfo {
    pub index: u32,
    pub length: u32,
    pub offset: u32,
    pub bytes_used: u32,
    pub timestamp: Duration,
    pub mapped: bool,
}

/// User-pointer memory handed to the device on queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserPtr {
    pub addr: usize,
    pub len: usize,
}

/// Framebuffer blending applied to an output overlay around stream on/off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Blending {
    pub local_alpha: bool,
    pub global_alpha: Option<u8>,
    pub chroma_key: Option<u32>,
}

impl Blending {
    /// Opaque overlay keyed on black, used while streaming.
    pub const STREAMING: Blending = Blending {
        local_alpha: false,
        global_alpha: Some(255),
        chroma_key: Some(0),
    };

    /// Only local alpha is cleared before stream off.
    pub const STOPPED: Blending = Blending {
        local_alpha: false,
        global_alpha: None,
        chroma_key: None,
    };

    const FLAG_CHROMAKEY: u32 = 0x0004;
    const FLAG_LOCAL_ALPHA: u32 = 0x0008;
    const FLAG_GLOBAL_ALPHA: u32 = 0x0010;

    /// Framebuffer flags after applying this blending. `None` leaves a flag untouched.
    pub fn apply_flags(self, flags: u32) -> u32 {
        let mut flags = if self.local_alpha {
            flags | Self::FLAG_LOCAL_ALPHA
        } else {
            flags & !Self::FLAG_LOCAL_ALPHA
        };
        if self.global_alpha.is_some() {
            flags |= Self::FLAG_GLOBAL_ALPHA;
        }
        if self.chroma_key.is_some() {
            flags |= Self::FLAG_CHROMAKEY;
        }
        flags
    }
}

/// Raw device calls. One method per ioctl the rings issue.
///
/// Implementations are shared between the capture/output ring and, for
/// overlays, the geometry-owning side, so every call takes `&self`.
pub trait VideoDevice: Send + Sync {
    /// Descriptor passed to the frame-owning side, `-1` if there is none.
    fn raw_fd(&self) -> RawFd;

    fn capabilities(&self) -> io::Result<DeviceCaps>;

    fn format(&self, kind: BufKind) -> io::Result<PixFormat>;

    /// Apply `width`, `height` and `fourcc` on top of the current format.
    fn set_format(&self, kind: BufKind, width: u32, height: u32, fourcc: FourCC)
        -> io::Result<PixFormat>;

    /// Re-apply the current format, needed after a rotation change.
    fn reset_format(&self, kind: BufKind) -> io::Result<PixFormat>;

    fn frame_interval(&self) -> io::Result<Fraction>;

    fn set_frame_interval(&self, interval: Fraction) -> io::Result<Fraction>;

    /// Returns the count the driver actually allocated.
    fn request_buffers(&self, kind: BufKind, memory: MemoryMode, count: u32) -> io::Result<u32>;

    fn query_buffer(&self, kind: BufKind, memory: MemoryMode, index: u32) -> io::Result<BufferInfo>;

    fn map_buffer(&self, info: &BufferInfo) -> io::Result<MmapMut>;

    fn queue(
        &self,
        kind: BufKind,
        memory: MemoryMode,
        index: u32,
        user: Option<UserPtr>,
    ) -> io::Result<()>;

    /// Blocks until the device hands a buffer back.
    fn dequeue(&self, kind: BufKind, memory: MemoryMode) -> io::Result<BufferInfo>;

    fn stream_on(&self, kind: BufKind) -> io::Result<()>;

    fn stream_off(&self, kind: BufKind) -> io::Result<()>;

    fn crop(&self, kind: BufKind) -> io::Result<Rect>;

    fn set_crop(&self, kind: BufKind, rect: Rect) -> io::Result<()>;

    fn set_rotation(&self, degrees: u32) -> io::Result<()>;

    /// Overlay window on the display.
    fn window(&self) -> io::Result<Rect>;

    fn set_window(&self, rect: Rect) -> io::Result<Rect>;

    fn set_blending(&self, blending: Blending) -> io::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn streaming_blend_enables_keying_and_global_alpha() {
        let flags = Blending::STREAMING.apply_flags(0x0008);
        assert_eq!(flags & 0x0008, 0);
        assert_eq!(flags & 0x0010, 0x0010);
        assert_eq!(flags & 0x0004, 0x0004);
    }

    #[test]
    fn stopped_blend_only_clears_local_alpha() {
        assert_eq!(Blending::STOPPED.apply_flags(0x001c), 0x0014);
    }
}
