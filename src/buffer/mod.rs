//! Fixed pools of device buffers

pub mod pool;

pub use pool::{BufferPool, BufferSlot, SlotRef, SlotState};

/// Buffers requested for a capture ring.
pub const DEFAULT_CAPTURE_BUFFERS: u32 = 4;

/// Buffers requested for an overlay; the device may grant fewer.
pub const DEFAULT_OVERLAY_BUFFERS: u32 = 3;
