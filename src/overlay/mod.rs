//! Display overlay shared between a geometry-owning and a frame-owning side
//!
//! [`OverlayControl`] creates the overlay and places it on screen.
//! [`OutputRing`] attaches through the [`OverlayHandle`] and feeds it frames.
//! Both serialize on the [`SharedControlBlock`] mutex.

pub mod control;
pub mod coordinator;
pub mod handle;
pub mod output;
pub mod shared;

pub use control::OverlayControl;
pub use coordinator::{disable_streaming, enable_streaming, EnableOutcome, StreamState};
pub use handle::OverlayHandle;
pub use output::{BufferMapping, OutputRing};
pub use shared::{SharedControlBlock, SharedGuard, SharedState};
