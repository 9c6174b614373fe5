pub mod convert;
pub mod frame;
pub mod ring;

pub use convert::{FrameScaler, NearestScaler, PixelConverter, Yuyv422ToRgb565};
pub use frame::{Frame, FrameMetadata, PixelFormat};
pub use ring::{CaptureRing, CaptureStats, FpsCounter, FrameCallback, GrabStatus};
