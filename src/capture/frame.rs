use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use v4l::FourCC;

/// Frame data with zero-copy semantics
#[derive(Clone)]
pub struct Frame {
    /// Immutable frame data - can be shared across threads without copying
    pub data: Bytes,

    /// Frame metadata
    pub meta: Arc<FrameMetadata>,

    /// Delivery timestamp for latency tracking
    pub timestamp: Instant,
}

/// Frame metadata
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub format: PixelFormat,
    pub device_timestamp: Option<Duration>, // Hardware timestamp if available
}

/// Pixel formats the rings accept. All are packed 16 bits per pixel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    /// YCbYCr 4:2:2 interleaved
    Yuyv,
    /// CbYCrY 4:2:2 interleaved
    Uyvy,
    Rgb565,
}

impl PixelFormat {
    pub fn fourcc(self) -> FourCC {
        match self {
            PixelFormat::Yuyv => FourCC::new(b"YUYV"),
            PixelFormat::Uyvy => FourCC::new(b"UYVY"),
            PixelFormat::Rgb565 => FourCC::new(b"RGBP"),
        }
    }

    pub fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"YUYV" => Some(PixelFormat::Yuyv),
            b"UYVY" => Some(PixelFormat::Uyvy),
            b"RGBP" => Some(PixelFormat::Rgb565),
            _ => None,
        }
    }

    pub fn bytes_per_pixel(self) -> u32 {
        2
    }

    pub fn frame_size(self, width: u32, height: u32) -> usize {
        width as usize * height as usize * self.bytes_per_pixel() as usize
    }

    /// Whether frames of this format can go through the macropixel scaler.
    pub fn is_yuv422(self) -> bool {
        matches!(self, PixelFormat::Yuyv | PixelFormat::Uyvy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fourcc_round_trips_through_the_whitelist() {
        for fmt in [PixelFormat::Yuyv, PixelFormat::Uyvy, PixelFormat::Rgb565] {
            assert_eq!(PixelFormat::from_fourcc(fmt.fourcc()), Some(fmt));
        }
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"MJPG")), None);
    }

    #[test]
    fn frame_size_is_two_bytes_per_pixel() {
        assert_eq!(PixelFormat::Yuyv.frame_size(640, 480), 640 * 480 * 2);
    }

    #[test]
    fn frame_size_does_not_wrap_for_huge_geometry() {
        assert_eq!(PixelFormat::Uyvy.frame_size(65536, 65536), 65536 * 65536 * 2);
    }

    #[test]
    fn only_422_formats_scale() {
        assert!(PixelFormat::Yuyv.is_yuv422());
        assert!(PixelFormat::Uyvy.is_yuv422());
        assert!(!PixelFormat::Rgb565.is_yuv422());
    }
}
