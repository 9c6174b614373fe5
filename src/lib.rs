pub mod buffer;
pub mod capture;
pub mod device;
pub mod error;
pub mod overlay;
pub mod utils;

use std::path::Path;

use arc_swap::ArcSwap;
use capture::frame::PixelFormat;
use device::{MemoryMode, Rect};
use serde::{Deserialize, Serialize};

pub use error::{Error, Result};

/// Global configuration that can be atomically swapped at runtime
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<Config>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// Device path selecting the in-memory [`VirtualDevice`](device::VirtualDevice).
pub const VIRTUAL_DEVICE: &str = "virtual";

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub overlay: OverlayConfig,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub format: PixelFormat,
    pub buffer_count: u32,
    pub memory: MemoryMode,
    /// Core the capture pump is pinned to
    pub pin_core: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayConfig {
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Window on the display, before rotation
    pub position: Rect,
    pub rotation: u32,
    pub memory: MemoryMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Frames buffered between the capture pump and the preview
    pub channel_capacity: usize,
    pub stats_interval_secs: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: "/dev/video0".into(),
            width: 640,
            height: 480,
            fps: 30,
            format: PixelFormat::Yuyv,
            buffer_count: buffer::DEFAULT_CAPTURE_BUFFERS,
            memory: MemoryMode::Mmap,
            pin_core: None,
        }
    }
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            device: "/dev/video1".into(),
            width: 640,
            height: 480,
            format: PixelFormat::Uyvy,
            position: Rect::new(0, 0, 640, 480),
            rotation: overlay::control::DEFAULT_ROTATION,
            memory: MemoryMode::Mmap,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 4,
            stats_interval_secs: 5,
        }
    }
}

impl Config {
    /// Defaults, then the optional TOML file, then `OVERLAY_PIPELINE__*` variables.
    pub fn load(path: Option<&Path>) -> std::result::Result<Self, config::ConfigError> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Config::default())?);
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder
            .add_source(
                config::Environment::with_prefix("OVERLAY_PIPELINE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}

/// Counters summarised periodically by the binary
#[derive(Debug, Default, Clone, Copy)]
pub struct PipelineStats {
    pub frames_captured: u64,
    pub frames_dropped: u64,
    pub frames_displayed: u64,
    pub flushes: u64,
}
