//! Capture to overlay preview
//!
//! Frames are pulled by a pinned capture pump, handed over a bounded channel
//! and queued into the display overlay.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use color_eyre::{eyre::eyre, Result};
use flume::{bounded, Receiver, RecvTimeoutError};
use tracing::{debug, error, info, warn};

use overlay_pipeline::capture::{
    CaptureRing, Frame, FrameMetadata, FrameScaler, GrabStatus, NearestScaler, PixelConverter,
    PixelFormat, Yuyv422ToRgb565,
};
use overlay_pipeline::device::{BufKind, DeviceChannel, V4l2Device, VideoDevice, VirtualDevice};
use overlay_pipeline::overlay::{OutputRing, OverlayControl};
use overlay_pipeline::{Config, Error, PipelineStats, CONFIG, VIRTUAL_DEVICE};

#[derive(Default)]
struct PreviewCounters {
    displayed: AtomicU64,
    flushes: AtomicU64,
}

fn open_device(path: &str, virtual_dev: impl FnOnce() -> VirtualDevice) -> Result<Arc<dyn VideoDevice>> {
    if path == VIRTUAL_DEVICE {
        info!("Using in-memory device");
        return Ok(Arc::new(virtual_dev()));
    }
    let device = V4l2Device::open(path).map_err(|e| eyre!("{}: {}", path, e))?;
    Ok(Arc::new(device))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter("overlay_pipeline=debug")
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("Overlay pipeline launching...");

    let config_path = std::env::args_os().nth(1);
    let config = Config::load(config_path.as_deref().map(Path::new))?;
    CONFIG.store(Arc::new(config.clone()));
    let (cap, ovl) = (&config.capture, &config.overlay);

    // Capture side
    let capture_dev = open_device(&cap.device, || {
        VirtualDevice::capture(cap.width, cap.height, cap.format)
    })?;
    let pace = (cap.device == VIRTUAL_DEVICE).then(|| Duration::from_secs(1) / cap.fps.max(1));
    let channel = DeviceChannel::with_device(capture_dev, BufKind::Capture, cap.memory)?;
    let mut ring = CaptureRing::with_channel(channel, cap)?;
    ring.start()?;
    let capture_stats = ring.stats();

    let (tx, rx) = bounded::<Frame>(config.pipeline.channel_capacity);
    let (width, height, format) = (ring.width(), ring.height(), ring.format());
    let mut sequence = 0u64;
    ring.set_frame_callback(Box::new(move |data, timestamp| {
        sequence += 1;
        let frame = Frame {
            data: Bytes::copy_from_slice(data),
            meta: Arc::new(FrameMetadata {
                sequence,
                width,
                height,
                stride: width * format.bytes_per_pixel(),
                format,
                device_timestamp: Some(Duration::from_nanos(timestamp)),
            }),
            timestamp: Instant::now(),
        };
        if tx.try_send(frame).is_err() {
            debug!("Preview behind, frame {} skipped", sequence);
        }
    }));

    // Overlay side
    let overlay_dev = open_device(&ovl.device, || {
        VirtualDevice::output(ovl.width, ovl.height, ovl.format)
    })?;
    let mut control = OverlayControl::with_device(overlay_dev.clone(), ovl.memory);
    let handle = control.create_overlay(ovl.width, ovl.height, Some(ovl.format))?;
    control.set_rotation(ovl.rotation)?;
    control.set_position(ovl.position.left, ovl.position.top, ovl.position.width, ovl.position.height)?;
    control.commit()?;
    let output = OutputRing::initialize(overlay_dev, &handle, ovl.memory)?;

    let running = Arc::new(AtomicBool::new(true));
    let counters = Arc::new(PreviewCounters::default());

    // Spawn capture pump
    let pump = {
        let running = running.clone();
        let pin_core = cap.pin_core;
        tokio::task::spawn_blocking(move || {
            if let Some(id) = pin_core {
                if !core_affinity::set_for_current(core_affinity::CoreId { id }) {
                    warn!("Could not pin capture pump to core {}", id);
                }
            }
            let mut dest = vec![0u8; ring.frame_size()];
            while running.load(Ordering::Relaxed) {
                match ring.grab_frame(&mut dest, width, height) {
                    Ok(GrabStatus::Dropped) => std::thread::sleep(Duration::from_millis(10)),
                    Ok(_) => {}
                    Err(e) if e.is_fatal() => {
                        error!("Capture failed: {}", e);
                        break;
                    }
                    Err(e) => warn!("Capture error: {}", e),
                }
                if let Some(pace) = pace {
                    std::thread::sleep(pace);
                }
            }
            if let Err(e) = ring.uninit() {
                warn!("Capture teardown failed: {}", e);
            }
        })
    };

    // Spawn preview
    let preview = {
        let running = running.clone();
        let counters = counters.clone();
        tokio::task::spawn_blocking(move || preview(output, rx, &running, &counters))
    };

    // Periodic summary
    let interval = Duration::from_secs(config.pipeline.stats_interval_secs.max(1));
    let reporter = {
        let counters = counters.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let stats = PipelineStats {
                    frames_captured: capture_stats.frames(),
                    frames_dropped: capture_stats.dropped(),
                    frames_displayed: counters.displayed.load(Ordering::Relaxed),
                    flushes: counters.flushes.load(Ordering::Relaxed),
                };
                info!("{:?}", stats);
            }
        })
    };

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    running.store(false, Ordering::Relaxed);
    reporter.abort();

    pump.await?;
    if let Err(e) = preview.await? {
        error!("Preview failed: {}", e);
    }
    control.destroy_overlay()?;

    info!("Overlay pipeline stopped");
    Ok(())
}

fn preview(
    mut output: OutputRing,
    rx: Receiver<Frame>,
    running: &AtomicBool,
    counters: &PreviewCounters,
) -> overlay_pipeline::Result<()> {
    let mut free: VecDeque<_> = output.available_slots().into();
    let (width, height, format) = (output.width(), output.height(), output.format());

    while running.load(Ordering::Relaxed) {
        let frame = match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(frame) => frame,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        if free.is_empty() {
            match output.dequeue_buffer() {
                Ok(slot) => free.push_back(slot),
                Err(e) if e.is_flush() => {
                    counters.flushes.fetch_add(1, Ordering::Relaxed);
                    free = output.available_slots().into();
                }
                Err(Error::WouldBlock) => {
                    debug!("Overlay not streaming, frame {} skipped", frame.meta.sequence);
                    continue;
                }
                Err(e) => {
                    warn!("Dequeue failed: {}", e);
                    continue;
                }
            }
        }
        let Some(slot) = free.pop_front() else {
            continue;
        };

        render(&frame, output.buffer_mut(slot)?, width, height, format);
        match output.queue_buffer(slot) {
            Ok(depth) => {
                counters.displayed.fetch_add(1, Ordering::Relaxed);
                debug!("Frame {} queued, depth {}", frame.meta.sequence, depth);
            }
            Err(e) if e.is_flush() => {
                counters.flushes.fetch_add(1, Ordering::Relaxed);
                free = output.available_slots().into();
            }
            Err(e) => {
                warn!("Queue failed: {}", e);
                free.push_back(slot);
            }
        }
    }

    output.close()
}

/// Copy a captured frame into an overlay buffer of `width`x`height` in `format`.
fn render(frame: &Frame, dst: &mut [u8], width: u32, height: u32, format: PixelFormat) {
    let meta = &frame.meta;
    let scaled;
    let src = if (meta.width, meta.height) == (width, height) {
        &frame.data[..]
    } else {
        let mut buf = vec![0u8; meta.format.frame_size(width, height)];
        NearestScaler.scale(&frame.data, meta.width, meta.height, &mut buf, width, height);
        scaled = buf;
        &scaled[..]
    };

    match (meta.format, format) {
        (from, to) if from == to => {
            let n = src.len().min(dst.len());
            dst[..n].copy_from_slice(&src[..n]);
        }
        (PixelFormat::Yuyv, PixelFormat::Rgb565) => Yuyv422ToRgb565.convert(src, dst, width, height),
        (PixelFormat::Yuyv, PixelFormat::Uyvy) | (PixelFormat::Uyvy, PixelFormat::Yuyv) => {
            // Same samples, luma and chroma bytes trade places
            for (out, px) in dst.chunks_exact_mut(2).zip(src.chunks_exact(2)) {
                out[0] = px[1];
                out[1] = px[0];
            }
        }
        (from, to) => debug!("No conversion from {:?} to {:?}", from, to),
    }
}
