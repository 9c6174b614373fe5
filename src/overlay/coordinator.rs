//! When the overlay device may stream
//!
//! Every function here expects the shared mutex to be held, which the
//! [`SharedGuard`] argument proves. Streaming is only enabled once both
//! sides are ready, and any stream off flushes all queued buffers.

use tracing::{debug, info, warn};

use super::shared::{SharedGuard, SharedState};
use crate::device::DeviceChannel;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnableOutcome {
    Enabled,
    AlreadyEnabled,
    /// One side is not ready yet; streaming starts on a later attempt.
    Postponed,
}

/// Overlay stream state derived from the shared flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    ControlReady,
    DataReady,
    /// Both sides are ready but the stream is off.
    Ready,
    Streaming,
}

impl From<SharedState> for StreamState {
    fn from(s: SharedState) -> Self {
        match (s.stream_en, s.control_ready, s.data_ready) {
            (true, _, _) => StreamState::Streaming,
            (false, true, true) => StreamState::Ready,
            (false, true, false) => StreamState::ControlReady,
            (false, false, true) => StreamState::DataReady,
            (false, false, false) => StreamState::Idle,
        }
    }
}

/// Turn streaming on if both sides are ready.
pub fn enable_streaming(guard: &mut SharedGuard<'_>, channel: &mut DeviceChannel) -> Result<EnableOutcome> {
    if guard.stream_en() {
        channel.sync_streaming(true);
        return Ok(EnableOutcome::AlreadyEnabled);
    }
    if !guard.control_ready() || !guard.data_ready() {
        info!(
            "Postponing stream enable: control_ready={} data_ready={}",
            guard.control_ready(),
            guard.data_ready()
        );
        return Ok(EnableOutcome::Postponed);
    }

    // The other side may have stopped the device through its own descriptor
    channel.sync_streaming(false);
    if let Err(e) = channel.stream_on() {
        warn!("Stream enable failed: {}", e);
        return Err(e);
    }
    guard.set_stream_en(true);
    Ok(EnableOutcome::Enabled)
}

/// Turn streaming off, flushing every queued buffer. Returns whether a
/// stream off was issued.
pub fn disable_streaming(guard: &mut SharedGuard<'_>, channel: &mut DeviceChannel) -> Result<bool> {
    if !guard.stream_en() {
        channel.sync_streaming(false);
        return Ok(false);
    }

    channel.sync_streaming(true);
    channel.stream_off()?;
    guard.set_streaming_reset(true);
    guard.set_stream_en(false);
    // Buffers are gone, the data side has to queue again
    guard.set_data_ready(false);
    metrics::counter!("overlay_stream_flushes_total").increment(1);
    debug!("Streaming disabled, buffers flushed");
    Ok(true)
}

/// Apply a geometry change between a stream off and a stream on.
///
/// A failing change is returned without re-enabling.
pub fn reconfigure<T>(
    guard: &mut SharedGuard<'_>,
    channel: &mut DeviceChannel,
    change: impl FnOnce(&mut DeviceChannel) -> Result<T>,
) -> Result<T> {
    disable_streaming(guard, channel)?;
    let out = change(channel)?;
    enable_streaming(guard, channel)?;
    Ok(out)
}
