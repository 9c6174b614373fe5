//! Error taxonomy for the capture and overlay rings

use std::io;

use thiserror::Error;

/// Errors surfaced by devices, buffer pools and the stream coordinator.
#[derive(Error, Debug)]
pub enum Error {
    /// Device missing or lacking a required capability. Fatal to the pipeline.
    #[error("failed to open {path}: {reason}")]
    Open { path: String, reason: String },

    /// Format or geometry rejected by the device. May be retried.
    #[error("configuration rejected: {0}")]
    Config(String),

    /// Mapping failure or buffer count mismatch. The pool must be rebuilt.
    #[error("buffer pool: {0}")]
    Buffer(String),

    /// A single queue/dequeue/control call failed.
    #[error("{op} failed: {source}")]
    DeviceCall {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    /// Not a failure: every buffer queued before a stream off is lost.
    #[error("all queued buffers were flushed by a stream off")]
    StreamFlushed,

    /// The device is not streaming, a dequeue would never complete.
    #[error("device is not streaming")]
    WouldBlock,

    #[error("slot index {index} out of range for a pool of {count}")]
    SlotIndex { index: usize, count: usize },

    #[error("slot reference belongs to a different buffer pool")]
    ForeignSlot,

    /// Geometry may only change before the first crop or queue.
    #[error("geometry is fixed once a crop or queue has happened")]
    GeometryLocked,

    #[error("overlay already in use")]
    InUse,

    #[error("shared control block: {0}")]
    SharedBlock(String),

    #[error("overlay not initialized")]
    NotInitialized,

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    pub(crate) fn device(op: &'static str, source: io::Error) -> Self {
        Self::DeviceCall { op, source }
    }

    /// Setup failures that prevent the pipeline from starting at all.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Open { .. } | Error::Buffer(_) | Error::SharedBlock(_)
        )
    }

    /// The coordination signal telling a producer to reset its bookkeeping.
    pub fn is_flush(&self) -> bool {
        matches!(self, Error::StreamFlushed)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_fatal_and_flush() {
        assert!(Error::Buffer("count".into()).is_fatal());
        assert!(Error::SharedBlock("marker".into()).is_fatal());
        assert!(!Error::StreamFlushed.is_fatal());
        assert!(Error::StreamFlushed.is_flush());
        assert!(!Error::WouldBlock.is_flush());
    }

    #[test]
    fn device_call_keeps_source() {
        let err = Error::device("qbuf", io::Error::from_raw_os_error(libc::EINVAL));
        assert!(err.to_string().starts_with("qbuf failed"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
