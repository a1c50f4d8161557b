//! Error taxonomy for the media routing core.
//!
//! Variants map onto the kinds named by the design's error taxonomy rather
//! than onto individual modules, since the path state machine, the format
//! processor, and the recording agent all raise the same handful of
//! well-known failure kinds.

use std::fmt;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Underlying I/O error (recording writer, on-demand process spawn).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An RTP packet exceeded the configured max payload size and the
    /// codec has no decode/re-encode path to shrink it.
    #[error("RTP packet for payload type {payload_type} exceeds max size ({size} > {max})")]
    OversizedPacket {
        payload_type: u8,
        size: usize,
        max: usize,
    },

    /// `describe()` was issued against a path with neither a publisher
    /// nor an on-demand activation configured.
    #[error("path '{0}' has no publisher")]
    NoPublisher(String),

    /// A waiting `describe()` call exceeded the describe timeout.
    #[error("path '{0}' timed out waiting for a publisher")]
    PublisherTimeout(String),

    /// A second publisher attempted to publish with a session description
    /// incompatible with the existing stream.
    #[error("incompatible session description for path '{path}': {reason}")]
    IncompatibleSessionDescription { path: String, reason: String },

    /// No path is registered (static or dynamic) under the requested name.
    #[error("no path configured for '{0}'")]
    PathNotFound(String),

    /// A path already has a publisher attached.
    #[error("path '{0}' already has a publisher")]
    AlreadyPublishing(String),

    /// The media/format pair named in a reader-binding request is not
    /// offered by the stream's session description.
    #[error("media/format not offered by stream '{0}'")]
    UnsupportedFormat(String),

    /// Recording-agent write failure. Logged and retried, not propagated
    /// as a hard stop — the agent restarts after a backoff.
    #[error("recording write error on '{path}': {source}")]
    RecordingWrite {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// A configured on-demand (`runOnDemand`, `runOnInit`, ...) command
    /// failed to spawn.
    #[error("failed to spawn on-demand command '{command}': {source}")]
    CommandSpawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// Malformed path configuration (bad regex, conflicting path names).
    #[error("invalid path configuration: {0}")]
    InvalidConfig(String),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Soft decode outcomes from a codec-specific RTP decoder. Distinguished
/// from a hard [`CoreError`] because they produce "success, no output"
/// rather than failing the unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeMiss {
    /// The decoder received a continuation/fragment packet before seeing
    /// the start of an access unit.
    NonStartingPacket,
    /// The decoder has buffered a partial access unit and needs more RTP
    /// packets before it can emit one.
    MorePacketsNeeded,
}

impl fmt::Display for DecodeMiss {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NonStartingPacket => write!(f, "non-starting packet"),
            Self::MorePacketsNeeded => write!(f, "more packets needed"),
        }
    }
}
