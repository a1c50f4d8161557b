//! # streamcore — core engine for a multi-protocol live media router
//!
//! The protocol-facing surface (RTSP/RTMP/WebRTC/HLS signaling) lives
//! outside this crate; `streamcore` is everything those front ends share:
//! path lifecycle, stream fan-out, per-codec RTP packetization, and
//! recording to disk.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │  Protocol front ends (not in this crate)      │
//! ├──────────────────────────────────────────────┤
//! │  path      — PathManager, Path state machine │
//! │  stream    — Stream fan-out, reader queues   │
//! │  format    — per-codec RTP processors        │
//! │  record    — fMP4/MPEG-TS segment writer,    │
//! │              retention cleaner               │
//! ├──────────────────────────────────────────────┤
//! │  unit      — Unit/Media/Format data model    │
//! │  config    — path/recording configuration    │
//! │  error     — CoreError taxonomy              │
//! │  logging   — rate-limited log gate           │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```no_run
//! use streamcore::config::Config;
//! use streamcore::path::manager::PathManager;
//!
//! let config = Config::from_toml_str("[[paths]]\nname = \"cam1\"\n")?;
//! let manager = PathManager::new(config, 0)?;
//! let _ = manager.resolve("cam1");
//! # Ok::<(), streamcore::error::CoreError>(())
//! ```
//!
//! ## Crate layout
//!
//! - [`path`] — [`path::Path`] state machine and [`path::manager::PathManager`].
//! - [`stream`] — [`stream::Stream`] fan-out engine and reader queues.
//! - [`format`] — [`format::FormatProcessor`] trait and per-codec implementations.
//! - [`record`] — recording agent, segment writers, and the retention cleaner.
//! - [`unit`] — [`unit::Unit`], [`unit::Media`], [`unit::Format`] data model.
//! - [`config`] — [`config::Config`] and path-level configuration.
//! - [`error`] — [`error::CoreError`] and [`error::Result`] alias.
//! - [`logging`] — [`logging::RateLimiter`] rate-gated log emission.

pub mod config;
pub mod error;
pub mod format;
pub mod logging;
pub mod path;
pub mod record;
pub mod stream;
pub mod unit;

pub use error::{CoreError, Result};
pub use path::manager::PathManager;
pub use stream::Stream;
pub use unit::{Codec, Format, Media, MediaKind, Unit};
