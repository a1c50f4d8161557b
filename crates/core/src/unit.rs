//! The media data model: [`Unit`], [`Media`], [`Format`].
//!
//! A [`Unit`] is the only thing that ever crosses from a publisher into the
//! fan-out engine and from there into a reader's queue. Once constructed it
//! is handed out as `Arc<Unit>` and never mutated again — the format
//! processor is the sole writer, and it finishes writing before the unit is
//! queued.

use std::sync::Arc;
use std::time::SystemTime;

use crate::format::rtp::RtpPacket;

/// Logical track type carried by a [`Media`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Video,
    Audio,
    Metadata,
}

/// A logical track within a session: a type tag plus the formats a
/// publisher offered for it. Two `Media` values are the same track only if
/// they are the same allocation within one stream.
#[derive(Debug)]
pub struct Media {
    pub kind: MediaKind,
    pub formats: Vec<Arc<Format>>,
}

/// Codec-specific identification used by [`Media::formats`] and by
/// downstream format processors to decide which pipeline to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Codec {
    H264,
    H265,
    Mpeg4Video,
    Av1,
    Opus,
    G711 { a_law: bool },
    Lpcm,
    Generic,
}

/// Mutable parameter sets cached per [`Format`] (SPS/PPS/VPS, MPEG-4
/// config, ...). Guarded by a reader-shared / writer-exclusive lock so SDP
/// generation and other format processors can read it concurrently with
/// the single publisher thread that writes it.
#[derive(Debug, Clone, Default)]
pub struct ParameterSet {
    /// H.264/H.265 sequence parameter set.
    pub sps: Option<Vec<u8>>,
    /// H.264/H.265 picture parameter set.
    pub pps: Option<Vec<u8>>,
    /// H.265-only video parameter set.
    pub vps: Option<Vec<u8>>,
    /// MPEG-4 video Visual-Object-Sequence + config prefix, already
    /// wrapped in its `00 00 01` start codes.
    pub mpeg4_config: Option<Vec<u8>>,
    /// AV1 sequence header OBU, including its leading-byte framing.
    pub av1_sequence_header: Option<Vec<u8>>,
}

/// Codec-bound description of one format a [`Media`] offers: payload type,
/// clock rate, and a mutable parameter cache.
#[derive(Debug)]
pub struct Format {
    pub codec: Codec,
    pub payload_type: u8,
    pub clock_rate: u32,
    /// Channel count / bit depth for audio formats (G.711/LPCM).
    pub channels: u16,
    pub bit_depth: u16,
    params: parking_lot::RwLock<ParameterSet>,
}

impl Format {
    pub fn new(codec: Codec, payload_type: u8, clock_rate: u32) -> Self {
        Self {
            codec,
            payload_type,
            clock_rate,
            channels: 1,
            bit_depth: 16,
            params: parking_lot::RwLock::new(ParameterSet::default()),
        }
    }

    pub fn with_audio_params(mut self, channels: u16, bit_depth: u16) -> Self {
        self.channels = channels;
        self.bit_depth = bit_depth;
        self
    }

    /// Take a reader-shared snapshot of the current parameter set.
    pub fn params(&self) -> ParameterSet {
        self.params.read().clone()
    }

    /// Atomically update the parameter set under a writer-exclusive guard.
    /// `f` receives the current set and mutates it in place; returns
    /// whether anything actually changed.
    pub fn set_params(&self, f: impl FnOnce(&mut ParameterSet)) -> bool {
        let mut guard = self.params.write();
        let before = guard.clone();
        f(&mut guard);
        *guard != before
    }
}

impl PartialEq for ParameterSet {
    fn eq(&self, other: &Self) -> bool {
        self.sps == other.sps
            && self.pps == other.pps
            && self.vps == other.vps
            && self.mpeg4_config == other.mpeg4_config
            && self.av1_sequence_header == other.av1_sequence_header
    }
}
impl Eq for ParameterSet {}

/// Decoded/encoded payload carried by a [`Unit`], one variant per codec
/// family. Kept as a typed enum (rather than an opaque byte blob) because
/// parameter hoisting, GOP caching, and the recording segmenter all need
/// to pattern-match on access-unit structure.
#[derive(Debug, Clone)]
pub enum Payload {
    /// One or more H.264 NAL units composing one access unit.
    H264(Vec<Vec<u8>>),
    /// One or more H.265 NAL units composing one access unit.
    H265(Vec<Vec<u8>>),
    /// A raw MPEG-4 visual bitstream chunk (GOP body, optionally prefixed
    /// with the VOS/config header).
    Mpeg4Video(Vec<u8>),
    /// One or more AV1 OBUs composing one temporal unit.
    Av1(Vec<Vec<u8>>),
    /// One or more Opus packets sharing one [`Unit`].
    Opus(Vec<Vec<u8>>),
    /// Raw interleaved LPCM or G.711 samples.
    Pcm(Vec<u8>),
    /// Anything the generic fallback processor handles.
    Generic(Vec<u8>),
}

impl Payload {
    /// Whether this payload carries no actual media (e.g. the access unit
    /// was filtered down to nothing).
    pub fn is_empty(&self) -> bool {
        match self {
            Payload::H264(nals) | Payload::H265(nals) | Payload::Av1(nals) => {
                nals.iter().all(|n| n.is_empty())
            }
            Payload::Opus(pkts) => pkts.is_empty(),
            Payload::Mpeg4Video(b) | Payload::Pcm(b) | Payload::Generic(b) => b.is_empty(),
        }
    }
}

/// A single immutable media frame.
///
/// Invariant: a publisher-generated unit always has either a non-empty
/// [`Unit::payload`] or a non-empty [`Unit::rtp_packets`], never both
/// empty; when both are present, `rtp_packets` must encode `payload`.
#[derive(Debug, Clone)]
pub struct Unit {
    /// Presentation timestamp in the format's clock rate.
    pub pts: i64,
    /// Wall-clock time this unit was captured.
    pub ntp: SystemTime,
    pub payload: Option<Payload>,
    pub rtp_packets: Vec<RtpPacket>,
}

impl Unit {
    pub fn from_payload(pts: i64, ntp: SystemTime, payload: Payload) -> Self {
        Self {
            pts,
            ntp,
            payload: Some(payload),
            rtp_packets: Vec::new(),
        }
    }

    pub fn from_rtp(pts: i64, ntp: SystemTime, packets: Vec<RtpPacket>) -> Self {
        Self {
            pts,
            ntp,
            payload: None,
            rtp_packets: packets,
        }
    }

    /// Whether this unit, once fully processed, would carry any bits at
    /// all.
    pub fn is_empty(&self) -> bool {
        self.payload.as_ref().is_some_and(Payload::is_empty) && self.rtp_packets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_payload_h264_all_empty_nals() {
        let p = Payload::H264(vec![vec![], vec![]]);
        assert!(p.is_empty());
    }

    #[test]
    fn nonempty_payload_h264() {
        let p = Payload::H264(vec![vec![0x65, 0x01]]);
        assert!(!p.is_empty());
    }

    #[test]
    fn format_params_roundtrip() {
        let fmt = Format::new(Codec::H264, 96, 90_000);
        assert!(fmt.params().sps.is_none());
        let changed = fmt.set_params(|p| p.sps = Some(vec![1, 2, 3]));
        assert!(changed);
        assert_eq!(fmt.params().sps, Some(vec![1, 2, 3]));
        let changed_again = fmt.set_params(|p| p.sps = Some(vec![1, 2, 3]));
        assert!(!changed_again, "setting the same value must report no change");
    }
}
