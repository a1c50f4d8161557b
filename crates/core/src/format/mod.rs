//! Codec format processors.
//!
//! Each supported codec family implements the [`FormatProcessor`] trait:
//! a unit-in/unit-out and RTP-in/RTP-out pipeline covering padding stripping, size
//! checks, parameter-set sniffing and hoisting, access-unit remux, and (for
//! H.264/H.265) transparent decode→re-encode when upstream packets are
//! oversized.
//!
//! ## Supported codecs
//!
//! | Codec | Module |
//! |-------|--------|
//! | H.264 | [`h264`] |
//! | H.265 | [`h265`] |
//! | MPEG-4 video | [`mpeg4video`] |
//! | AV1 | [`av1`] |
//! | Opus | [`opus`] |
//! | G.711 / LPCM | [`g711`] |
//! | anything else | [`generic`] |

pub mod av1;
pub mod g711;
pub mod generic;
pub mod h264;
pub mod h265;
pub mod mpeg4video;
pub(crate) mod nal;
pub mod opus;
pub mod rtp;

use std::sync::Arc;

use crate::error::Result;
use crate::unit::{Codec, Format, Unit};

/// Outcome of [`FormatProcessor::process_rtp_packet`]: the (possibly
/// rewritten) RTP packet to forward to RTSP-shaped readers, plus an
/// optional decoded [`Unit`] for readers that don't speak RTP.
pub struct ProcessedPacket {
    /// Empty when the access unit produced no output
    /// — in that case no packet and no decoded unit are delivered.
    pub packets: Vec<rtp::RtpPacket>,
    pub decoded: Option<Unit>,
}

impl ProcessedPacket {
    pub fn none() -> Self {
        Self {
            packets: Vec::new(),
            decoded: None,
        }
    }
}

/// Per-(stream, format) codec pipeline.
///
/// One instance is created per format a publisher session offers, and owns
/// any RTP encoder/decoder state that format needs across calls. Mutations
/// are serialized by the single publisher thread that drives it.
pub trait FormatProcessor: Send {
    /// Publisher handed a decoded payload; produce RTP packets for RTSP
    /// readers and return the (remuxed) unit unchanged for non-RTSP
    /// readers. Returns `Ok(None)` when the remuxed access unit is empty.
    fn process_unit(&mut self, unit: Unit) -> Result<Option<(Unit, Vec<rtp::RtpPacket>)>>;

    /// Publisher handed an RTP packet. `has_non_rtsp_readers` tells the
    /// processor whether it must pay the cost of decoding even though no
    /// RTSP-shaped reader asked for it.
    fn process_rtp_packet(
        &mut self,
        packet: rtp::RtpPacket,
        has_non_rtsp_readers: bool,
    ) -> Result<ProcessedPacket>;
}

/// Construct the processor for a format's codec, seeded with the
/// per-stream random timestamp offset.
pub fn for_format(format: Arc<Format>, random_start: u32) -> Box<dyn FormatProcessor> {
    match format.codec {
        Codec::H264 => Box::new(h264::H264Processor::new(format, random_start)),
        Codec::H265 => Box::new(h265::H265Processor::new(format, random_start)),
        Codec::Mpeg4Video => Box::new(mpeg4video::Mpeg4VideoProcessor::new(format, random_start)),
        Codec::Av1 => Box::new(av1::Av1Processor::new(format, random_start)),
        Codec::Opus => Box::new(opus::OpusProcessor::new(format, random_start)),
        Codec::G711 { .. } | Codec::Lpcm => {
            Box::new(g711::PcmProcessor::new(format, random_start))
        }
        Codec::Generic => Box::new(generic::GenericProcessor::new(format)),
    }
}
