//! Opus format processor (RFC 7587).
//!
//! A single [`Unit`] may carry several Opus packets (e.g. when the
//! publisher batches consecutive frames). One RTP packet is emitted per
//! Opus packet, and the RTP timestamp advances between them by that
//! packet's duration as derived from its TOC byte (RFC 6716 §3.1) rather
//! than a fixed frame size, since Opus allows variable frame durations
//! within one stream.

use std::sync::Arc;

use crate::error::{CoreError, Result};
use crate::format::rtp::{RtpEncoderState, RtpPacket};
use crate::format::{FormatProcessor, ProcessedPacket};
use crate::unit::{Format, Payload, Unit};

const DEFAULT_MAX_PAYLOAD_SIZE: usize = 1450;

/// Frame duration in microseconds for each of the 32 Opus TOC
/// configuration numbers (RFC 6716 table 2).
const CONFIG_FRAME_DURATION_US: [u32; 32] = [
    10_000, 20_000, 40_000, 60_000, // NB SILK
    10_000, 20_000, 40_000, 60_000, // MB SILK
    10_000, 20_000, 40_000, 60_000, // WB SILK
    10_000, 20_000, // SWB Hybrid
    10_000, 20_000, // FB Hybrid
    2_500, 5_000, 10_000, 20_000, // NB CELT
    2_500, 5_000, 10_000, 20_000, // WB CELT
    2_500, 5_000, 10_000, 20_000, // SWB CELT
    2_500, 5_000, 10_000, 20_000, // FB CELT
];

/// Total duration of one Opus packet in microseconds, derived from its TOC
/// byte (RFC 6716 §3.1): configuration number (top 5 bits), frame-count
/// code `c` (bottom 2 bits), and — for `c == 3` — the explicit frame count
/// byte that follows.
fn packet_duration_us(packet: &[u8]) -> u32 {
    let Some(&toc) = packet.first() else {
        return 0;
    };
    let config = (toc >> 3) as usize;
    let c = toc & 0x03;
    let per_frame = CONFIG_FRAME_DURATION_US[config.min(31)];
    let frame_count: u32 = match c {
        0 => 1,
        1 | 2 => 2,
        _ => packet.get(1).map(|b| (b & 0x3f) as u32).unwrap_or(1).max(1),
    };
    per_frame * frame_count
}

pub struct OpusProcessor {
    format: Arc<Format>,
    random_start: u32,
    max_payload_size: usize,
    encoder: RtpEncoderState,
}

impl OpusProcessor {
    pub fn new(format: Arc<Format>, random_start: u32) -> Self {
        let pt = format.payload_type;
        Self {
            format,
            random_start,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            encoder: RtpEncoderState::with_random_ssrc(pt),
        }
    }

    fn clock_rate(&self) -> u32 {
        self.format.clock_rate
    }
}

impl FormatProcessor for OpusProcessor {
    fn process_unit(&mut self, unit: Unit) -> Result<Option<(Unit, Vec<RtpPacket>)>> {
        let packets_in = match &unit.payload {
            Some(Payload::Opus(pkts)) => pkts.clone(),
            _ => return Ok(None),
        };
        if packets_in.is_empty() {
            return Ok(None);
        }

        let mut ts = self.random_start.wrapping_add(unit.pts as u32);
        let mut packets = Vec::with_capacity(packets_in.len());
        let clock_rate = self.clock_rate();
        for opus_packet in &packets_in {
            self.encoder.set_timestamp(ts);
            packets.push(self.encoder.next_packet(true, opus_packet.clone()));
            let duration_us = packet_duration_us(opus_packet);
            let advance = ((duration_us as u64 * clock_rate as u64) / 1_000_000) as u32;
            ts = ts.wrapping_add(advance);
        }

        let out_unit = Unit::from_payload(unit.pts, unit.ntp, Payload::Opus(packets_in));
        Ok(Some((out_unit, packets)))
    }

    fn process_rtp_packet(
        &mut self,
        mut packet: RtpPacket,
        has_non_rtsp_readers: bool,
    ) -> Result<ProcessedPacket> {
        packet.strip_padding();

        if packet.payload.len() > self.max_payload_size {
            return Err(CoreError::OversizedPacket {
                payload_type: packet.payload_type,
                size: packet.payload.len(),
                max: self.max_payload_size,
            });
        }

        let decoded = has_non_rtsp_readers.then(|| {
            Unit::from_payload(
                packet.timestamp as i64,
                std::time::SystemTime::now(),
                Payload::Opus(vec![packet.payload.clone()]),
            )
        });

        Ok(ProcessedPacket {
            packets: vec![packet],
            decoded,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::Codec;
    use std::time::SystemTime;

    fn make_processor() -> OpusProcessor {
        OpusProcessor::new(Arc::new(Format::new(Codec::Opus, 111, 48_000)), 0)
    }

    #[test]
    fn twenty_ms_config_zero_duration() {
        // config 1 (NB SILK, 20ms), c=0 (1 frame)
        let toc = 1 << 3;
        assert_eq!(packet_duration_us(&[toc, 0, 0]), 20_000);
    }

    #[test]
    fn two_frame_code_doubles_duration() {
        let toc = (1 << 3) | 0x01; // 20ms config, c=1 (2 equal frames)
        assert_eq!(packet_duration_us(&[toc, 0, 0]), 40_000);
    }

    #[test]
    fn one_rtp_packet_per_opus_packet_with_advancing_timestamp() {
        let mut p = make_processor();
        let toc = 1 << 3; // 20ms, single frame
        let pkt_a = vec![toc, 1, 2, 3];
        let pkt_b = vec![toc, 4, 5, 6];
        let unit = Unit::from_payload(
            0,
            SystemTime::now(),
            Payload::Opus(vec![pkt_a, pkt_b]),
        );
        let (_, packets) = p.process_unit(unit).unwrap().unwrap();
        assert_eq!(packets.len(), 2);
        // 20ms @ 48kHz = 960 samples
        assert_eq!(packets[1].timestamp.wrapping_sub(packets[0].timestamp), 960);
    }
}
