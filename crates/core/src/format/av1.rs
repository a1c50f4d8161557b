//! AV1 format processor (AOM AV1 RTP payload format).
//!
//! Every unit carries one or more Open Bitstream Units (OBUs) composing a
//! temporal unit. The processor drops temporal-delimiter OBUs and caches
//! the most recent sequence header, mirroring the H.264/H.265 parameter
//! cache without H.264's mandatory hoist-on-keyframe rule — AV1 decoders
//! are expected to hold the sequence header from when it last changed.

use std::sync::Arc;

use crate::error::{CoreError, Result};
use crate::format::rtp::{RtpEncoderState, RtpPacket};
use crate::format::{FormatProcessor, ProcessedPacket};
use crate::unit::{Format, Payload, Unit};

const DEFAULT_MTU: usize = 1400;
const DEFAULT_MAX_PAYLOAD_SIZE: usize = 1450;

const OBU_TYPE_SEQUENCE_HEADER: u8 = 1;
const OBU_TYPE_TEMPORAL_DELIMITER: u8 = 2;

fn obu_type(obu: &[u8]) -> Option<u8> {
    obu.first().map(|b| (b >> 3) & 0x0f)
}

pub struct Av1Processor {
    format: Arc<Format>,
    random_start: u32,
    mtu: usize,
    max_payload_size: usize,
    encoder: RtpEncoderState,
    accumulated: Vec<Vec<u8>>,
}

impl Av1Processor {
    pub fn new(format: Arc<Format>, random_start: u32) -> Self {
        let pt = format.payload_type;
        Self {
            format,
            random_start,
            mtu: DEFAULT_MTU,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            encoder: RtpEncoderState::with_random_ssrc(pt),
            accumulated: Vec::new(),
        }
    }

    fn sniff(&self, obus: &[Vec<u8>]) {
        for obu in obus {
            if obu_type(obu) == Some(OBU_TYPE_SEQUENCE_HEADER) {
                self.format.set_params(|p| p.av1_sequence_header = Some(obu.clone()));
            }
        }
    }

    fn remux(&self, obus: &[Vec<u8>]) -> Vec<Vec<u8>> {
        self.sniff(obus);
        obus.iter()
            .filter(|o| obu_type(o) != Some(OBU_TYPE_TEMPORAL_DELIMITER))
            .cloned()
            .collect()
    }

    fn packetize_obus(&mut self, obus: &[Vec<u8>]) -> Vec<RtpPacket> {
        let mut packets = Vec::new();
        let last_idx = obus.len().saturating_sub(1);
        for (i, obu) in obus.iter().enumerate() {
            let marker = i == last_idx;
            let mut offset = 0;
            while offset < obu.len() {
                let end = std::cmp::min(offset + self.mtu, obu.len());
                let last_chunk = end == obu.len();
                packets.push(
                    self.encoder
                        .next_packet(marker && last_chunk, obu[offset..end].to_vec()),
                );
                offset = end;
            }
            if obu.is_empty() {
                packets.push(self.encoder.next_packet(marker, Vec::new()));
            }
        }
        packets
    }
}

impl FormatProcessor for Av1Processor {
    fn process_unit(&mut self, unit: Unit) -> Result<Option<(Unit, Vec<RtpPacket>)>> {
        let obus = match &unit.payload {
            Some(Payload::Av1(obus)) => obus.clone(),
            _ => return Ok(None),
        };

        let remuxed = self.remux(&obus);
        if remuxed.is_empty() {
            return Ok(None);
        }

        let ts = self.random_start.wrapping_add(unit.pts as u32);
        self.encoder.set_timestamp(ts);
        let packets = self.packetize_obus(&remuxed);
        if packets.is_empty() {
            return Ok(None);
        }

        let out_unit = Unit::from_payload(unit.pts, unit.ntp, Payload::Av1(remuxed));
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

        self.sniff(std::slice::from_ref(&packet.payload));

        if !has_non_rtsp_readers {
            return Ok(ProcessedPacket {
                packets: vec![packet],
                decoded: None,
            });
        }

        self.accumulated.push(packet.payload.clone());
        if !packet.marker {
            return Ok(ProcessedPacket {
                packets: vec![packet],
                decoded: None,
            });
        }

        let obus = std::mem::take(&mut self.accumulated);
        let remuxed = self.remux(&obus);
        let decoded = (!remuxed.is_empty()).then(|| {
            Unit::from_payload(
                packet.timestamp as i64,
                std::time::SystemTime::now(),
                Payload::Av1(remuxed),
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

    fn obu(t: u8, body: &[u8]) -> Vec<u8> {
        let mut v = vec![t << 3];
        v.extend_from_slice(body);
        v
    }

    fn make_processor() -> Av1Processor {
        Av1Processor::new(Arc::new(Format::new(Codec::Av1, 98, 90_000)), 0)
    }

    #[test]
    fn temporal_delimiter_is_dropped() {
        let mut p = make_processor();
        let td = obu(OBU_TYPE_TEMPORAL_DELIMITER, &[]);
        let frame = obu(6, &[1, 2, 3]);
        let unit = Unit::from_payload(0, SystemTime::now(), Payload::Av1(vec![td, frame.clone()]));
        let (out, _) = p.process_unit(unit).unwrap().unwrap();
        match out.payload {
            Some(Payload::Av1(obus)) => assert_eq!(obus, vec![frame]),
            _ => panic!("expected Av1 payload"),
        }
    }

    #[test]
    fn sequence_header_is_cached() {
        let mut p = make_processor();
        let seq = obu(OBU_TYPE_SEQUENCE_HEADER, &[9, 9]);
        let unit = Unit::from_payload(0, SystemTime::now(), Payload::Av1(vec![seq.clone()]));
        p.process_unit(unit).unwrap();
        assert_eq!(p.format.params().av1_sequence_header, Some(seq));
    }
}
