//! MPEG-4 Part 2 video format processor (RFC 3016).
//!
//! Unlike H.264/H.265, the wire and in-memory representations here are the
//! same: a raw byte stream still carrying its `00 00 01 <code>` start
//! codes. The processor's only job is to split the Visual-Object-Sequence
//! prefix (config) from the Group-of-VOP body, cache the former, and
//! re-prepend it ahead of every body that follows.

use std::sync::Arc;

use crate::error::{CoreError, Result};
use crate::format::rtp::{RtpEncoderState, RtpPacket};
use crate::format::{FormatProcessor, ProcessedPacket};
use crate::unit::{Format, Payload, Unit};

const DEFAULT_MTU: usize = 1400;
const DEFAULT_MAX_PAYLOAD_SIZE: usize = 1450;

/// `group_of_vop_start_code` / `vop_start_code` prefix byte — anything
/// from this point on is GOP body rather than sequence config.
const GOV_START_CODE: u8 = 0xB3;

/// Find the index of the `00 00 01 <code>` start code matching `code`,
/// returning the index of the leading zero byte.
fn find_start_code(data: &[u8], code: u8) -> Option<usize> {
    if data.len() < 4 {
        return None;
    }
    data.windows(4)
        .position(|w| w[0] == 0 && w[1] == 0 && w[2] == 1 && w[3] == code)
}

pub struct Mpeg4VideoProcessor {
    format: Arc<Format>,
    random_start: u32,
    mtu: usize,
    max_payload_size: usize,
    encoder: RtpEncoderState,
    accumulated: Vec<u8>,
}

impl Mpeg4VideoProcessor {
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

    /// Split `raw` at the GOV boundary, cache the config prefix if
    /// present, and return the body to emit (or `None` if this access
    /// unit carries config only).
    fn sniff_and_split(&self, raw: &[u8]) -> Option<Vec<u8>> {
        match find_start_code(raw, GOV_START_CODE) {
            Some(gov_idx) => {
                let config_prefix = &raw[..gov_idx];
                if !config_prefix.is_empty() {
                    self.format
                        .set_params(|p| p.mpeg4_config = Some(config_prefix.to_vec()));
                }
                let body = raw[gov_idx..].to_vec();
                let cached = self.format.params().mpeg4_config;
                let mut out = cached.unwrap_or_default();
                out.extend_from_slice(&body);
                Some(out)
            }
            None => {
                if !raw.is_empty() {
                    self.format.set_params(|p| p.mpeg4_config = Some(raw.to_vec()));
                }
                None
            }
        }
    }

    fn packetize_raw(&mut self, bytes: &[u8]) -> Vec<RtpPacket> {
        if bytes.is_empty() {
            return Vec::new();
        }
        let mut packets = Vec::new();
        let mut offset = 0;
        while offset < bytes.len() {
            let end = std::cmp::min(offset + self.mtu, bytes.len());
            let marker = end == bytes.len();
            packets.push(self.encoder.next_packet(marker, bytes[offset..end].to_vec()));
            offset = end;
        }
        packets
    }
}

impl FormatProcessor for Mpeg4VideoProcessor {
    fn process_unit(&mut self, unit: Unit) -> Result<Option<(Unit, Vec<RtpPacket>)>> {
        let raw = match &unit.payload {
            Some(Payload::Mpeg4Video(bytes)) => bytes.clone(),
            _ => return Ok(None),
        };

        let Some(out_bytes) = self.sniff_and_split(&raw) else {
            return Ok(None);
        };
        if out_bytes.is_empty() {
            return Ok(None);
        }

        let ts = self.random_start.wrapping_add(unit.pts as u32);
        self.encoder.set_timestamp(ts);
        let packets = self.packetize_raw(&out_bytes);
        if packets.is_empty() {
            return Ok(None);
        }

        let out_unit = Unit::from_payload(unit.pts, unit.ntp, Payload::Mpeg4Video(out_bytes));
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

        self.sniff_and_split(&packet.payload);

        if !has_non_rtsp_readers {
            return Ok(ProcessedPacket {
                packets: vec![packet],
                decoded: None,
            });
        }

        self.accumulated.extend_from_slice(&packet.payload);
        if !packet.marker {
            return Ok(ProcessedPacket {
                packets: vec![packet],
                decoded: None,
            });
        }

        let raw = std::mem::take(&mut self.accumulated);
        let decoded = self.sniff_and_split(&raw).map(|body| {
            Unit::from_payload(
                packet.timestamp as i64,
                std::time::SystemTime::now(),
                Payload::Mpeg4Video(body),
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

    const VOS_START_CODE: u8 = 0xB0;

    fn chunk(code: u8, data: &[u8]) -> Vec<u8> {
        let mut v = vec![0, 0, 1, code];
        v.extend_from_slice(data);
        v
    }

    fn make_processor() -> Mpeg4VideoProcessor {
        Mpeg4VideoProcessor::new(Arc::new(Format::new(Codec::Mpeg4Video, 97, 90_000)), 0)
    }

    /// MPEG-4 video config (VOS/VOL) is hoisted out of the access unit.
    #[test]
    fn mpeg4_config_is_hoisted_out_of_access_unit() {
        let mut p = make_processor();

        let mut unit1_bytes = chunk(VOS_START_CODE, &[]);
        unit1_bytes.extend(chunk(0xFF, &[]));
        unit1_bytes.extend(chunk(GOV_START_CODE, &[]));
        unit1_bytes.extend(chunk(0xF0, &[]));

        let unit1 = Unit::from_payload(30_000, SystemTime::now(), Payload::Mpeg4Video(unit1_bytes));
        let (out1, _) = p.process_unit(unit1).unwrap().unwrap();

        let expected_config = {
            let mut v = chunk(VOS_START_CODE, &[]);
            v.extend(chunk(0xFF, &[]));
            v
        };
        assert_eq!(p.format.params().mpeg4_config, Some(expected_config.clone()));

        match &out1.payload {
            Some(Payload::Mpeg4Video(bytes)) => {
                let mut expected = expected_config.clone();
                expected.extend(chunk(GOV_START_CODE, &[]));
                expected.extend(chunk(0xF0, &[]));
                assert_eq!(bytes, &expected);
            }
            _ => panic!("expected Mpeg4Video payload"),
        }

        let mut unit2_bytes = chunk(GOV_START_CODE, &[]);
        unit2_bytes.extend(chunk(0xF1, &[]));
        let unit2 = Unit::from_payload(60_000, SystemTime::now(), Payload::Mpeg4Video(unit2_bytes));
        let (out2, _) = p.process_unit(unit2).unwrap().unwrap();
        match out2.payload {
            Some(Payload::Mpeg4Video(bytes)) => {
                let mut expected = expected_config;
                expected.extend(chunk(GOV_START_CODE, &[]));
                expected.extend(chunk(0xF1, &[]));
                assert_eq!(bytes, expected);
            }
            _ => panic!("expected Mpeg4Video payload"),
        }
    }

    #[test]
    fn config_only_unit_yields_no_output() {
        let mut p = make_processor();
        let unit = Unit::from_payload(
            0,
            SystemTime::now(),
            Payload::Mpeg4Video(chunk(VOS_START_CODE, &[1, 2, 3])),
        );
        assert!(p.process_unit(unit).unwrap().is_none());
    }
}
