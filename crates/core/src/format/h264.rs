//! H.264 format processor (RFC 6184).
//!
//! Implements the full [`super::FormatProcessor`] pipeline: SPS/PPS sniffing and hoisting, AUD
//! stripping, FU-A/STAP-A decode, and transparent re-encode when upstream
//! packets exceed the configured maximum payload size.

use std::sync::Arc;

use crate::error::{DecodeMiss, Result};
use crate::format::nal;
use crate::format::rtp::{RtpEncoderState, RtpPacket};
use crate::format::{FormatProcessor, ProcessedPacket};
use crate::unit::{Format, Payload, Unit};

const DEFAULT_MTU: usize = 1400;
const DEFAULT_MAX_PAYLOAD_SIZE: usize = 1450;

const NAL_TYPE_SLICE_IDR: u8 = 5;
const NAL_TYPE_SPS: u8 = 7;
const NAL_TYPE_PPS: u8 = 8;
const NAL_TYPE_AUD: u8 = 9;
const NAL_TYPE_STAP_A: u8 = 24;
const NAL_TYPE_FU_A: u8 = 28;

pub struct H264Processor {
    format: Arc<Format>,
    random_start: u32,
    mtu: usize,
    max_payload_size: usize,
    encoder: RtpEncoderState,
    reencoder: Option<RtpEncoderState>,
    warned_oversized: bool,
    pending_fua: Option<Vec<u8>>,
    accumulated_nals: Vec<Vec<u8>>,
}

impl H264Processor {
    pub fn new(format: Arc<Format>, random_start: u32) -> Self {
        let pt = format.payload_type;
        Self {
            format,
            random_start,
            mtu: DEFAULT_MTU,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            encoder: RtpEncoderState::with_random_ssrc(pt),
            reencoder: None,
            warned_oversized: false,
            pending_fua: None,
            accumulated_nals: Vec::new(),
        }
    }

    fn sniff_params(&self, nals: &[Vec<u8>]) {
        for nal in nals {
            if nal.is_empty() {
                continue;
            }
            match nal[0] & 0x1f {
                NAL_TYPE_SPS => {
                    self.format.set_params(|p| p.sps = Some(nal.clone()));
                }
                NAL_TYPE_PPS => {
                    self.format.set_params(|p| p.pps = Some(nal.clone()));
                }
                _ => {}
            }
        }
    }

    /// Same sniffing, but from a raw RTP payload that may be a STAP-A
    /// aggregate rather than a pre-split NAL list.
    fn sniff_params_from_rtp(&self, payload: &[u8]) {
        if payload.is_empty() {
            return;
        }
        match payload[0] & 0x1f {
            NAL_TYPE_STAP_A => {
                for nal in iter_stap_a(payload) {
                    self.sniff_params(std::slice::from_ref(&nal));
                }
            }
            NAL_TYPE_SPS | NAL_TYPE_PPS => self.sniff_params(std::slice::from_ref(&payload.to_vec())),
            _ => {}
        }
    }

    fn remux(&self, nals: &[Vec<u8>]) -> Vec<Vec<u8>> {
        remux_access_unit(nals, &self.format)
    }

    fn feed_decoder(&mut self, payload: &[u8]) -> std::result::Result<(), DecodeMiss> {
        if payload.is_empty() {
            return Err(DecodeMiss::MorePacketsNeeded);
        }
        let nal_type = payload[0] & 0x1f;
        match nal_type {
            NAL_TYPE_STAP_A => {
                for nal in iter_stap_a(payload) {
                    self.accumulated_nals.push(nal);
                }
                Ok(())
            }
            NAL_TYPE_FU_A => {
                if payload.len() < 2 {
                    return Err(DecodeMiss::MorePacketsNeeded);
                }
                let fu_header = payload[1];
                let start = fu_header & 0x80 != 0;
                let end = fu_header & 0x40 != 0;
                let nal_t = fu_header & 0x1f;
                let nri = payload[0] & 0x60;
                if start {
                    let mut nal = vec![nri | nal_t];
                    nal.extend_from_slice(&payload[2..]);
                    self.pending_fua = Some(nal);
                    Ok(())
                } else {
                    match self.pending_fua.as_mut() {
                        Some(nal) => {
                            nal.extend_from_slice(&payload[2..]);
                            if end {
                                let nal = self.pending_fua.take().unwrap();
                                self.accumulated_nals.push(nal);
                            }
                            Ok(())
                        }
                        None => Err(DecodeMiss::NonStartingPacket),
                    }
                }
            }
            _ => {
                self.accumulated_nals.push(payload.to_vec());
                Ok(())
            }
        }
    }
}

/// Split a STAP-A (RFC 6184 §5.7.1) aggregation-unit payload into its
/// constituent NAL units.
fn iter_stap_a(payload: &[u8]) -> Vec<Vec<u8>> {
    let mut nals = Vec::new();
    let mut offset = 1usize;
    while offset + 2 <= payload.len() {
        let len = u16::from_be_bytes([payload[offset], payload[offset + 1]]) as usize;
        offset += 2;
        if offset + len > payload.len() {
            break;
        }
        nals.push(payload[offset..offset + len].to_vec());
        offset += len;
    }
    nals
}

/// Drop AUDs and embedded parameter sets; on an IDR access unit, prepend
/// the format's cached SPS/PPS in fixed order.
fn remux_access_unit(nals: &[Vec<u8>], format: &Format) -> Vec<Vec<u8>> {
    let is_idr = nals
        .iter()
        .any(|n| !n.is_empty() && (n[0] & 0x1f) == NAL_TYPE_SLICE_IDR);

    let mut filtered: Vec<Vec<u8>> = nals
        .iter()
        .filter(|n| {
            if n.is_empty() {
                return false;
            }
            !matches!(
                n[0] & 0x1f,
                NAL_TYPE_AUD | NAL_TYPE_SPS | NAL_TYPE_PPS
            )
        })
        .cloned()
        .collect();

    if is_idr {
        let params = format.params();
        let mut prefix = Vec::new();
        if let Some(sps) = params.sps {
            prefix.push(sps);
        }
        if let Some(pps) = params.pps {
            prefix.push(pps);
        }
        prefix.extend(filtered);
        filtered = prefix;
    }

    filtered
}

/// Packetize an access unit, setting `encoder`'s current timestamp on
/// every output packet and advancing the sequence number per packet.
fn packetize_nals(encoder: &mut RtpEncoderState, nals: &[Vec<u8>], mtu: usize) -> Vec<RtpPacket> {
    let mut packets = Vec::new();
    let last_idx = nals.len().saturating_sub(1);
    for (i, nal) in nals.iter().enumerate() {
        let is_last_nal = i == last_idx;
        packets.extend(fragment_nal(encoder, nal, is_last_nal, mtu));
    }
    packets
}

fn fragment_nal(
    encoder: &mut RtpEncoderState,
    nal: &[u8],
    is_last_nal: bool,
    mtu: usize,
) -> Vec<RtpPacket> {
    let mut packets = Vec::new();
    if nal.is_empty() {
        return packets;
    }

    if nal.len() <= mtu {
        packets.push(encoder.next_packet(is_last_nal, nal.to_vec()));
        return packets;
    }

    let nal_header = nal[0];
    let nal_type = nal_header & 0x1f;
    let nri = nal_header & 0x60;
    let fu_indicator = nri | NAL_TYPE_FU_A;
    let payload = &nal[1..];
    let max_fragment = mtu - 2;
    let mut offset = 0usize;
    let mut first = true;

    while offset < payload.len() {
        let remaining = payload.len() - offset;
        let last_fragment = remaining <= max_fragment;
        let chunk_size = std::cmp::min(max_fragment, remaining);
        let chunk = &payload[offset..offset + chunk_size];

        let start_bit = if first { 0x80 } else { 0x00 };
        let end_bit = if last_fragment { 0x40 } else { 0x00 };
        let fu_header = start_bit | end_bit | nal_type;

        let mut out = Vec::with_capacity(2 + chunk.len());
        out.push(fu_indicator);
        out.push(fu_header);
        out.extend_from_slice(chunk);

        let marker = is_last_nal && last_fragment;
        packets.push(encoder.next_packet(marker, out));

        offset += chunk_size;
        first = false;
    }

    packets
}

impl FormatProcessor for H264Processor {
    fn process_unit(&mut self, unit: Unit) -> Result<Option<(Unit, Vec<RtpPacket>)>> {
        let nals = match &unit.payload {
            Some(Payload::H264(nals)) => nals.clone(),
            _ => return Ok(None),
        };

        self.sniff_params(&nals);
        let remuxed = self.remux(&nals);
        if remuxed.is_empty() {
            return Ok(None);
        }

        let ts = self.random_start.wrapping_add(unit.pts as u32);
        self.encoder.set_timestamp(ts);
        let packets = packetize_nals(&mut self.encoder, &remuxed, self.mtu);
        if packets.is_empty() {
            return Ok(None);
        }

        let out_unit = Unit::from_payload(unit.pts, unit.ntp, Payload::H264(remuxed));
        Ok(Some((out_unit, packets)))
    }

    fn process_rtp_packet(
        &mut self,
        mut packet: RtpPacket,
        has_non_rtsp_readers: bool,
    ) -> Result<ProcessedPacket> {
        packet.strip_padding();

        if packet.payload.len() > self.max_payload_size {
            if !self.warned_oversized {
                tracing::warn!("RTP packets are too big, remuxing them into smaller ones");
                self.warned_oversized = true;
            }
            if self.reencoder.is_none() {
                self.reencoder = Some(RtpEncoderState::seeded_from(
                    packet.payload_type,
                    packet.ssrc,
                    packet.sequence_number,
                ));
            }
        }

        self.sniff_params_from_rtp(&packet.payload);

        let must_decode =
            has_non_rtsp_readers || self.pending_fua.is_some() || self.reencoder.is_some();
        if !must_decode {
            return Ok(ProcessedPacket {
                packets: vec![packet],
                decoded: None,
            });
        }

        let marker = packet.marker;
        let decode_result = self.feed_decoder(&packet.payload);
        if decode_result.is_err() || !marker {
            // Soft miss, or a mid-AU fragment: the original packet still
            // goes to RTSP readers unless a re-encoder has taken over the
            // stream, in which case nothing is emitted until the AU closes.
            return if self.reencoder.is_some() {
                Ok(ProcessedPacket::none())
            } else {
                Ok(ProcessedPacket {
                    packets: vec![packet],
                    decoded: None,
                })
            };
        }

        let nals = std::mem::take(&mut self.accumulated_nals);
        let remuxed = self.remux(&nals);
        if remuxed.is_empty() {
            return Ok(ProcessedPacket::none());
        }

        let decoded = has_non_rtsp_readers.then(|| {
            Unit::from_payload(
                packet.timestamp as i64,
                std::time::SystemTime::now(),
                Payload::H264(remuxed.clone()),
            )
        });

        if let Some(enc) = self.reencoder.as_mut() {
            enc.set_timestamp(packet.timestamp);
            let packets = packetize_nals(enc, &remuxed, self.mtu);
            return Ok(ProcessedPacket { packets, decoded });
        }

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

    fn make_processor() -> H264Processor {
        H264Processor::new(Arc::new(Format::new(Codec::H264, 96, 90_000)), 0)
    }

    #[test]
    fn extract_single_nal_via_nal_module() {
        let data = [0, 0, 0, 1, 0x65, 0xAA, 0xBB];
        let nals = nal::split_annex_b(&data);
        assert_eq!(nals, vec![vec![0x65, 0xAA, 0xBB]]);
    }

    /// SPS/PPS parameter injection before the first access unit.
    #[test]
    fn sps_pps_injected_before_idr_access_unit() {
        let mut p = make_processor();
        let unit1 = Unit::from_payload(
            30_000,
            SystemTime::now(),
            Payload::H264(vec![vec![7, 4, 5, 6], vec![8, 1], vec![5, 1]]),
        );
        let (_, packets1) = p.process_unit(unit1).unwrap().unwrap();
        assert_eq!(p.format.params().sps, Some(vec![7, 4, 5, 6]));
        assert_eq!(p.format.params().pps, Some(vec![8, 1]));

        let unit2 = Unit::from_payload(60_000, SystemTime::now(), Payload::H264(vec![vec![5, 2]]));
        let (out_unit2, packets2) = p.process_unit(unit2).unwrap().unwrap();

        match &out_unit2.payload {
            Some(Payload::H264(nals)) => {
                assert_eq!(nals, &vec![vec![7, 4, 5, 6], vec![8, 1], vec![5, 2]]);
            }
            _ => panic!("expected H264 payload"),
        }

        assert_eq!(packets1[0].timestamp.wrapping_add(30_000), packets2[0].timestamp);
    }

    /// Access unit delimiter NALs are stripped from the output.
    #[test]
    fn access_unit_delimiter_is_stripped() {
        let mut p = make_processor();
        let unit = Unit::from_payload(
            0,
            SystemTime::now(),
            Payload::H264(vec![vec![9, 24], vec![5, 1]]),
        );
        let (out, _) = p.process_unit(unit).unwrap().unwrap();
        match out.payload {
            Some(Payload::H264(nals)) => assert_eq!(nals, vec![vec![5, 1]]),
            _ => panic!("expected H264 payload"),
        }
    }

    #[test]
    fn empty_access_unit_yields_no_output() {
        let mut p = make_processor();
        let unit = Unit::from_payload(0, SystemTime::now(), Payload::H264(vec![vec![7, 1, 2]]));
        assert!(p.process_unit(unit).unwrap().is_none());
    }

    /// Oversized RTP re-encode: the re-encoder is installed on the first
    /// oversized packet and preserves SSRC/sequence.
    #[test]
    fn oversized_packet_installs_reencoder() {
        let mut p = make_processor();
        let ssrc = 563423u32;
        let start_seq = 123u16;

        let small = RtpPacket {
            version: 2,
            padding: false,
            marker: false,
            payload_type: 96,
            sequence_number: start_seq,
            timestamp: 45343,
            ssrc,
            payload: vec![0x67, 0x42, 0x00],
        };
        let r1 = p.process_rtp_packet(small, false).unwrap();
        assert!(!p.warned_oversized);
        assert!(r1.packets.len() <= 1);

        let mut big_payload = vec![0x1c, 0x80];
        big_payload.extend(vec![0xAA; 2000]);
        let big = RtpPacket {
            version: 2,
            padding: false,
            marker: false,
            payload_type: 96,
            sequence_number: start_seq.wrapping_add(1),
            timestamp: 45343,
            ssrc,
            payload: big_payload,
        };
        assert_eq!(p.process_rtp_packet(big, false).unwrap().packets.len(), 0);
        assert!(p.warned_oversized);
        assert!(p.reencoder.is_some());
        assert_eq!(p.reencoder.as_ref().unwrap().ssrc, ssrc);
    }
}
