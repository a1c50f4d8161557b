//! H.265/HEVC format processor (RFC 7798).
//!
//! Structurally mirrors [`super::h264`], adjusted for H.265's two-byte NAL
//! header, its VPS/SPS/PPS triple (vs. H.264's SPS/PPS pair), Aggregation
//! Packets (AP, type 48) instead of STAP-A, and a one-byte FU header
//! instead of H.264's combined FU indicator + header.

use std::sync::Arc;

use crate::error::{DecodeMiss, Result};
use crate::format::rtp::{RtpEncoderState, RtpPacket};
use crate::format::{FormatProcessor, ProcessedPacket};
use crate::unit::{Format, Payload, Unit};

const DEFAULT_MTU: usize = 1400;
const DEFAULT_MAX_PAYLOAD_SIZE: usize = 1450;

const NAL_TYPE_VPS: u8 = 32;
const NAL_TYPE_SPS: u8 = 33;
const NAL_TYPE_PPS: u8 = 34;
const NAL_TYPE_AUD: u8 = 35;
const NAL_TYPE_AP: u8 = 48;
const NAL_TYPE_FU: u8 = 49;

fn nal_type(nal: &[u8]) -> Option<u8> {
    nal.first().map(|b| (b >> 1) & 0x3f)
}

fn is_irap(t: u8) -> bool {
    (16..=23).contains(&t)
}

pub struct H265Processor {
    format: Arc<Format>,
    random_start: u32,
    mtu: usize,
    max_payload_size: usize,
    encoder: RtpEncoderState,
    reencoder: Option<RtpEncoderState>,
    warned_oversized: bool,
    pending_fu: Option<Vec<u8>>,
    accumulated_nals: Vec<Vec<u8>>,
}

impl H265Processor {
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
            pending_fu: None,
            accumulated_nals: Vec::new(),
        }
    }

    fn sniff_params(&self, nals: &[Vec<u8>]) {
        for nal in nals {
            match nal_type(nal) {
                Some(NAL_TYPE_VPS) => {
                    self.format.set_params(|p| p.vps = Some(nal.clone()));
                }
                Some(NAL_TYPE_SPS) => {
                    self.format.set_params(|p| p.sps = Some(nal.clone()));
                }
                Some(NAL_TYPE_PPS) => {
                    self.format.set_params(|p| p.pps = Some(nal.clone()));
                }
                _ => {}
            }
        }
    }

    fn sniff_params_from_rtp(&self, payload: &[u8]) {
        match nal_type(payload) {
            Some(NAL_TYPE_AP) => {
                for nal in iter_ap(payload) {
                    self.sniff_params(std::slice::from_ref(&nal));
                }
            }
            Some(NAL_TYPE_VPS) | Some(NAL_TYPE_SPS) | Some(NAL_TYPE_PPS) => {
                self.sniff_params(std::slice::from_ref(&payload.to_vec()));
            }
            _ => {}
        }
    }

    fn remux(&self, nals: &[Vec<u8>]) -> Vec<Vec<u8>> {
        remux_access_unit(nals, &self.format)
    }

    fn feed_decoder(&mut self, payload: &[u8]) -> std::result::Result<(), DecodeMiss> {
        if payload.len() < 2 {
            return Err(DecodeMiss::MorePacketsNeeded);
        }
        match nal_type(payload) {
            Some(NAL_TYPE_AP) => {
                for nal in iter_ap(payload) {
                    self.accumulated_nals.push(nal);
                }
                Ok(())
            }
            Some(NAL_TYPE_FU) => {
                if payload.len() < 3 {
                    return Err(DecodeMiss::MorePacketsNeeded);
                }
                let fu_header = payload[2];
                let start = fu_header & 0x80 != 0;
                let end = fu_header & 0x40 != 0;
                let real_type = fu_header & 0x3f;
                // Rebuild the 2-byte H.265 NAL header with the real type.
                let byte0 = (payload[0] & 0x81) | (real_type << 1);
                let byte1 = payload[1];
                if start {
                    let mut nal = vec![byte0, byte1];
                    nal.extend_from_slice(&payload[3..]);
                    self.pending_fu = Some(nal);
                    Ok(())
                } else {
                    match self.pending_fu.as_mut() {
                        Some(nal) => {
                            nal.extend_from_slice(&payload[3..]);
                            if end {
                                let nal = self.pending_fu.take().unwrap();
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

/// Split an H.265 Aggregation Packet (RFC 7798 §4.4.2) into its NAL units.
fn iter_ap(payload: &[u8]) -> Vec<Vec<u8>> {
    let mut nals = Vec::new();
    let mut offset = 2usize;
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

/// Drop AUDs and embedded VPS/SPS/PPS; on an IRAP (IDR/CRA/BLA) access
/// unit, prepend the current VPS, SPS, PPS in that fixed order.
fn remux_access_unit(nals: &[Vec<u8>], format: &Format) -> Vec<Vec<u8>> {
    let is_irap = nals
        .iter()
        .any(|n| nal_type(n).is_some_and(is_irap));

    let mut filtered: Vec<Vec<u8>> = nals
        .iter()
        .filter(|n| {
            !matches!(
                nal_type(n),
                Some(NAL_TYPE_AUD) | Some(NAL_TYPE_VPS) | Some(NAL_TYPE_SPS) | Some(NAL_TYPE_PPS) | None
            )
        })
        .cloned()
        .collect();

    if is_irap {
        let params = format.params();
        let mut prefix = Vec::new();
        if let Some(vps) = params.vps {
            prefix.push(vps);
        }
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

fn packetize_nals(encoder: &mut RtpEncoderState, nals: &[Vec<u8>], mtu: usize) -> Vec<RtpPacket> {
    let mut packets = Vec::new();
    let last_idx = nals.len().saturating_sub(1);
    for (i, nal) in nals.iter().enumerate() {
        packets.extend(fragment_nal(encoder, nal, i == last_idx, mtu));
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
    if nal.len() < 2 {
        return packets;
    }

    if nal.len() <= mtu {
        packets.push(encoder.next_packet(is_last_nal, nal.to_vec()));
        return packets;
    }

    let Some(real_type) = nal_type(nal) else {
        return packets;
    };
    let byte0_layer_bits = nal[0] & 0x81;
    let byte1 = nal[1];
    let payload = &nal[2..];
    let max_fragment = mtu - 3;
    let mut offset = 0usize;
    let mut first = true;

    while offset < payload.len() {
        let remaining = payload.len() - offset;
        let last_fragment = remaining <= max_fragment;
        let chunk_size = std::cmp::min(max_fragment, remaining);
        let chunk = &payload[offset..offset + chunk_size];

        let start_bit = if first { 0x80 } else { 0x00 };
        let end_bit = if last_fragment { 0x40 } else { 0x00 };

        let mut out = Vec::with_capacity(3 + chunk.len());
        out.push(byte0_layer_bits | (NAL_TYPE_FU << 1));
        out.push(byte1);
        out.push(start_bit | end_bit | real_type);
        out.extend_from_slice(chunk);

        let marker = is_last_nal && last_fragment;
        packets.push(encoder.next_packet(marker, out));

        offset += chunk_size;
        first = false;
    }

    packets
}

impl FormatProcessor for H265Processor {
    fn process_unit(&mut self, unit: Unit) -> Result<Option<(Unit, Vec<RtpPacket>)>> {
        let nals = match &unit.payload {
            Some(Payload::H265(nals)) => nals.clone(),
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

        let out_unit = Unit::from_payload(unit.pts, unit.ntp, Payload::H265(remuxed));
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
            has_non_rtsp_readers || self.pending_fu.is_some() || self.reencoder.is_some();
        if !must_decode {
            return Ok(ProcessedPacket {
                packets: vec![packet],
                decoded: None,
            });
        }

        let marker = packet.marker;
        let decode_result = self.feed_decoder(&packet.payload);
        if decode_result.is_err() || !marker {
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
                Payload::H265(remuxed.clone()),
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

    fn make_processor() -> H265Processor {
        H265Processor::new(Arc::new(Format::new(Codec::H265, 97, 90_000)), 0)
    }

    fn nal(t: u8, rest: &[u8]) -> Vec<u8> {
        let mut v = vec![t << 1, 1];
        v.extend_from_slice(rest);
        v
    }

    #[test]
    fn parameter_hoisting_vps_sps_pps_order() {
        let mut p = make_processor();
        let vps = nal(NAL_TYPE_VPS, &[1]);
        let sps = nal(NAL_TYPE_SPS, &[2]);
        let pps = nal(NAL_TYPE_PPS, &[3]);
        let idr = nal(19, &[9]); // IDR_W_RADL
        let unit1 = Unit::from_payload(
            0,
            SystemTime::now(),
            Payload::H265(vec![vps.clone(), sps.clone(), pps.clone(), idr.clone()]),
        );
        p.process_unit(unit1).unwrap().unwrap();

        let unit2 = Unit::from_payload(1, SystemTime::now(), Payload::H265(vec![idr.clone()]));
        let (out, _) = p.process_unit(unit2).unwrap().unwrap();
        match out.payload {
            Some(Payload::H265(nals)) => assert_eq!(nals, vec![vps, sps, pps, idr]),
            _ => panic!("expected H265 payload"),
        }
    }

    #[test]
    fn non_irap_access_unit_has_no_prepend() {
        let mut p = make_processor();
        let trail = nal(1, &[1]); // TRAIL_R
        let unit = Unit::from_payload(0, SystemTime::now(), Payload::H265(vec![trail.clone()]));
        let (out, _) = p.process_unit(unit).unwrap().unwrap();
        match out.payload {
            Some(Payload::H265(nals)) => assert_eq!(nals, vec![trail]),
            _ => panic!("expected H265 payload"),
        }
    }
}
