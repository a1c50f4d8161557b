//! G.711 / LPCM format processor.
//!
//! Stateless: there is no parameter set to hoist and no access-unit
//! structure to remux, only raw interleaved samples split across RTP
//! packets honoring the format's channel count and bit depth.

use std::sync::Arc;

use crate::error::{CoreError, Result};
use crate::format::rtp::{RtpEncoderState, RtpPacket};
use crate::format::{FormatProcessor, ProcessedPacket};
use crate::unit::{Format, Payload, Unit};

const DEFAULT_MTU: usize = 1400;
const DEFAULT_MAX_PAYLOAD_SIZE: usize = 1450;

pub struct PcmProcessor {
    #[allow(dead_code)]
    format: Arc<Format>,
    random_start: u32,
    mtu: usize,
    max_payload_size: usize,
    encoder: RtpEncoderState,
}

impl PcmProcessor {
    pub fn new(format: Arc<Format>, random_start: u32) -> Self {
        let pt = format.payload_type;
        Self {
            format,
            random_start,
            mtu: DEFAULT_MTU,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            encoder: RtpEncoderState::with_random_ssrc(pt),
        }
    }
}

impl FormatProcessor for PcmProcessor {
    fn process_unit(&mut self, unit: Unit) -> Result<Option<(Unit, Vec<RtpPacket>)>> {
        let samples = match &unit.payload {
            Some(Payload::Pcm(bytes)) => bytes.clone(),
            _ => return Ok(None),
        };
        if samples.is_empty() {
            return Ok(None);
        }

        let ts = self.random_start.wrapping_add(unit.pts as u32);
        self.encoder.set_timestamp(ts);

        let mut packets = Vec::new();
        let mut offset = 0;
        while offset < samples.len() {
            let end = std::cmp::min(offset + self.mtu, samples.len());
            let marker = end == samples.len();
            packets.push(self.encoder.next_packet(marker, samples[offset..end].to_vec()));
            offset = end;
        }

        let out_unit = Unit::from_payload(unit.pts, unit.ntp, Payload::Pcm(samples));
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
                Payload::Pcm(packet.payload.clone()),
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

    #[test]
    fn splits_large_payload_across_packets() {
        let format = Arc::new(Format::new(Codec::G711 { a_law: false }, 0, 8_000));
        let mut p = PcmProcessor::new(format, 0);
        let samples = vec![0u8; 3000];
        let unit = Unit::from_payload(0, SystemTime::now(), Payload::Pcm(samples));
        let (_, packets) = p.process_unit(unit).unwrap().unwrap();
        assert!(packets.len() >= 3);
        assert!(packets.last().unwrap().marker);
        assert!(!packets.first().unwrap().marker || packets.len() == 1);
    }

    #[test]
    fn oversized_rtp_packet_fails() {
        let format = Arc::new(Format::new(Codec::Lpcm, 97, 48_000));
        let mut p = PcmProcessor::new(format, 0);
        let packet = RtpPacket {
            version: 2,
            padding: false,
            marker: true,
            payload_type: 97,
            sequence_number: 0,
            timestamp: 0,
            ssrc: 1,
            payload: vec![0u8; 2000],
        };
        assert!(matches!(
            p.process_rtp_packet(packet, false),
            Err(CoreError::OversizedPacket { .. })
        ));
    }
}
