//! Fallback processor for payload types the core doesn't otherwise
//! recognize.
//!
//! `processUnit` is meaningless without codec-specific encode knowledge
//! and fails unconditionally; `processRTPPacket` still does the baseline
//! padding-strip and size-check every reader is entitled to.

use std::sync::Arc;

use crate::error::{CoreError, Result};
use crate::format::rtp::RtpPacket;
use crate::format::{FormatProcessor, ProcessedPacket};
use crate::unit::{Format, Unit};

const DEFAULT_MAX_PAYLOAD_SIZE: usize = 1450;

pub struct GenericProcessor {
    max_payload_size: usize,
}

impl GenericProcessor {
    pub fn new(_format: Arc<Format>) -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
        }
    }
}

impl FormatProcessor for GenericProcessor {
    fn process_unit(&mut self, _unit: Unit) -> Result<Option<(Unit, Vec<RtpPacket>)>> {
        Err(CoreError::UnsupportedFormat(
            "generic format processor cannot encode decoded units".to_string(),
        ))
    }

    fn process_rtp_packet(
        &mut self,
        mut packet: RtpPacket,
        _has_non_rtsp_readers: bool,
    ) -> Result<ProcessedPacket> {
        packet.strip_padding();
        if packet.payload.len() > self.max_payload_size {
            return Err(CoreError::OversizedPacket {
                payload_type: packet.payload_type,
                size: packet.payload.len(),
                max: self.max_payload_size,
            });
        }
        Ok(ProcessedPacket {
            packets: vec![packet],
            decoded: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::Codec;
    use std::time::SystemTime;

    #[test]
    fn process_unit_always_fails() {
        let mut p = GenericProcessor::new(Arc::new(Format::new(Codec::Generic, 99, 90_000)));
        let unit = Unit::from_payload(0, SystemTime::now(), crate::unit::Payload::Generic(vec![1]));
        assert!(p.process_unit(unit).is_err());
    }

    #[test]
    fn process_rtp_packet_strips_padding() {
        let mut p = GenericProcessor::new(Arc::new(Format::new(Codec::Generic, 99, 90_000)));
        let packet = RtpPacket {
            version: 2,
            padding: true,
            marker: false,
            payload_type: 99,
            sequence_number: 1,
            timestamp: 1,
            ssrc: 1,
            payload: vec![1, 2, 3],
        };
        let result = p.process_rtp_packet(packet, false).unwrap();
        assert!(!result.packets[0].padding);
    }
}
