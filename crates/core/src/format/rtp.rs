//! Generic RTP packet representation and header-field encoder state
//! (RFC 3550 §5.1), shared by every per-codec [`super::FormatProcessor`].

use rand::RngExt;

/// A full RTP packet: fixed header fields plus payload bytes.
///
/// Supports parsing incoming packets as well as building outgoing ones,
/// since the per-codec processors need to inspect and rewrite packets a
/// publisher handed in, not just produce new ones.
#[derive(Debug, Clone)]
pub struct RtpPacket {
    pub version: u8,
    pub padding: bool,
    pub marker: bool,
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub payload: Vec<u8>,
}

impl RtpPacket {
    /// Parse a packet with a 12-byte fixed header. CSRC list and header
    /// extensions, if present, are skipped over rather than retained —
    /// only the fields the format processors actually consume are kept.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 12 {
            return None;
        }
        let version = bytes[0] >> 6;
        let padding = bytes[0] & 0x20 != 0;
        let has_extension = bytes[0] & 0x10 != 0;
        let cc = (bytes[0] & 0x0f) as usize;
        let marker = bytes[1] & 0x80 != 0;
        let payload_type = bytes[1] & 0x7f;
        let sequence_number = u16::from_be_bytes([bytes[2], bytes[3]]);
        let timestamp = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        let ssrc = u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);

        let mut offset = 12 + cc * 4;
        if has_extension {
            if bytes.len() < offset + 4 {
                return None;
            }
            let ext_len_words =
                u16::from_be_bytes([bytes[offset + 2], bytes[offset + 3]]) as usize;
            offset += 4 + ext_len_words * 4;
        }
        if offset > bytes.len() {
            return None;
        }

        let mut payload = bytes[offset..].to_vec();
        if padding {
            if let Some(&pad_len) = payload.last() {
                let pad_len = pad_len as usize;
                if pad_len > 0 && pad_len <= payload.len() {
                    payload.truncate(payload.len() - pad_len);
                }
            }
        }

        Some(Self {
            version,
            padding,
            marker,
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
            payload,
        })
    }

    /// Serialize back to wire format. Padding is never re-added — by the
    /// time a packet leaves the format processor it has already gone
    /// through [`strip_padding`](Self::strip_padding).
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(12 + self.payload.len());
        out.push(2 << 6);
        out.push(((self.marker as u8) << 7) | self.payload_type);
        out.extend_from_slice(&self.sequence_number.to_be_bytes());
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        out.extend_from_slice(&self.ssrc.to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Clear the padding flag. The
    /// padding bytes themselves were already stripped from `payload` at
    /// parse time.
    pub fn strip_padding(&mut self) {
        self.padding = false;
    }

    pub fn size(&self) -> usize {
        12 + self.payload.len()
    }
}

/// Sequence/timestamp/SSRC generator shared by every per-codec packetizer.
///
/// Timestamp is kept as `u64` internally to avoid ambiguity during
/// duration arithmetic; only the low 32 bits are ever written to the wire.
#[derive(Debug)]
pub struct RtpEncoderState {
    pub payload_type: u8,
    pub ssrc: u32,
    sequence: u16,
    timestamp: u64,
}

impl RtpEncoderState {
    pub fn new(payload_type: u8, ssrc: u32) -> Self {
        Self {
            payload_type,
            ssrc,
            sequence: 0,
            timestamp: 0,
        }
    }

    pub fn with_random_ssrc(payload_type: u8) -> Self {
        Self::new(payload_type, rand::rng().random::<u32>())
    }

    /// Seed sequence and SSRC from an upstream packet — used when
    /// installing a re-encoder so the output stream continues the same
    /// SSRC and sequence space the oversized packet started from.
    pub fn seeded_from(payload_type: u8, ssrc: u32, starting_sequence: u16) -> Self {
        Self {
            payload_type,
            ssrc,
            sequence: starting_sequence,
            timestamp: 0,
        }
    }

    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    pub fn timestamp(&self) -> u32 {
        self.timestamp as u32
    }

    pub fn set_timestamp(&mut self, ts: u32) {
        self.timestamp = ts as u64;
    }

    pub fn advance_timestamp(&mut self, increment: u32) {
        self.timestamp = self.timestamp.wrapping_add(increment as u64);
    }

    /// Build the next packet, consuming one sequence number.
    pub fn next_packet(&mut self, marker: bool, payload: Vec<u8>) -> RtpPacket {
        let packet = RtpPacket {
            version: 2,
            padding: false,
            marker,
            payload_type: self.payload_type,
            sequence_number: self.sequence,
            timestamp: self.timestamp as u32,
            ssrc: self.ssrc,
            payload,
        };
        self.sequence = self.sequence.wrapping_add(1);
        packet
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_roundtrip() {
        let mut enc = RtpEncoderState::new(96, 0xAABBCCDD);
        enc.set_timestamp(1000);
        let pkt = enc.next_packet(true, vec![1, 2, 3]);
        let bytes = pkt.serialize();
        let parsed = RtpPacket::parse(&bytes).unwrap();
        assert_eq!(parsed.ssrc, 0xAABBCCDD);
        assert_eq!(parsed.timestamp, 1000);
        assert_eq!(parsed.payload, vec![1, 2, 3]);
        assert!(parsed.marker);
    }

    #[test]
    fn strip_padding_clears_flag_and_bytes() {
        // header + 3 bytes payload + 2 bytes padding, pad count = 2
        let mut raw = vec![0x82, 0x60, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0];
        raw.extend_from_slice(&[0xAA, 0xBB, 0xCC, 0x00, 0x02]);
        let mut pkt = RtpPacket::parse(&raw).unwrap();
        assert!(pkt.padding);
        assert_eq!(pkt.payload, vec![0xAA, 0xBB, 0xCC]);
        pkt.strip_padding();
        assert!(!pkt.padding);
    }

    #[test]
    fn sequence_wraps() {
        let mut enc = RtpEncoderState::new(96, 1);
        for _ in 0..u16::MAX {
            enc.next_packet(false, vec![]);
        }
        assert_eq!(enc.sequence(), u16::MAX);
        enc.next_packet(false, vec![]);
        assert_eq!(enc.sequence(), 0);
    }
}
