//! DTS extraction for the MPEG-TS writer.
//!
//! H.264/H.265/Opus/PCM/AV1 tracks carry no B-frame reordering in this
//! router (the format processors never buffer out-of-order access units),
//! so their decode time equals their presentation time. MPEG-4 visual
//! streams are scanned for a B-coded VOP; if one is present, decode-time
//! synthesis would be required, so the stream is rejected instead.

use crate::error::{CoreError, Result};
use crate::unit::Codec;

const VOP_START_CODE: u8 = 0xB6;

/// VOP `coding_type` values (ISO/IEC 14496-2 §6.3.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VopCodingType {
    I,
    P,
    B,
    Reserved,
}

fn vop_coding_type(vop_payload_first_byte: u8) -> VopCodingType {
    match vop_payload_first_byte >> 6 {
        0 => VopCodingType::I,
        1 => VopCodingType::P,
        2 => VopCodingType::B,
        _ => VopCodingType::Reserved,
    }
}

/// Scan a raw MPEG-4 visual chunk for VOP start codes and return whether
/// any are B-coded.
fn contains_b_frame(raw: &[u8]) -> bool {
    let mut i = 0;
    while i + 4 < raw.len() {
        if raw[i] == 0 && raw[i + 1] == 0 && raw[i + 2] == 1 && raw[i + 3] == VOP_START_CODE {
            if vop_coding_type(raw[i + 4]) == VopCodingType::B {
                return true;
            }
            i += 4;
        } else {
            i += 1;
        }
    }
    false
}

/// Compute the decode timestamp for one sample, or reject the stream
/// outright when it's MPEG-4 video using B-frames.
pub fn extract_dts(codec: Codec, pts: u64, raw_payload: Option<&[u8]>) -> Result<u64> {
    match codec {
        Codec::Mpeg4Video => {
            if let Some(raw) = raw_payload {
                if contains_b_frame(raw) {
                    return Err(CoreError::UnsupportedFormat(
                        "MPEG-4 video with B-frames cannot be recorded to MPEG-TS".to_string(),
                    ));
                }
            }
            Ok(pts)
        }
        _ => Ok(pts),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn i_frame_only_stream_passes_through() {
        let raw = [0, 0, 1, VOP_START_CODE, 0x00, 0xaa];
        let dts = extract_dts(Codec::Mpeg4Video, 1000, Some(&raw)).unwrap();
        assert_eq!(dts, 1000);
    }

    #[test]
    fn b_frame_stream_is_rejected() {
        let raw = [0, 0, 1, VOP_START_CODE, 0x80, 0xaa];
        let result = extract_dts(Codec::Mpeg4Video, 1000, Some(&raw));
        assert!(matches!(result, Err(CoreError::UnsupportedFormat(_))));
    }

    #[test]
    fn non_mpeg4_passes_through_unconditionally() {
        assert_eq!(extract_dts(Codec::H264, 42, None).unwrap(), 42);
    }
}
