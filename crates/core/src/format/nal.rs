//! Annex B start-code scanning shared by [`super::h264`] and [`super::h265`].

/// Split an Annex B bitstream into its constituent NAL units, stripping
/// start codes. Handles both the 4-byte (`00 00 00 01`) and 3-byte
/// (`00 00 01`) forms, tracking each one's length so mixed streams are
/// sliced correctly.
pub fn split_annex_b(data: &[u8]) -> Vec<Vec<u8>> {
    let mut nal_units = Vec::new();
    let mut i = 0usize;
    let mut start_entries: Vec<(usize, usize)> = Vec::new();

    while i < data.len() {
        if i + 3 < data.len() && data[i..i + 4] == [0, 0, 0, 1] {
            start_entries.push((i + 4, 4));
            i += 4;
        } else if i + 2 < data.len() && data[i..i + 3] == [0, 0, 1] {
            start_entries.push((i + 3, 3));
            i += 3;
        } else {
            i += 1;
        }
    }

    for (idx, &(start, _)) in start_entries.iter().enumerate() {
        let end = if idx + 1 < start_entries.len() {
            let (next_start, next_sc_len) = start_entries[idx + 1];
            next_start - next_sc_len
        } else {
            data.len()
        };
        if start < end {
            nal_units.push(data[start..end].to_vec());
        }
    }

    nal_units
}

/// Re-join NAL units into an Annex B bitstream using 4-byte start codes.
pub fn join_annex_b(nals: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::new();
    for nal in nals {
        if nal.is_empty() {
            continue;
        }
        out.extend_from_slice(&[0, 0, 0, 1]);
        out.extend_from_slice(nal);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_mixed_start_codes() {
        let mut data = vec![0, 0, 0, 1, 0x67, 0x42];
        data.extend_from_slice(&[0, 0, 1, 0x68, 0xCE]);
        let nals = split_annex_b(&data);
        assert_eq!(nals, vec![vec![0x67, 0x42], vec![0x68, 0xCE]]);
    }

    #[test]
    fn roundtrips_through_join() {
        let nals = vec![vec![0x67, 0x42], vec![0x68, 0xCE]];
        let joined = join_annex_b(&nals);
        assert_eq!(split_annex_b(&joined), nals);
    }
}
