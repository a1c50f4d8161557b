//! Fragmented MP4 segment writer.
//!
//! Each segment is one `ftyp`+`moov` init pair followed by a `moof`+`mdat`
//! pair per `partDuration` window. Box bodies are built by hand — there's
//! no ISO-BMFF crate in the stack, and the box set needed here is small.

use std::io;

use crate::unit::{Codec, MediaKind};

use super::writer::SegmentWriter;

fn write_box(out: &mut Vec<u8>, fourcc: &[u8; 4], body: &[u8]) {
    let size = (body.len() + 8) as u32;
    out.extend_from_slice(&size.to_be_bytes());
    out.extend_from_slice(fourcc);
    out.extend_from_slice(body);
}

fn codec_sample_entry_tag(codec: Codec) -> &'static [u8; 4] {
    match codec {
        Codec::H264 => b"avc1",
        Codec::H265 => b"hvc1",
        Codec::Opus => b"Opus",
        Codec::G711 { a_law: true } => b"alaw",
        Codec::G711 { a_law: false } => b"ulaw",
        Codec::Lpcm => b"lpcm",
        Codec::Mpeg4Video | Codec::Av1 | Codec::Generic => b"mp4v",
    }
}

/// One track's static descriptor, carried in `moov`.
pub struct TrackInit {
    pub track_id: u32,
    pub kind: MediaKind,
    pub codec: Codec,
    pub clock_rate: u32,
}

fn build_ftyp() -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(b"iso5");
    body.extend_from_slice(&512u32.to_be_bytes());
    body.extend_from_slice(b"iso5");
    body.extend_from_slice(b"iso6");
    body.extend_from_slice(b"mp41");
    let mut out = Vec::new();
    write_box(&mut out, b"ftyp", &body);
    out
}

fn build_trak(track: &TrackInit) -> Vec<u8> {
    let mut tkhd = Vec::new();
    tkhd.push(0); // version
    tkhd.extend_from_slice(&[0, 0, 3]); // flags: enabled | in_movie
    tkhd.extend_from_slice(&[0u8; 8]); // creation/modification time
    tkhd.extend_from_slice(&track.track_id.to_be_bytes());

    let mut stsd_entry = Vec::new();
    stsd_entry.extend_from_slice(&[0u8; 6]);
    stsd_entry.extend_from_slice(&1u16.to_be_bytes()); // data_reference_index
    let mut stsd_box = Vec::new();
    write_box(&mut stsd_box, codec_sample_entry_tag(track.codec), &stsd_entry);

    let mut stsd = Vec::new();
    stsd.extend_from_slice(&[0u8; 4]);
    stsd.extend_from_slice(&1u32.to_be_bytes());
    stsd.extend_from_slice(&stsd_box);

    let mut stbl = Vec::new();
    write_box(&mut stbl, b"stsd", &stsd);

    let mut mdhd = Vec::new();
    mdhd.push(0);
    mdhd.extend_from_slice(&[0u8; 11]);
    mdhd.extend_from_slice(&track.clock_rate.to_be_bytes());

    let mut minf = Vec::new();
    write_box(&mut minf, b"stbl", &stbl);

    let mut mdia = Vec::new();
    write_box(&mut mdia, b"mdhd", &mdhd);
    write_box(&mut mdia, b"minf", &minf);

    let mut trak = Vec::new();
    write_box(&mut trak, b"tkhd", &tkhd);
    write_box(&mut trak, b"mdia", &mdia);
    trak
}

fn build_moov(tracks: &[TrackInit]) -> Vec<u8> {
    let mut mvhd = Vec::new();
    mvhd.push(0);
    mvhd.extend_from_slice(&[0u8; 11]);
    mvhd.extend_from_slice(&1000u32.to_be_bytes()); // timescale
    mvhd.extend_from_slice(&0u32.to_be_bytes()); // duration (fragmented: unknown)

    let mut mvex = Vec::new();
    for track in tracks {
        let mut trex = Vec::new();
        trex.extend_from_slice(&[0u8; 4]);
        trex.extend_from_slice(&track.track_id.to_be_bytes());
        trex.extend_from_slice(&1u32.to_be_bytes()); // default_sample_description_index
        trex.extend_from_slice(&0u32.to_be_bytes());
        trex.extend_from_slice(&0u32.to_be_bytes());
        trex.extend_from_slice(&0u32.to_be_bytes());
        write_box(&mut mvex, b"trex", &trex);
    }

    let mut moov = Vec::new();
    write_box(&mut moov, b"mvhd", &mvhd);
    for track in tracks {
        let trak = build_trak(track);
        moov.extend_from_slice(&trak);
    }
    write_box(&mut moov, b"mvex", &mvex);
    let mut out = Vec::new();
    write_box(&mut out, b"moov", &moov);
    out
}

/// One sample handed to [`Fmp4Segment::write_part`].
pub struct Sample {
    pub track_id: u32,
    pub dts: u64,
    pub is_sync: bool,
    pub data: Vec<u8>,
}

fn build_part(sequence_number: u32, samples: &[Sample]) -> (Vec<u8>, Vec<u8>) {
    let mut mdat_body = Vec::new();
    let mut traf_entries = Vec::new();
    for track_id in samples.iter().map(|s| s.track_id).collect::<std::collections::BTreeSet<_>>() {
        let track_samples: Vec<&Sample> = samples.iter().filter(|s| s.track_id == track_id).collect();

        let mut tfhd = Vec::new();
        tfhd.extend_from_slice(&[0u8; 4]);
        tfhd.extend_from_slice(&track_id.to_be_bytes());

        let mut tfdt = Vec::new();
        tfdt.push(1); // version 1: 64-bit base media decode time
        tfdt.extend_from_slice(&[0u8; 3]);
        let base_dts = track_samples.first().map(|s| s.dts).unwrap_or(0);
        tfdt.extend_from_slice(&base_dts.to_be_bytes());

        let mut trun = Vec::new();
        trun.extend_from_slice(&[0u8; 4]);
        trun.extend_from_slice(&(track_samples.len() as u32).to_be_bytes());
        for sample in &track_samples {
            trun.extend_from_slice(&(sample.data.len() as u32).to_be_bytes());
            mdat_body.extend_from_slice(&sample.data);
        }

        let mut traf = Vec::new();
        write_box(&mut traf, b"tfhd", &tfhd);
        write_box(&mut traf, b"tfdt", &tfdt);
        write_box(&mut traf, b"trun", &trun);
        traf_entries.extend_from_slice(&traf);
    }

    let mut mfhd = Vec::new();
    mfhd.extend_from_slice(&[0u8; 4]);
    mfhd.extend_from_slice(&sequence_number.to_be_bytes());

    let mut moof = Vec::new();
    write_box(&mut moof, b"mfhd", &mfhd);
    moof.extend_from_slice(&traf_entries);
    let mut moof_box = Vec::new();
    write_box(&mut moof_box, b"moof", &moof);

    let mut mdat = Vec::new();
    write_box(&mut mdat, b"mdat", &mdat_body);

    (moof_box, mdat)
}

/// A single segment's writer state: init section already flushed, tracks
/// the moof sequence number across parts.
pub struct Fmp4Segment<W: SegmentWriter> {
    writer: W,
    next_sequence: u32,
}

impl<W: SegmentWriter> Fmp4Segment<W> {
    pub fn create(mut writer: W, tracks: &[TrackInit]) -> io::Result<Self> {
        writer.write_all(&build_ftyp())?;
        writer.write_all(&build_moov(tracks))?;
        Ok(Self {
            writer,
            next_sequence: 1,
        })
    }

    /// Write one `moof`+`mdat` part.
    pub fn write_part(&mut self, samples: &[Sample]) -> io::Result<()> {
        if samples.is_empty() {
            return Ok(());
        }
        let (moof, mdat) = build_part(self.next_sequence, samples);
        self.next_sequence += 1;
        self.writer.write_all(&moof)?;
        self.writer.write_all(&mdat)?;
        self.writer.flush()
    }

    pub fn close(mut self) -> io::Result<()> {
        self.writer.sync_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::writer::MemoryWriter;

    fn h264_track() -> TrackInit {
        TrackInit {
            track_id: 1,
            kind: MediaKind::Video,
            codec: Codec::H264,
            clock_rate: 90_000,
        }
    }

    #[test]
    fn init_writes_ftyp_and_moov() {
        let segment = Fmp4Segment::create(MemoryWriter::default(), &[h264_track()]).unwrap();
        let buf = &segment.writer.buf;
        assert_eq!(&buf[4..8], b"ftyp");
        let ftyp_size = u32::from_be_bytes(buf[0..4].try_into().unwrap()) as usize;
        assert_eq!(&buf[ftyp_size + 4..ftyp_size + 8], b"moov");
    }

    #[test]
    fn write_part_emits_moof_then_mdat_with_sample_bytes() {
        let mut segment = Fmp4Segment::create(MemoryWriter::default(), &[h264_track()]).unwrap();
        let before = segment.writer.buf.len();
        segment
            .write_part(&[Sample {
                track_id: 1,
                dts: 0,
                is_sync: true,
                data: vec![1, 2, 3, 4],
            }])
            .unwrap();
        let buf = &segment.writer.buf;
        assert!(buf.len() > before);
        assert_eq!(&buf[before + 4..before + 8], b"moof");
        assert_eq!(segment.writer.flushes, 1);
        assert!(buf.windows(4).any(|w| w == [1, 2, 3, 4]));
    }

    #[test]
    fn empty_part_writes_nothing() {
        let mut segment = Fmp4Segment::create(MemoryWriter::default(), &[h264_track()]).unwrap();
        let before = segment.writer.buf.len();
        segment.write_part(&[]).unwrap();
        assert_eq!(segment.writer.buf.len(), before);
    }
}
