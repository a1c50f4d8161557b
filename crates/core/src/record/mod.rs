//! Recording agent and recording cleaner.
//!
//! The agent is a reader like any other (it attaches through
//! [`crate::path::PathHandle::add_reader`]); what distinguishes it is that
//! its callback feeds a segmented file writer instead of a network
//! socket. On any write error it detaches, logs, and re-attaches a fresh
//! instance after `restartPause` — the outer [`RecordingAgent::stop`]
//! is what actually ends the loop.

pub mod cleaner;
pub mod dts;
pub mod fmp4;
pub mod mpegts;
pub mod segment;
pub mod writer;

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::Local;

use crate::config::{RecordConfig, RecordFormat};
use crate::error::CoreError;
use crate::path::PathHandle;
use crate::stream::{ReaderKind, is_keyframe_unit};
use crate::unit::{Codec, Payload, Unit};
use writer::FileWriter;

fn payload_bytes(payload: &Payload) -> Vec<u8> {
    match payload {
        Payload::H264(nals) | Payload::H265(nals) | Payload::Av1(nals) => {
            let mut out = Vec::new();
            for nal in nals {
                out.extend_from_slice(&(nal.len() as u32).to_be_bytes());
                out.extend_from_slice(nal);
            }
            out
        }
        Payload::Opus(pkts) => pkts.concat(),
        Payload::Mpeg4Video(b) | Payload::Pcm(b) | Payload::Generic(b) => b.clone(),
    }
}

fn micros_for(pts: i64, clock_rate: u32) -> u64 {
    if clock_rate == 0 {
        return pts.max(0) as u64;
    }
    ((pts.max(0) as u128 * 1_000_000) / clock_rate as u128) as u64
}

enum ActiveWriter {
    Fmp4 {
        segment: fmp4::Fmp4Segment<FileWriter>,
        pending: Vec<fmp4::Sample>,
        last_part_dts: u64,
        part_ticks_us: u64,
    },
    Mpegts {
        segment: mpegts::MpegTsSegment<FileWriter>,
    },
}

impl ActiveWriter {
    fn write_sample(
        &mut self,
        track_id: u32,
        ts_pid: u16,
        dts_us: u64,
        is_video: bool,
        data: &[u8],
    ) -> io::Result<()> {
        match self {
            ActiveWriter::Fmp4 {
                segment,
                pending,
                last_part_dts,
                part_ticks_us,
            } => {
                pending.push(fmp4::Sample {
                    track_id,
                    dts: dts_us,
                    is_sync: true,
                    data: data.to_vec(),
                });
                if dts_us.saturating_sub(*last_part_dts) >= *part_ticks_us {
                    let batch = std::mem::take(pending);
                    segment.write_part(&batch)?;
                    *last_part_dts = dts_us;
                }
                Ok(())
            }
            ActiveWriter::Mpegts { segment } => segment.write_sample(ts_pid, dts_us, is_video, data),
        }
    }

    fn close(self) -> io::Result<()> {
        match self {
            ActiveWriter::Fmp4 { segment, pending, .. } => {
                let mut segment = segment;
                if !pending.is_empty() {
                    segment.write_part(&pending)?;
                }
                segment.close()
            }
            ActiveWriter::Mpegts { segment } => segment.close(),
        }
    }
}

/// First MPEG-TS elementary PID handed out to a recording session's
/// tracks; PIDs below this are reserved for PAT/PMT.
const FIRST_ELEMENTARY_PID: u16 = 256;

struct TrackMeta {
    track_id: u32,
    ts_pid: u16,
    codec: Codec,
    clock_rate: u32,
    is_video: bool,
}

struct SessionState {
    path_name: String,
    config: RecordConfig,
    tracks: HashMap<(usize, usize), TrackMeta>,
    active: Option<ActiveWriter>,
    segment_start_us: Option<u64>,
    current_path: Option<std::path::PathBuf>,
    has_video: bool,
    error: bool,
}

impl SessionState {
    fn open_segment(&mut self, now: chrono::DateTime<Local>) -> Result<(), CoreError> {
        let path = segment::encode(&self.config.path_format, &self.path_name, now);
        let init_tracks: Vec<fmp4::TrackInit> = self
            .tracks
            .values()
            .map(|t| fmp4::TrackInit {
                track_id: t.track_id,
                kind: if t.is_video {
                    crate::unit::MediaKind::Video
                } else {
                    crate::unit::MediaKind::Audio
                },
                codec: t.codec,
                clock_rate: t.clock_rate,
            })
            .collect();

        let writer = FileWriter::create(&path).map_err(|source| CoreError::RecordingWrite {
            path: self.path_name.clone(),
            source,
        })?;

        let active = match self.config.format {
            RecordFormat::Fmp4 => {
                let segment = fmp4::Fmp4Segment::create(writer, &init_tracks).map_err(|source| {
                    CoreError::RecordingWrite {
                        path: self.path_name.clone(),
                        source,
                    }
                })?;
                ActiveWriter::Fmp4 {
                    segment,
                    pending: Vec::new(),
                    last_part_dts: 0,
                    part_ticks_us: self.config.part_duration.as_micros() as u64,
                }
            }
            RecordFormat::Mpegts => {
                let pid_tracks: Vec<(u16, Codec)> =
                    self.tracks.values().map(|t| (t.ts_pid, t.codec)).collect();
                let segment = mpegts::MpegTsSegment::create(
                    writer,
                    &pid_tracks,
                    self.config.part_duration.as_micros() as u64,
                )
                .map_err(|source| CoreError::RecordingWrite {
                    path: self.path_name.clone(),
                    source,
                })?;
                ActiveWriter::Mpegts { segment }
            }
        };

        tracing::info!(path = %path.display(), "recording segment created");
        self.active = Some(active);
        self.current_path = Some(path);
        Ok(())
    }

    fn close_segment(&mut self) {
        if let Some(active) = self.active.take() {
            if let Err(err) = active.close() {
                tracing::warn!(path = %self.path_name, error = %err, "error closing recording segment");
            }
        }
        if let Some(path) = self.current_path.take() {
            tracing::info!(path = %path.display(), "recording segment complete");
        }
        self.segment_start_us = None;
    }

    fn handle_unit(&mut self, media_index: usize, format_index: usize, unit: Arc<Unit>) -> Result<(), String> {
        if self.error {
            return Err("recording session already failed".to_string());
        }
        let Some(meta) = self.tracks.get(&(media_index, format_index)) else {
            return Ok(());
        };
        let track_id = meta.track_id;
        let ts_pid = meta.ts_pid;
        let codec = meta.codec;
        let clock_rate = meta.clock_rate;
        let is_video = meta.is_video;

        let Some(payload) = &unit.payload else {
            return Ok(());
        };
        if payload.is_empty() {
            return Ok(());
        }
        let data = payload_bytes(payload);
        let dts_us = match dts::extract_dts(codec, micros_for(unit.pts, clock_rate), Some(&data)) {
            Ok(dts) => dts,
            Err(err) => {
                self.error = true;
                return Err(err.to_string());
            }
        };
        let is_sync = !self.has_video || is_keyframe_unit(&unit);

        let now = Local::now();
        if self.active.is_none() {
            if !is_sync {
                return Ok(());
            }
            if let Err(err) = self.open_segment(now) {
                self.error = true;
                return Err(err.to_string());
            }
            self.segment_start_us = Some(dts_us);
        } else if is_sync {
            let elapsed = dts_us.saturating_sub(self.segment_start_us.unwrap_or(dts_us));
            if elapsed >= self.config.segment_duration.as_micros() as u64 {
                self.close_segment();
                if let Err(err) = self.open_segment(now) {
                    self.error = true;
                    return Err(err.to_string());
                }
                self.segment_start_us = Some(dts_us);
            }
        }

        if let Some(active) = &mut self.active {
            if let Err(err) = active.write_sample(track_id, ts_pid, dts_us, is_video, &data) {
                let core_err = CoreError::RecordingWrite {
                    path: self.path_name.clone(),
                    source: err,
                };
                self.error = true;
                return Err(core_err.to_string());
            }
        }
        Ok(())
    }
}

impl Drop for SessionState {
    fn drop(&mut self) {
        self.close_segment();
    }
}

/// A single recording attempt: attaches one reader per (media, format)
/// pair, runs until a write error or the agent is stopped.
fn run_attempt(path_handle: &PathHandle, path_name: &str, config: &RecordConfig, running: &Arc<AtomicBool>) {
    let (_stream, medias) = loop {
        if !running.load(Ordering::Relaxed) {
            return;
        }
        match path_handle.snapshot() {
            Some(snapshot) => break snapshot,
            None => std::thread::sleep(Duration::from_millis(200)),
        }
    };

    let mut tracks = HashMap::new();
    let mut has_video = false;
    let mut next_track_id = 1u32;
    let mut next_ts_pid = FIRST_ELEMENTARY_PID;
    for (media_index, media) in medias.iter().enumerate() {
        if media.kind == crate::unit::MediaKind::Video {
            has_video = true;
        }
        for (format_index, format) in media.formats.iter().enumerate() {
            tracks.insert(
                (media_index, format_index),
                TrackMeta {
                    track_id: next_track_id,
                    ts_pid: next_ts_pid,
                    codec: format.codec,
                    clock_rate: format.clock_rate,
                    is_video: media.kind == crate::unit::MediaKind::Video,
                },
            );
            next_track_id += 1;
            next_ts_pid += 1;
        }
    }

    let state = Arc::new(Mutex::new(SessionState {
        path_name: path_name.to_string(),
        config: config.clone(),
        tracks,
        active: None,
        segment_start_us: None,
        current_path: None,
        has_video,
        error: false,
    }));

    let mut reader_handles = Vec::new();
    for (media_index, media) in medias.iter().enumerate() {
        for (format_index, _format) in media.formats.iter().enumerate() {
            let state = state.clone();
            let attached = path_handle.add_reader(media_index, format_index, ReaderKind::NonRtsp, move |unit| {
                state.lock().unwrap().handle_unit(media_index, format_index, unit)
            });
            if let Some((_stream, reader_id)) = attached {
                reader_handles.push((media_index, format_index, reader_id));
            }
        }
    }

    while running.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(200));
        if state.lock().unwrap().error {
            break;
        }
    }

    for (media_index, format_index, reader_id) in reader_handles {
        path_handle.remove_reader(media_index, format_index, reader_id);
    }
}

pub struct RecordingAgent {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl RecordingAgent {
    pub fn spawn(path_handle: PathHandle, path_name: String, config: RecordConfig, restart_pause: Duration) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let running_clone = running.clone();
        let thread = std::thread::spawn(move || {
            while running_clone.load(Ordering::Relaxed) {
                run_attempt(&path_handle, &path_name, &config, &running_clone);
                if !running_clone.load(Ordering::Relaxed) {
                    break;
                }
                std::thread::sleep(restart_pause);
            }
        });
        Self {
            running,
            thread: Some(thread),
        }
    }

    pub fn stop(mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

impl Drop for RecordingAgent {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}
