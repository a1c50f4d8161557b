//! Stream fan-out engine.
//!
//! A [`Stream`] is created once a publisher's session description is
//! accepted. It owns one [`FormatProcessor`] per (media, format) pair,
//! every reader's bounded delivery queue, and — for video when enabled —
//! a GOP replay cache so a reader that attaches mid-stream can catch up
//! to live without waiting for the next key frame.

pub mod queue;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime};

use crate::error::Result;
use crate::format::{self, FormatProcessor};
use crate::format::rtp::RtpPacket;
use crate::unit::{Format, Media, MediaKind, Unit};
use queue::{DeliveryJob, ReaderQueue};

/// Whether a reader speaks raw RTP (forward packets unmodified) or wants a
/// decoded [`Unit`] (forward the processor's decoded payload).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderKind {
    Rtsp,
    NonRtsp,
}

pub type ReaderId = u64;

/// Delivery target: queue plus the callback the queue's worker invokes.
struct ReaderBinding {
    kind: ReaderKind,
    queue: Arc<ReaderQueue>,
    callback: Arc<dyn Fn(Arc<Unit>) -> std::result::Result<(), String> + Send + Sync>,
}

/// Cached units bracketed by the most recent key frame, used to fast-start
/// a newly attached reader.
struct GopCache {
    units: Vec<Arc<Unit>>,
}

impl GopCache {
    fn new() -> Self {
        Self { units: Vec::new() }
    }

    fn push(&mut self, unit: Arc<Unit>, is_keyframe: bool) {
        if is_keyframe {
            self.units.clear();
        }
        self.units.push(unit);
    }
}

/// Per-(media, format) processing and delivery state.
struct MediaRecord {
    media: Arc<Media>,
    format: Arc<Format>,
    processor: Mutex<Box<dyn FormatProcessor>>,
    bindings: RwLock<HashMap<ReaderId, ReaderBinding>>,
    gop_cache: Mutex<Option<GopCache>>,
    non_rtsp_reader_count: AtomicU64,
}

/// Default cadence between replayed GOP-cache units.
const DEFAULT_GOP_REPLAY_CADENCE: Duration = Duration::from_millis(10);

pub struct Stream {
    records: Vec<MediaRecord>,
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
    next_reader_id: AtomicU64,
    gop_cache_enabled: bool,
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("media_count", &self.records.len())
            .field("bytes_received", &self.bytes_received.load(Ordering::Relaxed))
            .field("bytes_sent", &self.bytes_sent.load(Ordering::Relaxed))
            .field("gop_cache_enabled", &self.gop_cache_enabled)
            .finish()
    }
}

impl Stream {
    pub fn new(medias: Vec<Arc<Media>>, random_start: u32, gop_cache_enabled: bool) -> Self {
        let mut records = Vec::new();
        for media in medias {
            for format in &media.formats {
                let processor = format::for_format(format.clone(), random_start);
                let has_gop = gop_cache_enabled && media.kind == MediaKind::Video;
                records.push(MediaRecord {
                    media: media.clone(),
                    format: format.clone(),
                    processor: Mutex::new(processor),
                    bindings: RwLock::new(HashMap::new()),
                    gop_cache: Mutex::new(has_gop.then(GopCache::new)),
                    non_rtsp_reader_count: AtomicU64::new(0),
                });
            }
        }
        Self {
            records,
            bytes_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            next_reader_id: AtomicU64::new(1),
            gop_cache_enabled,
        }
    }

    fn find_record(&self, media: &Arc<Media>, format: &Arc<Format>) -> Option<&MediaRecord> {
        self.records
            .iter()
            .find(|r| Arc::ptr_eq(&r.media, media) && Arc::ptr_eq(&r.format, format))
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    /// Attach a new reader to this stream.
    pub fn add_reader(
        &self,
        media: &Arc<Media>,
        format: &Arc<Format>,
        kind: ReaderKind,
        callback: impl Fn(Arc<Unit>) -> std::result::Result<(), String> + Send + Sync + 'static,
    ) -> Option<ReaderId> {
        let record = self.find_record(media, format)?;
        let id = self.next_reader_id.fetch_add(1, Ordering::Relaxed);
        let binding = ReaderBinding {
            kind,
            queue: Arc::new(ReaderQueue::new(format!("reader-{id}"))),
            callback: Arc::new(callback),
        };
        if kind == ReaderKind::NonRtsp {
            record.non_rtsp_reader_count.fetch_add(1, Ordering::Relaxed);
        }
        record.bindings.write().unwrap().insert(id, binding);
        Some(id)
    }

    pub fn remove_reader(&self, media: &Arc<Media>, format: &Arc<Format>, reader: ReaderId) {
        if let Some(record) = self.find_record(media, format) {
            if let Some(binding) = record.bindings.write().unwrap().remove(&reader) {
                if binding.kind == ReaderKind::NonRtsp {
                    record.non_rtsp_reader_count.fetch_sub(1, Ordering::Relaxed);
                }
            }
        }
    }

    /// Drop every reader binding, delivering a terminal error to each
    /// non-RTSP reader's worker first so it observes the publisher's
    /// departure instead of silently going quiet.
    pub fn remove_all_readers(&self) {
        for record in &self.records {
            let mut bindings = record.bindings.write().unwrap();
            for binding in bindings.values() {
                if binding.kind == ReaderKind::NonRtsp {
                    binding.queue.push(Box::new(|| Err("terminated".to_string())));
                }
            }
            bindings.clear();
            record.non_rtsp_reader_count.store(0, Ordering::Relaxed);
        }
    }

    /// Replay the GOP cache (if any) then let the queue drain live traffic
    /// as it arrives.
    pub fn start_reader(&self, media: &Arc<Media>, format: &Arc<Format>, reader: ReaderId) {
        let Some(record) = self.find_record(media, format) else {
            return;
        };
        let bindings = record.bindings.read().unwrap();
        let Some(binding) = bindings.get(&reader) else {
            return;
        };
        let cached: Vec<Arc<Unit>> = {
            let cache = record.gop_cache.lock().unwrap();
            cache.as_ref().map(|c| c.units.clone()).unwrap_or_default()
        };

        // Units consisting solely of parameter sets carry no slice data and
        // are skipped. The remaining units are re-spaced at a fixed cadence
        // — expressed in this format's own clock ticks, not raw PTS units —
        // and anchored so the last one lands exactly on the live edge the
        // reader is about to receive next.
        let filtered: Vec<Arc<Unit>> = cached.into_iter().filter(|u| !u.is_empty()).collect();
        let cadence_ticks =
            (format.clock_rate as i64 * DEFAULT_GOP_REPLAY_CADENCE.as_millis() as i64) / 1000;
        let live_pts = filtered.last().map(|u| u.pts);
        let last_index = filtered.len().saturating_sub(1);
        for (i, unit) in filtered.into_iter().enumerate() {
            let pts = match live_pts {
                Some(live) => live.wrapping_sub((last_index - i) as i64 * cadence_ticks),
                None => unit.pts,
            };
            let rewritten = Arc::new(Unit {
                pts,
                ntp: unit.ntp,
                payload: unit.payload.clone(),
                rtp_packets: unit.rtp_packets.clone(),
            });
            dispatch_to_binding(binding, rewritten);
        }
    }

    /// Total reader count across every (media, format) pair, used to decide
    /// whether an idle dynamic path is safe to garbage-collect.
    pub fn reader_count(&self) -> usize {
        self.records.iter().map(|r| r.bindings.read().unwrap().len()).sum()
    }

    /// Fan a decoded unit out to every reader subscribed to this (media, format) pair.
    pub fn write_unit(&self, media: &Arc<Media>, format: &Arc<Format>, unit: Unit) -> Result<()> {
        let Some(record) = self.find_record(media, format) else {
            return Ok(());
        };

        self.bytes_received
            .fetch_add(estimate_unit_size(&unit) as u64, Ordering::Relaxed);

        let produced = {
            let mut processor = record.processor.lock().unwrap();
            processor.process_unit(unit)?
        };
        let Some((decoded_unit, rtp_packets)) = produced else {
            return Ok(());
        };

        let is_keyframe = is_keyframe_unit(&decoded_unit);
        let decoded_arc = Arc::new(decoded_unit);

        if self.gop_cache_enabled {
            if let Some(cache) = record.gop_cache.lock().unwrap().as_mut() {
                cache.push(decoded_arc.clone(), is_keyframe);
            }
        }

        let bindings = record.bindings.read().unwrap();
        for binding in bindings.values() {
            match binding.kind {
                ReaderKind::NonRtsp => dispatch_to_binding(binding, decoded_arc.clone()),
                ReaderKind::Rtsp => {
                    for packet in &rtp_packets {
                        let pkt_unit = Arc::new(Unit::from_rtp(
                            decoded_arc.pts,
                            decoded_arc.ntp,
                            vec![packet.clone()],
                        ));
                        self.bytes_sent
                            .fetch_add(packet.size() as u64, Ordering::Relaxed);
                        dispatch_to_binding(binding, pkt_unit);
                    }
                }
            }
        }

        Ok(())
    }

    /// Fan an RTP packet out to every RTP-speaking reader on this (media, format) pair.
    pub fn write_rtp_packet(
        &self,
        media: &Arc<Media>,
        format: &Arc<Format>,
        packet: RtpPacket,
        _ntp: SystemTime,
        _pts: i64,
    ) -> Result<()> {
        let Some(record) = self.find_record(media, format) else {
            return Ok(());
        };

        self.bytes_received
            .fetch_add(packet.size() as u64, Ordering::Relaxed);

        let has_non_rtsp = record.non_rtsp_reader_count.load(Ordering::Relaxed) > 0;
        let processed = {
            let mut processor = record.processor.lock().unwrap();
            processor.process_rtp_packet(packet, has_non_rtsp)?
        };

        if processed.packets.is_empty() && processed.decoded.is_none() {
            return Ok(());
        }

        let decoded_arc = processed.decoded.map(Arc::new);
        if let Some(decoded) = &decoded_arc {
            if self.gop_cache_enabled {
                let is_kf = is_keyframe_unit(decoded);
                if let Some(cache) = record.gop_cache.lock().unwrap().as_mut() {
                    cache.push(decoded.clone(), is_kf);
                }
            }
        }

        let bindings = record.bindings.read().unwrap();
        for binding in bindings.values() {
            match binding.kind {
                ReaderKind::NonRtsp => {
                    if let Some(decoded) = &decoded_arc {
                        dispatch_to_binding(binding, decoded.clone());
                    }
                }
                ReaderKind::Rtsp => {
                    for packet in &processed.packets {
                        self.bytes_sent
                            .fetch_add(packet.size() as u64, Ordering::Relaxed);
                        let pkt_unit = Arc::new(Unit::from_rtp(
                            packet.timestamp as i64,
                            SystemTime::now(),
                            vec![packet.clone()],
                        ));
                        dispatch_to_binding(binding, pkt_unit);
                    }
                }
            }
        }

        Ok(())
    }
}

fn dispatch_to_binding(binding: &ReaderBinding, unit: Arc<Unit>) {
    let callback = binding.callback.clone();
    let job: DeliveryJob = Box::new(move || callback(unit));
    binding.queue.push(job);
}

fn estimate_unit_size(unit: &Unit) -> usize {
    unit.rtp_packets.iter().map(RtpPacket::size).sum()
}

pub(crate) fn is_keyframe_unit(unit: &Unit) -> bool {
    use crate::unit::Payload;
    match &unit.payload {
        Some(Payload::H264(nals)) => nals.iter().any(|n| !n.is_empty() && (n[0] & 0x1f) == 5),
        Some(Payload::H265(nals)) => nals
            .iter()
            .any(|n| !n.is_empty() && (16..=23).contains(&((n[0] >> 1) & 0x3f))),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::{Codec, Payload};
    use std::sync::atomic::AtomicUsize;
    use std::time::SystemTime;

    fn video_media() -> Arc<Media> {
        Arc::new(Media {
            kind: MediaKind::Video,
            formats: vec![Arc::new(Format::new(Codec::H264, 96, 90_000))],
        })
    }

    #[test]
    fn write_unit_dispatches_to_non_rtsp_reader() {
        let media = video_media();
        let format = media.formats[0].clone();
        let stream = Stream::new(vec![media.clone()], 0, false);

        let received = Arc::new(AtomicUsize::new(0));
        let received_clone = received.clone();
        let (tx, rx) = std::sync::mpsc::channel();
        stream.add_reader(&media, &format, ReaderKind::NonRtsp, move |_unit| {
            received_clone.fetch_add(1, Ordering::SeqCst);
            tx.send(()).unwrap();
            Ok(())
        });

        let unit = Unit::from_payload(0, SystemTime::now(), Payload::H264(vec![vec![5, 1]]));
        stream.write_unit(&media, &format, unit).unwrap();
        rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(received.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn gop_replay_cadence_uses_clock_ticks_and_anchors_to_live_pts() {
        let media = video_media();
        let format = media.formats[0].clone();
        let stream = Stream::new(vec![media.clone()], 0, true);

        for (pts, nal) in [(0, vec![7, 1]), (3000, vec![5, 1]), (6000, vec![1, 1])] {
            let unit = Unit::from_payload(pts, SystemTime::now(), Payload::H264(vec![nal]));
            stream.write_unit(&media, &format, unit).unwrap();
        }

        let received: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));
        let received_clone = received.clone();
        let (tx, rx) = std::sync::mpsc::channel();
        let reader = stream
            .add_reader(&media, &format, ReaderKind::NonRtsp, move |unit| {
                received_clone.lock().unwrap().push(unit.pts);
                tx.send(()).unwrap();
                Ok(())
            })
            .unwrap();
        stream.start_reader(&media, &format, reader);

        for _ in 0..2 {
            rx.recv_timeout(Duration::from_secs(1)).unwrap();
        }
        let pts_values = received.lock().unwrap().clone();
        // 90 kHz clock rate, 10 ms cadence: 900 ticks apart, ending on the
        // live PTS of the most recently cached (non-empty) unit.
        assert_eq!(pts_values, vec![6000 - 900, 6000]);
    }

    #[test]
    fn empty_unit_produces_no_delivery() {
        let media = video_media();
        let format = media.formats[0].clone();
        let stream = Stream::new(vec![media.clone()], 0, false);

        let (tx, rx) = std::sync::mpsc::channel::<()>();
        stream.add_reader(&media, &format, ReaderKind::NonRtsp, move |_unit| {
            tx.send(()).unwrap();
            Ok(())
        });

        // SPS-only access unit: filtered to empty, no output expected.
        let unit = Unit::from_payload(0, SystemTime::now(), Payload::H264(vec![vec![7, 1, 2]]));
        stream.write_unit(&media, &format, unit).unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }
}
