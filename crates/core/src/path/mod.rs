//! Per-path state machine.
//!
//! A [`Path`] is the single synchronization point for a named stream. It
//! runs a dedicated thread draining a command channel, so every state
//! mutation happens without a lock — one thread stays the sole owner of
//! the loop for as long as the path is alive.

pub mod command;
pub mod manager;

use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::config::PathConfig;
use crate::error::{CoreError, Result};
use crate::stream::{ReaderId, ReaderKind, Stream};
use crate::unit::{Media, MediaKind};

use command::RunningCommand;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathState {
    Idle,
    AwaitingDescription,
    Ready,
    Closing,
}

/// Outcome of a `describe` request.
pub enum DescribeResult {
    Stream(Arc<Stream>),
    Wait,
    Error(CoreError),
}

/// A publisher's declared media set, used for the incompatible-description
/// check on a second publish attempt.
pub struct PublisherDescription {
    pub medias: Vec<Arc<Media>>,
}

fn media_shape(medias: &[Arc<Media>]) -> Vec<MediaKind> {
    medias.iter().map(|m| m.kind).collect()
}

enum PathCommand {
    Describe {
        reply: Sender<DescribeResult>,
    },
    AddPublisher {
        desc: PublisherDescription,
        reply: Sender<Result<Arc<Stream>>>,
    },
    RemovePublisher,
    AddReader {
        media_index: usize,
        format_index: usize,
        kind: ReaderKind,
        callback: Box<dyn Fn(Arc<crate::unit::Unit>) -> std::result::Result<(), String> + Send + Sync>,
        reply: Sender<Option<(Arc<Stream>, ReaderId)>>,
    },
    RemoveReader {
        media_index: usize,
        format_index: usize,
        reader: ReaderId,
    },
    Snapshot {
        reply: Sender<Option<(Arc<Stream>, Vec<Arc<Media>>)>>,
    },
    Tick {
        reply: Sender<bool>,
    },
    Terminate,
}

/// Handle used by callers outside the path's own thread.
#[derive(Clone)]
pub struct PathHandle {
    sender: Sender<PathCommand>,
    pub name: String,
    pub is_dynamic: bool,
}

impl PathHandle {
    pub fn describe(&self) -> DescribeResult {
        let (reply, rx) = mpsc::channel();
        if self.sender.send(PathCommand::Describe { reply }).is_err() {
            return DescribeResult::Error(CoreError::PathNotFound(self.name.clone()));
        }
        rx.recv()
            .unwrap_or(DescribeResult::Error(CoreError::PathNotFound(self.name.clone())))
    }

    pub fn add_publisher(&self, desc: PublisherDescription) -> Result<Arc<Stream>> {
        let (reply, rx) = mpsc::channel();
        self.sender
            .send(PathCommand::AddPublisher { desc, reply })
            .map_err(|_| CoreError::PathNotFound(self.name.clone()))?;
        rx.recv().unwrap_or(Err(CoreError::PathNotFound(self.name.clone())))
    }

    pub fn remove_publisher(&self) {
        let _ = self.sender.send(PathCommand::RemovePublisher);
    }

    pub fn add_reader(
        &self,
        media_index: usize,
        format_index: usize,
        kind: ReaderKind,
        callback: impl Fn(Arc<crate::unit::Unit>) -> std::result::Result<(), String> + Send + Sync + 'static,
    ) -> Option<(Arc<Stream>, ReaderId)> {
        let (reply, rx) = mpsc::channel();
        self.sender
            .send(PathCommand::AddReader {
                media_index,
                format_index,
                kind,
                callback: Box::new(callback),
                reply,
            })
            .ok()?;
        rx.recv().ok().flatten()
    }

    pub fn remove_reader(&self, media_index: usize, format_index: usize, reader: ReaderId) {
        let _ = self.sender.send(PathCommand::RemoveReader {
            media_index,
            format_index,
            reader,
        });
    }

    /// The current stream plus its publisher-declared media list, used by
    /// the recording agent to enumerate (media, format) pairs to attach
    /// readers to. `None` while the path has no publisher.
    pub fn snapshot(&self) -> Option<(Arc<Stream>, Vec<Arc<Media>>)> {
        let (reply, rx) = mpsc::channel();
        self.sender.send(PathCommand::Snapshot { reply }).ok()?;
        rx.recv().ok().flatten()
    }

    /// Drives one tick of this path's state machine. Returns `true` when
    /// the path garbage-collected itself (an idle dynamic path with no
    /// publisher and no readers) and is now [`PathState::Closing`] — the
    /// caller (the manager) should drop it.
    pub fn tick(&self) -> bool {
        let (reply, rx) = mpsc::channel();
        if self.sender.send(PathCommand::Tick { reply }).is_err() {
            return false;
        }
        rx.recv().unwrap_or(false)
    }

    pub fn terminate(&self) {
        let _ = self.sender.send(PathCommand::Terminate);
    }
}

struct PathActor {
    name: String,
    config: PathConfig,
    is_dynamic: bool,
    state: PathState,
    stream: Option<Arc<Stream>>,
    medias: Vec<Arc<Media>>,
    publisher_shape: Option<Vec<MediaKind>>,
    wait_list: Vec<Sender<DescribeResult>>,
    last_describe_request: Option<Instant>,
    last_describe_activation: Option<Instant>,
    on_demand_command: Option<RunningCommand>,
    on_init_command: Option<RunningCommand>,
    random_start: u32,
}

impl PathActor {
    fn has_on_demand(&self) -> bool {
        self.config.on_demand.run_on_demand.is_some()
    }

    fn launch_on_demand(&mut self) {
        if self.on_demand_command.is_some() {
            return;
        }
        if let Some(cmd) = &self.config.on_demand.run_on_demand {
            match RunningCommand::spawn(cmd, "runOnDemand", &self.name, &[]) {
                Ok(running) => self.on_demand_command = Some(running),
                Err(err) => tracing::warn!(path = %self.name, error = %err, "failed to launch runOnDemand"),
            }
        }
    }

    fn stop_on_demand(&mut self) {
        if let Some(running) = self.on_demand_command.take() {
            running.stop();
        }
    }

    fn handle_describe(&mut self, reply: Sender<DescribeResult>) {
        self.last_describe_request = Some(Instant::now());
        match self.state {
            PathState::Ready => {
                let stream = self.stream.clone().expect("Ready implies a stream");
                let _ = reply.send(DescribeResult::Stream(stream));
            }
            PathState::Idle => {
                if self.has_on_demand() {
                    self.launch_on_demand();
                    self.last_describe_activation = Some(Instant::now());
                    self.state = PathState::AwaitingDescription;
                    self.wait_list.push(reply);
                } else {
                    let _ = reply.send(DescribeResult::Error(CoreError::NoPublisher(
                        self.name.clone(),
                    )));
                }
            }
            PathState::AwaitingDescription => {
                self.wait_list.push(reply);
            }
            PathState::Closing => {
                let _ = reply.send(DescribeResult::Error(CoreError::NoPublisher(
                    self.name.clone(),
                )));
            }
        }
    }

    fn compatible(&self, desc: &PublisherDescription) -> bool {
        match &self.publisher_shape {
            Some(shape) => *shape == media_shape(&desc.medias),
            None => true,
        }
    }

    fn handle_add_publisher(
        &mut self,
        desc: PublisherDescription,
        reply: Sender<Result<Arc<Stream>>>,
    ) {
        match self.state {
            PathState::Idle | PathState::AwaitingDescription => {
                if !self.compatible(&desc) {
                    let _ = reply.send(Err(CoreError::IncompatibleSessionDescription {
                        path: self.name.clone(),
                        reason: "publisher media shape does not match configuration".to_string(),
                    }));
                    return;
                }
                let shape = media_shape(&desc.medias);
                self.medias = desc.medias.clone();
                let stream = Arc::new(Stream::new(desc.medias, self.random_start, self.config.gop_cache));
                self.publisher_shape = Some(shape);
                self.stream = Some(stream.clone());
                self.state = PathState::Ready;
                for waiter in self.wait_list.drain(..) {
                    let _ = waiter.send(DescribeResult::Stream(stream.clone()));
                }
                let _ = reply.send(Ok(stream));
            }
            PathState::Ready => {
                let _ = reply.send(Err(CoreError::AlreadyPublishing(self.name.clone())));
            }
            PathState::Closing => {
                let _ = reply.send(Err(CoreError::PathNotFound(self.name.clone())));
            }
        }
    }

    fn handle_remove_publisher(&mut self) {
        if let Some(stream) = self.stream.take() {
            stream.remove_all_readers();
        }
        self.medias.clear();
        self.publisher_shape = None;
        self.state = PathState::Idle;
    }

    /// Returns `true` once this tick has garbage-collected the path: a
    /// dynamic (regex-matched) path sitting idle with no publisher and no
    /// readers is destroyed rather than left running forever under its
    /// resolved name.
    fn handle_tick(&mut self) -> bool {
        match self.state {
            PathState::AwaitingDescription => {
                let timed_out = self
                    .last_describe_activation
                    .is_some_and(|t| t.elapsed() >= self.config.describe_timeout);
                if timed_out {
                    for waiter in self.wait_list.drain(..) {
                        let _ = waiter.send(DescribeResult::Error(CoreError::PublisherTimeout(
                            self.name.clone(),
                        )));
                    }
                    self.state = PathState::Idle;
                    let idle_past_stop_after = self
                        .last_describe_request
                        .is_some_and(|t| t.elapsed() >= self.config.stop_after_describe);
                    if idle_past_stop_after {
                        self.stop_on_demand();
                    }
                }
            }
            _ => {}
        }

        let no_readers = self.stream.as_ref().map_or(true, |s| s.reader_count() == 0);
        if self.is_dynamic && self.state == PathState::Idle && no_readers {
            self.state = PathState::Closing;
            return true;
        }
        false
    }

    fn run(mut self, receiver: Receiver<PathCommand>) {
        if let Some(cmd) = &self.config.on_demand.run_on_init {
            match RunningCommand::spawn(cmd, "runOnInit", &self.name, &[]) {
                Ok(running) => self.on_init_command = Some(running),
                Err(err) => tracing::warn!(path = %self.name, error = %err, "failed to launch runOnInit"),
            }
        }

        while let Ok(cmd) = receiver.recv() {
            match cmd {
                PathCommand::Describe { reply } => self.handle_describe(reply),
                PathCommand::AddPublisher { desc, reply } => self.handle_add_publisher(desc, reply),
                PathCommand::RemovePublisher => self.handle_remove_publisher(),
                PathCommand::AddReader {
                    media_index,
                    format_index,
                    kind,
                    callback,
                    reply,
                } => {
                    let result = self.stream.as_ref().and_then(|stream| {
                        let media = self.medias.get(media_index)?;
                        let format = media.formats.get(format_index)?.clone();
                        let id = stream.add_reader(media, &format, kind, move |u| callback(u))?;
                        Some((stream.clone(), id))
                    });
                    let _ = reply.send(result);
                }
                PathCommand::RemoveReader {
                    media_index,
                    format_index,
                    reader,
                } => {
                    if let Some(stream) = &self.stream {
                        if let Some(media) = self.medias.get(media_index) {
                            if let Some(format) = media.formats.get(format_index) {
                                stream.remove_reader(media, format, reader);
                            }
                        }
                    }
                }
                PathCommand::Snapshot { reply } => {
                    let result = self
                        .stream
                        .as_ref()
                        .map(|stream| (stream.clone(), self.medias.clone()));
                    let _ = reply.send(result);
                }
                PathCommand::Tick { reply } => {
                    let should_remove = self.handle_tick();
                    let _ = reply.send(should_remove);
                }
                PathCommand::Terminate => break,
            }
        }

        self.stop_on_demand();
        if let Some(running) = self.on_init_command.take() {
            running.stop();
        }
    }
}

pub struct Path {
    pub handle: PathHandle,
    thread: Option<JoinHandle<()>>,
    recording: Option<crate::record::RecordingAgent>,
}

impl Path {
    pub fn spawn(name: String, config: PathConfig, is_dynamic: bool, random_start: u32) -> Self {
        Self::spawn_with_recording(name, config, is_dynamic, random_start, Duration::from_secs(2))
    }

    /// Spawns the path actor and, when the configuration names a `record`
    /// block, a companion [`crate::record::RecordingAgent`] attached to
    /// the same [`PathHandle`].
    pub fn spawn_with_recording(
        name: String,
        config: PathConfig,
        is_dynamic: bool,
        random_start: u32,
        recording_restart_pause: Duration,
    ) -> Self {
        let record_config = config.record.clone();
        let (sender, receiver) = mpsc::channel();
        let actor = PathActor {
            name: name.clone(),
            config,
            is_dynamic,
            state: PathState::Idle,
            stream: None,
            medias: Vec::new(),
            publisher_shape: None,
            wait_list: Vec::new(),
            last_describe_request: None,
            last_describe_activation: None,
            on_demand_command: None,
            on_init_command: None,
            random_start,
        };
        let thread = std::thread::spawn(move || actor.run(receiver));
        let handle = PathHandle {
            sender,
            name: name.clone(),
            is_dynamic,
        };
        let recording = record_config.map(|record_config| {
            crate::record::RecordingAgent::spawn(handle.clone(), name, record_config, recording_restart_pause)
        });
        Self {
            handle,
            thread: Some(thread),
            recording,
        }
    }

    pub fn describe_timeout_default() -> Duration {
        Duration::from_secs(10)
    }
}

impl Drop for Path {
    fn drop(&mut self) {
        self.recording.take();
        self.handle.terminate();
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PathConfig;
    use crate::unit::{Codec, Format};

    fn test_config(name: &str) -> PathConfig {
        PathConfig {
            name: name.to_string(),
            is_regex: false,
            on_demand: Default::default(),
            describe_timeout: Duration::from_millis(50),
            stop_after_describe: Duration::from_millis(50),
            record: None,
            gop_cache: false,
            reader_queue_depth: 512,
        }
    }

    fn video_media() -> Arc<Media> {
        Arc::new(Media {
            kind: MediaKind::Video,
            formats: vec![Arc::new(Format::new(Codec::H264, 96, 90_000))],
        })
    }

    #[test]
    fn idle_describe_without_on_demand_fails() {
        let path = Path::spawn("cam1".to_string(), test_config("cam1"), false, 0);
        match path.handle.describe() {
            DescribeResult::Error(CoreError::NoPublisher(name)) => assert_eq!(name, "cam1"),
            _ => panic!("expected NoPublisher"),
        }
    }

    #[test]
    fn publisher_then_describe_returns_stream() {
        let path = Path::spawn("cam1".to_string(), test_config("cam1"), false, 0);
        let stream = path
            .handle
            .add_publisher(PublisherDescription {
                medias: vec![video_media()],
            })
            .unwrap();
        let _ = stream;
        match path.handle.describe() {
            DescribeResult::Stream(_) => {}
            _ => panic!("expected Stream"),
        }
    }

    #[test]
    fn incompatible_second_publisher_is_rejected() {
        let path = Path::spawn("cam1".to_string(), test_config("cam1"), false, 0);
        path.handle
            .add_publisher(PublisherDescription {
                medias: vec![video_media()],
            })
            .unwrap();
        let result = path.handle.add_publisher(PublisherDescription {
            medias: vec![video_media()],
        });
        assert!(matches!(result, Err(CoreError::AlreadyPublishing(_))));
    }

    #[test]
    fn idle_dynamic_path_is_garbage_collected_on_tick() {
        let path = Path::spawn("cam-42".to_string(), test_config("cam-42"), true, 0);
        assert!(path.handle.tick());
    }

    #[test]
    fn idle_static_path_survives_tick() {
        let path = Path::spawn("cam1".to_string(), test_config("cam1"), false, 0);
        assert!(!path.handle.tick());
    }

    #[test]
    fn dynamic_path_with_active_publisher_survives_tick() {
        let path = Path::spawn("cam-42".to_string(), test_config("cam-42"), true, 0);
        path.handle
            .add_publisher(PublisherDescription {
                medias: vec![video_media()],
            })
            .unwrap();
        assert!(!path.handle.tick());
    }

    #[test]
    fn remove_publisher_delivers_terminal_error_to_non_rtsp_reader() {
        let path = Path::spawn("cam1".to_string(), test_config("cam1"), false, 0);
        let media = video_media();
        let stream = path
            .handle
            .add_publisher(PublisherDescription {
                medias: vec![media.clone()],
            })
            .unwrap();
        let format = media.formats[0].clone();
        let (tx, rx) = mpsc::channel();
        let attached = path
            .handle
            .add_reader(0, 0, ReaderKind::NonRtsp, move |_unit| {
                tx.send(()).unwrap();
                Ok(())
            })
            .unwrap();
        let _ = stream;
        let _ = format;
        let _ = attached;

        path.handle.remove_publisher();
        // `snapshot` round-trips through the actor's command queue, so by
        // the time it replies `RemovePublisher` has already been handled
        // and the reader's queue torn down.
        assert!(path.handle.snapshot().is_none());
        // The binding's worker received the terminating error job, not a
        // call to the reader's own callback, so the channel stays empty.
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    }

    #[test]
    fn describe_wait_times_out() {
        let path = Path::spawn(
            "cam1".to_string(),
            PathConfig {
                on_demand: crate::config::OnDemandConfig {
                    run_on_demand: Some("true".to_string()),
                    ..Default::default()
                },
                ..test_config("cam1")
            },
            false,
            0,
        );
        let (tx, rx) = mpsc::channel();
        let handle = path.handle.clone();
        std::thread::spawn(move || {
            tx.send(handle.describe()).unwrap();
        });
        std::thread::sleep(Duration::from_millis(20));
        path.handle.tick();
        std::thread::sleep(Duration::from_millis(100));
        path.handle.tick();
        match rx.recv_timeout(Duration::from_secs(1)).unwrap() {
            DescribeResult::Error(CoreError::PublisherTimeout(name)) => assert_eq!(name, "cam1"),
            _ => panic!("expected PublisherTimeout"),
        }
    }
}
