use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::channels::{load_playlist, ChannelSettings, PlaylistItem, StreamingConfig};
use crate::codec::{CodecEngine, EncoderParams, OpenOptions};
use crate::error::{PipelineError, SessionError};
use crate::metrics::CHANNEL_VIEWERS;
use crate::pacing::sleep_cancellable;
use crate::packet::MPEG_CLOCK;
use crate::pipeline::{PipelineConfig, PipelineState, TranscodePipeline};
use crate::rebase::{RebaseInput, RebaseState, Rebased, TimestampContinuityEngine};
use crate::ring::RingBuffer;
use crate::session::{Chunk, SessionConfig, StreamSession};

/// Wait before reloading an empty or unreadable playlist.
const EMPTY_PLAYLIST_BACKOFF: Duration = Duration::from_secs(5);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ChannelStatus {
    pub state: PipelineState,
    pub current_file: Option<String>,
    pub playlist_index: usize,
    pub playlist_len: usize,
}

#[derive(Default)]
struct Playlist {
    items: Vec<PlaylistItem>,
    index: usize,
}

/// One loop channel: its ring, its producer timeline and the counters the
/// producer and sessions share.
pub struct Channel {
    id: String,
    settings: ChannelSettings,
    ring: RingBuffer,
    generation: AtomicU64,
    viewers: Arc<AtomicUsize>,
    running: AtomicBool,
    cancel: CancellationToken,
    encoder_params: Mutex<Option<EncoderParams>>,
    status: Mutex<ChannelStatus>,
    playlist: Mutex<Playlist>,
    timeline: Mutex<RebaseState>,
}

impl Channel {
    pub fn new(settings: ChannelSettings, ring_capacity: usize, parent: &CancellationToken) -> Self {
        Self {
            id: settings.id(),
            settings,
            ring: RingBuffer::new(ring_capacity),
            generation: AtomicU64::new(0),
            viewers: Arc::new(AtomicUsize::new(0)),
            running: AtomicBool::new(false),
            cancel: parent.child_token(),
            encoder_params: Mutex::new(None),
            status: Mutex::new(ChannelStatus::default()),
            playlist: Mutex::new(Playlist::default()),
            timeline: Mutex::new(RebaseState::new(MPEG_CLOCK, MPEG_CLOCK)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    pub fn settings(&self) -> &ChannelSettings {
        &self.settings
    }

    pub fn ring(&self) -> &RingBuffer {
        &self.ring
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Opens a new generation for the next file and returns it.
    pub fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn viewers(&self) -> usize {
        self.viewers.load(Ordering::Acquire)
    }

    pub fn add_viewer(&self) -> ViewerGuard {
        let previous = self.viewers.fetch_add(1, Ordering::AcqRel);
        if previous == 0 {
            // Whatever the ring holds predates the idle stretch.
            self.ring.clear();
            debug!(channel = %self.id, "first viewer, cleared stale ring");
        }
        let count = previous.saturating_add(1);
        CHANNEL_VIEWERS.with_label_values(&[&self.id]).set(count as i64);
        info!("Viewer connected to {} (viewers={})", self.id, count);
        ViewerGuard {
            channel_id: self.id.clone(),
            viewers: self.viewers.clone(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }

    pub fn snapshot_encoder_params(&self) -> Option<EncoderParams> {
        *lock(&self.encoder_params)
    }

    pub fn publish_encoder_params(&self, params: EncoderParams) {
        let mut current = lock(&self.encoder_params);
        if current.as_ref() != Some(&params) {
            debug!(channel = %self.id, ?params, "encoder parameters changed");
        }
        *current = Some(params);
    }

    pub fn status(&self) -> ChannelStatus {
        lock(&self.status).clone()
    }

    pub fn set_state(&self, state: PipelineState) {
        lock(&self.status).state = state;
    }

    pub fn set_current_file(&self, name: Option<String>) {
        lock(&self.status).current_file = name;
    }

    /// Rebases an encoded packet onto the channel timeline. The timeline
    /// outlives individual pipeline runs.
    pub fn producer_rebase(&self, input: &RebaseInput) -> Rebased {
        TimestampContinuityEngine::rebase(&mut lock(&self.timeline), input)
    }

    /// Next playlist entry, reloading the playlist after its last entry.
    /// `Ok(None)` when the reloaded playlist is empty.
    fn next_item(&self) -> Result<Option<PlaylistItem>> {
        let mut playlist = lock(&self.playlist);
        if playlist.index >= playlist.items.len() {
            playlist.items = load_playlist(&self.settings)?;
            playlist.index = 0;
            info!(channel = %self.id, "loaded playlist with {} entries", playlist.items.len());
        }
        let Some(item) = playlist.items.get(playlist.index).cloned() else {
            return Ok(None);
        };
        playlist.index += 1;

        let mut status = lock(&self.status);
        status.playlist_index = playlist.index - 1;
        status.playlist_len = playlist.items.len();
        Ok(Some(item))
    }

    /// Puts the entry that was interrupted by a restart back at the head.
    fn requeue_current(&self) {
        let mut playlist = lock(&self.playlist);
        playlist.index = playlist.index.saturating_sub(1);
    }
}

pub struct ViewerGuard {
    channel_id: String,
    viewers: Arc<AtomicUsize>,
}

impl Drop for ViewerGuard {
    fn drop(&mut self) {
        // Saturating decrement; avoid underflow if Drop runs unexpectedly.
        let prev = match self
            .viewers
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1))
        {
            Ok(prev) => prev,
            Err(current) => current,
        };
        let new = prev.saturating_sub(1);
        CHANNEL_VIEWERS.with_label_values(&[&self.channel_id]).set(new as i64);
        info!("Viewer disconnected from {} (viewers={})", self.channel_id, new);
    }
}

struct Worker {
    handle: JoinHandle<()>,
    token: CancellationToken,
}

/// Runs a channel's playlist on a dedicated producer thread.
pub struct ChannelSupervisor {
    channel: Arc<Channel>,
    engine: Arc<dyn CodecEngine>,
    config: PipelineConfig,
    worker: Mutex<Option<Worker>>,
}

impl ChannelSupervisor {
    pub fn new(channel: Arc<Channel>, engine: Arc<dyn CodecEngine>, streaming: &StreamingConfig) -> Self {
        let config = PipelineConfig {
            probe_packet_limit: streaming.probe_packet_limit,
            pacing_ceiling: streaming.producer_pacing_ceiling(),
            options: OpenOptions {
                channel: channel.id().to_string(),
                video_codec: channel.settings().encode,
                language: streaming.language.clone(),
                audio_only: channel.settings().audio_only,
            },
        };
        Self {
            channel,
            engine,
            config,
            worker: Mutex::new(None),
        }
    }

    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    pub fn start(&self) -> Result<()> {
        let mut worker = lock(&self.worker);
        if worker.is_some() {
            return Ok(());
        }
        *worker = Some(self.spawn()?);
        Ok(())
    }

    fn spawn(&self) -> Result<Worker> {
        let token = self.channel.cancel.child_token();
        let channel = self.channel.clone();
        let engine = self.engine.clone();
        let config = self.config.clone();
        let run_token = token.clone();
        self.channel.set_running(true);
        let handle = std::thread::Builder::new()
            .name(format!("producer-{}", self.channel.id()))
            .spawn(move || run_playlist(&channel, engine.as_ref(), &config, &run_token))
            .inspect_err(|_| self.channel.set_running(false))
            .with_context(|| format!("spawning producer thread for {}", self.channel.id()))?;
        info!(channel = %self.channel.id(), engine = self.engine.name(), "producer started");
        Ok(Worker { handle, token })
    }

    /// Cancels the current pipeline run, waits for its thread and starts a
    /// new one on the same channel. Attached sessions keep reading the ring.
    pub fn restart_pipeline(&self) -> Result<()> {
        let mut worker = lock(&self.worker);
        if let Some(old) = worker.take() {
            old.token.cancel();
            if old.handle.join().is_err() {
                error!(channel = %self.channel.id(), "producer thread panicked");
            }
        }
        if self.channel.cancel.is_cancelled() {
            bail!("channel {} is shutting down", self.channel.id());
        }
        info!(channel = %self.channel.id(), "restarting pipeline");
        *worker = Some(self.spawn()?);
        Ok(())
    }

    /// Cancels the channel and waits up to `grace` for its producer thread.
    pub fn shutdown(&self, grace: Duration) {
        self.channel.cancel.cancel();
        let Some(worker) = lock(&self.worker).take() else {
            return;
        };
        if wait_finished(&worker.handle, grace) {
            if worker.handle.join().is_err() {
                error!(channel = %self.channel.id(), "producer thread panicked");
            }
        } else {
            warn!(channel = %self.channel.id(), "excessive wait for producer thread to finish");
        }
    }
}

fn wait_finished(handle: &JoinHandle<()>, grace: Duration) -> bool {
    let deadline = Instant::now() + grace;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    true
}

fn run_playlist(channel: &Channel, engine: &dyn CodecEngine, config: &PipelineConfig, cancel: &CancellationToken) {
    let mut failures = 0usize;
    while !cancel.is_cancelled() {
        let item = match channel.next_item() {
            Ok(Some(item)) => item,
            Ok(None) => {
                warn!(channel = %channel.id(), "playlist is empty, retrying in {:?}", EMPTY_PLAYLIST_BACKOFF);
                if !sleep_cancellable(EMPTY_PLAYLIST_BACKOFF, cancel) {
                    break;
                }
                continue;
            }
            Err(e) => {
                warn!(channel = %channel.id(), "failed to load playlist: {:#}", e);
                if !sleep_cancellable(EMPTY_PLAYLIST_BACKOFF, cancel) {
                    break;
                }
                continue;
            }
        };

        let pipeline = TranscodePipeline::new(channel, engine, config, cancel);
        match pipeline.play(&item) {
            Ok(report) => {
                failures = 0;
                debug!(channel = %channel.id(), ?report, "file done");
            }
            Err(PipelineError::Cancelled) => {
                if !channel.cancel.is_cancelled() {
                    channel.requeue_current();
                }
                break;
            }
            Err(e) => {
                warn!(channel = %channel.id(), "skipping {}: {}", item.display_name, e);
                failures += 1;
                // A whole lap failed; don't spin on a dead playlist.
                if failures >= channel.status().playlist_len.max(1) {
                    failures = 0;
                    if !sleep_cancellable(EMPTY_PLAYLIST_BACKOFF, cancel) {
                        break;
                    }
                }
            }
        }
    }
    channel.set_state(PipelineState::Closed);
    channel.set_running(false);
    info!(channel = %channel.id(), "producer stopped");
}

/// Every configured channel, and the attach/detach surface the HTTP layer
/// streams through.
pub struct ChannelRegistry {
    engine: Arc<dyn CodecEngine>,
    streaming: StreamingConfig,
    root: CancellationToken,
    supervisors: RwLock<Vec<Arc<ChannelSupervisor>>>,
}

impl ChannelRegistry {
    pub fn new(engine: Arc<dyn CodecEngine>, streaming: StreamingConfig) -> Self {
        Self {
            engine,
            streaming,
            root: CancellationToken::new(),
            supervisors: RwLock::new(Vec::new()),
        }
    }

    pub fn streaming(&self) -> &StreamingConfig {
        &self.streaming
    }

    pub fn is_shutting_down(&self) -> bool {
        self.root.is_cancelled()
    }

    /// Creates the channel and starts its producer.
    pub fn start(&self, settings: ChannelSettings) -> Result<Arc<Channel>> {
        let id = settings.id();
        if id.is_empty() {
            bail!("channel name '{}' yields an empty id", settings.name);
        }
        if self.supervisor(&id).is_some() {
            bail!("duplicate channel id '{}'", id);
        }
        let capacity = settings.ring_capacity(&self.streaming);
        if capacity == 0 {
            bail!("channel '{}' has a zero ring capacity", id);
        }
        let channel = Arc::new(Channel::new(settings, capacity, &self.root));
        let supervisor = Arc::new(ChannelSupervisor::new(channel.clone(), self.engine.clone(), &self.streaming));
        supervisor.start()?;
        info!("Channel {} ({}) started with ring capacity {}", channel.name(), id, capacity);
        self.supervisors
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(supervisor);
        Ok(channel)
    }

    fn supervisor(&self, id: &str) -> Option<Arc<ChannelSupervisor>> {
        self.supervisors
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .find(|s| s.channel().id() == id)
            .cloned()
    }

    pub fn channel(&self, id: &str) -> Option<Arc<Channel>> {
        self.supervisor(id).map(|s| s.channel().clone())
    }

    pub fn channels(&self) -> Vec<Arc<Channel>> {
        self.supervisors
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .map(|s| s.channel().clone())
            .collect()
    }

    pub fn attach(&self, id: &str) -> Result<StreamSession, SessionError> {
        if self.is_shutting_down() {
            return Err(SessionError::ShuttingDown);
        }
        let channel = self.channel(id).ok_or_else(|| SessionError::UnknownChannel(id.to_string()))?;
        let params = channel
            .snapshot_encoder_params()
            .ok_or_else(|| SessionError::NotReady(id.to_string()))?;
        Ok(StreamSession::new(channel, params, SessionConfig::from_streaming(&self.streaming)))
    }

    pub fn next_chunk(&self, session: &mut StreamSession, max_bytes: usize) -> Chunk {
        session.next_chunk(max_bytes)
    }

    pub fn detach(&self, session: StreamSession) {
        drop(session);
    }

    pub fn restart(&self, id: &str) -> Result<()> {
        let supervisor = self.supervisor(id).with_context(|| format!("unknown channel '{}'", id))?;
        supervisor.restart_pipeline()
    }

    /// Cancels every channel and session without waiting for them.
    pub fn begin_shutdown(&self) {
        if !self.root.is_cancelled() {
            info!("Shutting down {} channels", self.channels().len());
            self.root.cancel();
        }
    }

    /// Cancels everything, gives viewers `shutdown_grace` to drain, then
    /// waits the same bound for each producer thread. Blocking.
    pub fn shutdown(&self) {
        let grace = self.streaming.shutdown_grace();
        self.begin_shutdown();

        let deadline = Instant::now() + grace;
        while self.channels().iter().any(|c| c.viewers() > 0) {
            if Instant::now() >= deadline {
                warn!("excessive wait for viewers to disconnect");
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }

        let supervisors = self
            .supervisors
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        for supervisor in supervisors {
            supervisor.shutdown(grace);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::synthetic::{SyntheticEngine, SyntheticSource};

    fn fast_streaming() -> StreamingConfig {
        StreamingConfig {
            poll_interval_ms: 5,
            poll_ceiling: 20,
            shutdown_grace_secs: 2,
            ..StreamingConfig::default()
        }
    }

    #[test]
    fn viewer_guard_counts_and_never_underflows() {
        let root = CancellationToken::new();
        let channel = Channel::new(ChannelSettings::new("Guard Test"), 8, &root);
        let first = channel.add_viewer();
        let second = channel.add_viewer();
        assert_eq!(channel.viewers(), 2);
        drop(first);
        drop(second);
        assert_eq!(channel.viewers(), 0);

        let stray = ViewerGuard {
            channel_id: channel.id().to_string(),
            viewers: channel.viewers.clone(),
        };
        drop(stray);
        assert_eq!(channel.viewers(), 0);
    }

    #[test]
    fn generations_count_up_from_one() {
        let root = CancellationToken::new();
        let channel = Channel::new(ChannelSettings::new("gen"), 8, &root);
        assert_eq!(channel.generation(), 0);
        assert_eq!(channel.next_generation(), 1);
        assert_eq!(channel.next_generation(), 2);
        assert_eq!(channel.generation(), 2);
    }

    #[test]
    fn playlist_wraps_and_reports_position() {
        let root = CancellationToken::new();
        let settings = ChannelSettings::new("wrap").with_files(["/m/b.mkv", "/m/a.mkv"]);
        let channel = Channel::new(settings, 8, &root);

        let names: Vec<String> = (0..3)
            .map(|_| channel.next_item().unwrap().unwrap().file_name)
            .collect();
        assert_eq!(names, ["a.mkv", "b.mkv", "a.mkv"]);
        let status = channel.status();
        assert_eq!(status.playlist_index, 0);
        assert_eq!(status.playlist_len, 2);

        channel.requeue_current();
        assert_eq!(channel.next_item().unwrap().unwrap().file_name, "a.mkv");
    }

    #[test]
    fn attach_errors() {
        let engine = Arc::new(SyntheticEngine::new().with_default_source(SyntheticSource::broken()));
        let registry = ChannelRegistry::new(engine, fast_streaming());
        registry
            .start(ChannelSettings::new("Broken").with_files(["/none.mkv"]))
            .unwrap();

        assert_eq!(
            registry.attach("missing").err(),
            Some(SessionError::UnknownChannel("missing".into()))
        );
        assert_eq!(registry.attach("broken").err(), Some(SessionError::NotReady("broken".into())));

        registry.shutdown();
        assert_eq!(registry.attach("broken").err(), Some(SessionError::ShuttingDown));
        assert!(!registry.channel("broken").unwrap().is_running());
    }

    #[test]
    fn rejects_duplicate_channel_ids() {
        let registry = ChannelRegistry::new(Arc::new(SyntheticEngine::new()), fast_streaming());
        registry.start(ChannelSettings::new("News 24").with_files(["/a.mkv"])).unwrap();
        assert!(registry.start(ChannelSettings::new("news-24").with_files(["/b.mkv"])).is_err());
        assert_eq!(registry.channels().len(), 1);
        registry.shutdown();
    }
}
