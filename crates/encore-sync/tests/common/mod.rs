#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use encore_proto::config::SyncConfig;
use encore_proto::snapshot::{PlaybackSnapshot, RepeatMode};
use encore_proto::song::{PlaybackPointer, SavedQueue, SavedQueueWithSongs, SongId, SongRef};
use encore_sync::collaborators::{
    CommandBridge, ListeningStats, PreferenceStore, QueueRepository, SessionController,
    SongRepository,
};
use encore_sync::engine::{
    EngineConnector, EngineEvent, EngineItem, EngineListener, EngineStatus, ListenerId,
    MediaEngine,
};
use encore_sync::error::{EngineError, EngineResult};
use encore_sync::{Collaborators, PlaybackService};
use serde_json::Value;

pub const DEFAULT_DURATION_MS: i64 = 180_000;

pub fn song(id: SongId) -> SongRef {
    SongRef {
        id,
        title: format!("Song {id}"),
        artist: format!("Artist {}", id % 3),
        album: Some("Album".to_string()),
        artwork: None,
        uri: format!("/music/{id}.flac"),
        liked: false,
    }
}

pub fn item(id: SongId) -> EngineItem {
    EngineItem::from_song(&song(id), None).unwrap()
}

pub fn test_config() -> SyncConfig {
    SyncConfig {
        debounce_ms: 200,
        heartbeat_secs: 0,
        ..Default::default()
    }
}

// ── fake media engine ───────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct EngineState {
    pub items: Vec<EngineItem>,
    pub current: Option<usize>,
    pub playing: bool,
    pub buffering: bool,
    pub position_ms: i64,
    pub duration_ms: i64,
    pub repeat_mode: RepeatMode,
    pub shuffle: bool,
    pub speed: f32,
    pub pitch: f32,
    pub error: Option<String>,
}

impl Default for EngineState {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            current: None,
            playing: false,
            buffering: false,
            position_ms: 0,
            duration_ms: DEFAULT_DURATION_MS,
            repeat_mode: RepeatMode::Off,
            shuffle: false,
            speed: 1.0,
            pitch: 1.0,
            error: None,
        }
    }
}

#[derive(Default)]
pub struct FakeEngine {
    state: Mutex<EngineState>,
    listeners: Mutex<Vec<(ListenerId, Arc<dyn EngineListener>)>>,
    next_listener: AtomicU64,
    dead: AtomicBool,
    fail_next: Mutex<Option<EngineError>>,
    /// (start_index, start_position_ms) of every replace_items call.
    pub replaced: Mutex<Vec<(usize, Option<i64>)>>,
    pub commands: Mutex<Vec<(String, Value)>>,
}

impl FakeEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Engine that already has `ids` loaded, current at `current`.
    pub fn loaded(ids: &[SongId], current: usize) -> Arc<Self> {
        let engine = Self::new();
        {
            let mut state = engine.state.lock().unwrap();
            state.items = ids.iter().map(|&id| item(id)).collect();
            state.current = Some(current);
        }
        engine
    }

    pub fn state(&self) -> EngineState {
        self.state.lock().unwrap().clone()
    }

    pub fn with_state(&self, f: impl FnOnce(&mut EngineState)) {
        f(&mut self.state.lock().unwrap());
    }

    pub fn kill(&self) {
        self.dead.store(true, Ordering::SeqCst);
    }

    pub fn fail_next(&self, error: EngineError) {
        *self.fail_next.lock().unwrap() = Some(error);
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().unwrap().len()
    }

    pub fn replaced(&self) -> Vec<(usize, Option<i64>)> {
        self.replaced.lock().unwrap().clone()
    }

    pub fn commands(&self) -> Vec<(String, Value)> {
        self.commands.lock().unwrap().clone()
    }

    /// Deliver an event to every registered listener, as the engine thread would.
    pub fn emit(&self, event: EngineEvent) {
        let listeners: Vec<_> = self
            .listeners
            .lock()
            .unwrap()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            listener.on_event(event.clone());
        }
    }

    fn check(&self) -> EngineResult<()> {
        if self.dead.load(Ordering::SeqCst) {
            return Err(EngineError::Disconnected);
        }
        match self.fail_next.lock().unwrap().take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn mutate(&self, f: impl FnOnce(&mut EngineState) -> Vec<EngineEvent>) -> EngineResult<()> {
        self.check()?;
        let events = f(&mut self.state.lock().unwrap());
        for event in events {
            self.emit(event);
        }
        Ok(())
    }
}

fn start_of(item: Option<&EngineItem>) -> i64 {
    item.and_then(|i| i.clip).map_or(0, |c| c.start_ms)
}

#[async_trait]
impl MediaEngine for FakeEngine {
    fn is_alive(&self) -> bool {
        !self.dead.load(Ordering::SeqCst)
    }

    async fn status(&self) -> EngineResult<EngineStatus> {
        self.check()?;
        let s = self.state.lock().unwrap();
        Ok(EngineStatus {
            is_playing: s.playing,
            is_buffering: s.buffering,
            position_ms: s.position_ms,
            duration_ms: if s.current.is_some() { s.duration_ms } else { 0 },
            current_index: s.current,
            repeat_mode: s.repeat_mode,
            shuffle_enabled: s.shuffle,
            speed: s.speed,
            pitch: s.pitch,
            error: s.error.clone(),
        })
    }

    async fn items(&self) -> EngineResult<Vec<EngineItem>> {
        self.check()?;
        Ok(self.state.lock().unwrap().items.clone())
    }

    async fn play(&self) -> EngineResult<()> {
        self.mutate(|s| {
            if s.playing || s.current.is_none() {
                return vec![];
            }
            s.playing = true;
            vec![EngineEvent::IsPlayingChanged(true)]
        })
    }

    async fn pause(&self) -> EngineResult<()> {
        self.mutate(|s| {
            if !s.playing {
                return vec![];
            }
            s.playing = false;
            vec![EngineEvent::IsPlayingChanged(false)]
        })
    }

    async fn seek_to(&self, position_ms: i64) -> EngineResult<()> {
        self.mutate(|s| {
            s.position_ms = position_ms;
            vec![EngineEvent::PositionDiscontinuity]
        })
    }

    async fn seek_to_item(&self, index: usize, position_ms: Option<i64>) -> EngineResult<()> {
        self.mutate(|s| {
            if index >= s.items.len() {
                return vec![];
            }
            s.current = Some(index);
            s.position_ms = position_ms.unwrap_or_else(|| start_of(s.items.get(index)));
            vec![EngineEvent::ItemTransition { index: Some(index) }]
        })
    }

    async fn next(&self) -> EngineResult<()> {
        self.mutate(|s| match s.current {
            Some(i) if i + 1 < s.items.len() => {
                s.current = Some(i + 1);
                s.position_ms = start_of(s.items.get(i + 1));
                vec![EngineEvent::ItemTransition { index: s.current }]
            }
            _ => vec![],
        })
    }

    async fn previous(&self) -> EngineResult<()> {
        self.mutate(|s| match s.current {
            Some(i) if i > 0 => {
                s.current = Some(i - 1);
                s.position_ms = start_of(s.items.get(i - 1));
                vec![EngineEvent::ItemTransition { index: s.current }]
            }
            _ => vec![],
        })
    }

    async fn replace_items(
        &self,
        items: Vec<EngineItem>,
        start_index: usize,
        start_position_ms: Option<i64>,
    ) -> EngineResult<()> {
        self.check()?;
        self.replaced
            .lock()
            .unwrap()
            .push((start_index, start_position_ms));
        self.mutate(|s| {
            s.items = items;
            if s.items.is_empty() {
                s.current = None;
                s.position_ms = 0;
            } else {
                let index = start_index.min(s.items.len() - 1);
                s.current = Some(index);
                s.position_ms =
                    start_position_ms.unwrap_or_else(|| start_of(s.items.get(index)));
            }
            vec![
                EngineEvent::TimelineChanged,
                EngineEvent::ItemTransition { index: s.current },
            ]
        })
    }

    async fn insert_items(&self, index: usize, items: Vec<EngineItem>) -> EngineResult<()> {
        self.mutate(|s| {
            let at = index.min(s.items.len());
            let count = items.len();
            for (offset, item) in items.into_iter().enumerate() {
                s.items.insert(at + offset, item);
            }
            s.current = match s.current {
                Some(c) if at <= c => Some(c + count),
                Some(c) => Some(c),
                None if !s.items.is_empty() => Some(0),
                None => None,
            };
            vec![EngineEvent::TimelineChanged]
        })
    }

    async fn remove_item(&self, index: usize) -> EngineResult<()> {
        self.mutate(|s| {
            if index >= s.items.len() {
                return vec![];
            }
            s.items.remove(index);
            s.current = match s.current {
                _ if s.items.is_empty() => None,
                Some(c) if index < c => Some(c - 1),
                Some(c) => Some(c.min(s.items.len() - 1)),
                None => None,
            };
            vec![EngineEvent::TimelineChanged]
        })
    }

    async fn set_repeat_mode(&self, mode: RepeatMode) -> EngineResult<()> {
        self.mutate(|s| {
            s.repeat_mode = mode;
            vec![EngineEvent::RepeatModeChanged(mode)]
        })
    }

    async fn set_shuffle_enabled(&self, enabled: bool) -> EngineResult<()> {
        self.mutate(|s| {
            s.shuffle = enabled;
            vec![EngineEvent::ShuffleChanged(enabled)]
        })
    }

    async fn set_playback_parameters(&self, speed: f32, pitch: f32) -> EngineResult<()> {
        self.mutate(|s| {
            s.speed = speed;
            s.pitch = pitch;
            vec![EngineEvent::PlaybackParametersChanged { speed, pitch }]
        })
    }

    fn add_listener(&self, listener: Arc<dyn EngineListener>) -> ListenerId {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::SeqCst));
        self.listeners.lock().unwrap().push((id, listener));
        id
    }

    fn remove_listener(&self, id: ListenerId) {
        self.listeners.lock().unwrap().retain(|(l, _)| *l != id);
    }

    async fn send_command(&self, action: &str, payload: Value) -> EngineResult<()> {
        self.check()?;
        self.commands
            .lock()
            .unwrap()
            .push((action.to_string(), payload));
        Ok(())
    }
}

pub struct FakeConnector {
    engine: Mutex<Arc<FakeEngine>>,
    pub calls: AtomicUsize,
    pub fail: AtomicBool,
    pub delay: Mutex<Duration>,
}

impl FakeConnector {
    pub fn new(engine: Arc<FakeEngine>) -> Arc<Self> {
        Arc::new(Self {
            engine: Mutex::new(engine),
            calls: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
            delay: Mutex::new(Duration::ZERO),
        })
    }

    pub fn set_engine(&self, engine: Arc<FakeEngine>) {
        *self.engine.lock().unwrap() = engine;
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EngineConnector for FakeConnector {
    async fn connect(&self) -> Result<Arc<dyn MediaEngine>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            bail!("no media session available");
        }
        let engine: Arc<dyn MediaEngine> = self.engine.lock().unwrap().clone();
        Ok(engine)
    }
}

// ── in-memory collaborators ─────────────────────────────────────────────────

#[derive(Default)]
pub struct MemorySongs {
    pub songs: Mutex<HashMap<SongId, SongRef>>,
    pub plays: Mutex<Vec<SongId>>,
}

impl MemorySongs {
    pub fn with_library(ids: impl IntoIterator<Item = SongId>) -> Arc<Self> {
        let songs = ids.into_iter().map(|id| (id, song(id))).collect();
        Arc::new(Self {
            songs: Mutex::new(songs),
            plays: Mutex::new(Vec::new()),
        })
    }

    pub fn set_liked(&self, id: SongId, liked: bool) {
        if let Some(song) = self.songs.lock().unwrap().get_mut(&id) {
            song.liked = liked;
        }
    }

    pub fn plays(&self) -> Vec<SongId> {
        self.plays.lock().unwrap().clone()
    }
}

#[async_trait]
impl SongRepository for MemorySongs {
    async fn get_by_id(&self, id: SongId) -> Result<Option<SongRef>> {
        Ok(self.songs.lock().unwrap().get(&id).cloned())
    }

    async fn log_play(&self, id: SongId) -> Result<()> {
        self.plays.lock().unwrap().push(id);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryQueues {
    pub current: Mutex<Option<SavedQueueWithSongs>>,
    pub saves: Mutex<Vec<Vec<SongId>>>,
    load_delay: Mutex<Duration>,
}

impl MemoryQueues {
    pub fn with_saved(songs: Vec<SongRef>) -> Arc<Self> {
        let queue = SavedQueue {
            queue_id: 1,
            song_ids: songs.iter().map(|s| s.id).collect(),
            name: "Now Playing".to_string(),
            is_current: true,
            saved_at: Utc::now(),
        };
        Arc::new(Self {
            current: Mutex::new(Some(SavedQueueWithSongs { queue, songs })),
            saves: Mutex::new(Vec::new()),
            load_delay: Mutex::new(Duration::ZERO),
        })
    }

    pub fn set_load_delay(&self, delay: Duration) {
        *self.load_delay.lock().unwrap() = delay;
    }

    pub fn saves(&self) -> Vec<Vec<SongId>> {
        self.saves.lock().unwrap().clone()
    }
}

#[async_trait]
impl QueueRepository for MemoryQueues {
    async fn get_current_queue_with_songs(&self) -> Result<Option<SavedQueueWithSongs>> {
        let delay = *self.load_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(self.current.lock().unwrap().clone())
    }

    async fn save_or_update_current_queue(&self, name: &str, songs: &[SongRef]) -> Result<i64> {
        let ids: Vec<SongId> = songs.iter().map(|s| s.id).collect();
        self.saves.lock().unwrap().push(ids.clone());
        let queue = SavedQueue {
            queue_id: 1,
            song_ids: ids,
            name: name.to_string(),
            is_current: true,
            saved_at: Utc::now(),
        };
        *self.current.lock().unwrap() = Some(SavedQueueWithSongs {
            queue,
            songs: songs.to_vec(),
        });
        Ok(1)
    }
}

#[derive(Default)]
pub struct MemoryPrefs {
    pub pointer: Mutex<Option<PlaybackPointer>>,
    pub cleared: AtomicUsize,
}

impl MemoryPrefs {
    pub fn with_pointer(song_id: SongId, queue_index: i64, position_ms: i64) -> Arc<Self> {
        let prefs = Self::default();
        *prefs.pointer.lock().unwrap() = Some(PlaybackPointer {
            song_id,
            queue_index,
            position_ms,
            queue_name: "Now Playing".to_string(),
        });
        Arc::new(prefs)
    }

    pub fn pointer(&self) -> Option<PlaybackPointer> {
        self.pointer.lock().unwrap().clone()
    }
}

#[async_trait]
impl PreferenceStore for MemoryPrefs {
    async fn get_playback_pointer(&self) -> Result<Option<PlaybackPointer>> {
        Ok(self.pointer.lock().unwrap().clone())
    }

    async fn save_playback_pointer(&self, pointer: &PlaybackPointer) -> Result<()> {
        *self.pointer.lock().unwrap() = Some(pointer.clone());
        Ok(())
    }

    async fn clear_playback_pointer(&self) -> Result<()> {
        self.cleared.fetch_add(1, Ordering::SeqCst);
        *self.pointer.lock().unwrap() = None;
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeSession {
    pub private: AtomicBool,
    pub refreshes: AtomicUsize,
}

impl FakeSession {
    pub fn refreshes(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionController for FakeSession {
    async fn is_session_private(&self) -> bool {
        self.private.load(Ordering::SeqCst)
    }

    async fn refresh_inactivity_timer(&self) {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct RecordingStats {
    pub events: Mutex<Vec<(String, i64)>>,
}

impl RecordingStats {
    pub fn events(&self) -> Vec<(String, i64)> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl ListeningStats for RecordingStats {
    async fn record_play_event(&self, artist: &str, duration_ms: i64) -> Result<()> {
        self.events
            .lock()
            .unwrap()
            .push((artist.to_string(), duration_ms));
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingCommands {
    pub handles: AtomicBool,
    pub dispatched: Mutex<Vec<(String, Value)>>,
}

impl RecordingCommands {
    pub fn dispatched(&self) -> Vec<(String, Value)> {
        self.dispatched.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandBridge for RecordingCommands {
    async fn dispatch(&self, action: &str, payload: Value) -> bool {
        self.dispatched
            .lock()
            .unwrap()
            .push((action.to_string(), payload));
        self.handles.load(Ordering::SeqCst)
    }
}

// ── harness ─────────────────────────────────────────────────────────────────

pub struct Harness {
    pub service: Arc<PlaybackService>,
    pub engine: Arc<FakeEngine>,
    pub connector: Arc<FakeConnector>,
    pub songs: Arc<MemorySongs>,
    pub queues: Arc<MemoryQueues>,
    pub prefs: Arc<MemoryPrefs>,
    pub session: Arc<FakeSession>,
    pub stats: Arc<RecordingStats>,
    pub commands: Arc<RecordingCommands>,
}

pub struct HarnessBuilder {
    engine: Arc<FakeEngine>,
    queues: Arc<MemoryQueues>,
    prefs: Arc<MemoryPrefs>,
    songs: Arc<MemorySongs>,
    config: SyncConfig,
}

impl HarnessBuilder {
    pub fn new() -> Self {
        Self {
            engine: FakeEngine::new(),
            queues: Arc::new(MemoryQueues::default()),
            prefs: Arc::new(MemoryPrefs::default()),
            songs: MemorySongs::with_library(1..=20),
            config: test_config(),
        }
    }

    pub fn engine(mut self, engine: Arc<FakeEngine>) -> Self {
        self.engine = engine;
        self
    }

    pub fn queues(mut self, queues: Arc<MemoryQueues>) -> Self {
        self.queues = queues;
        self
    }

    pub fn prefs(mut self, prefs: Arc<MemoryPrefs>) -> Self {
        self.prefs = prefs;
        self
    }

    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Harness {
        let connector = FakeConnector::new(Arc::clone(&self.engine));
        let session = Arc::new(FakeSession::default());
        let stats = Arc::new(RecordingStats::default());
        let commands = Arc::new(RecordingCommands::default());

        let service = PlaybackService::new(
            Collaborators {
                connector: connector.clone(),
                songs: self.songs.clone(),
                queues: self.queues.clone(),
                prefs: self.prefs.clone(),
                session: session.clone(),
                stats: stats.clone(),
                commands: commands.clone(),
            },
            self.config,
        );

        Harness {
            service,
            engine: self.engine,
            connector,
            songs: self.songs,
            queues: self.queues,
            prefs: self.prefs,
            session,
            stats,
            commands,
        }
    }
}

pub fn harness() -> Harness {
    HarnessBuilder::new().build()
}

/// Wait until a published snapshot satisfies `pred`.
pub async fn wait_for(
    service: &PlaybackService,
    pred: impl Fn(&PlaybackSnapshot) -> bool,
) -> PlaybackSnapshot {
    let mut rx = service.subscribe();
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            {
                let snapshot = rx.borrow_and_update();
                if pred(&snapshot) {
                    return snapshot.clone();
                }
            }
            if rx.changed().await.is_err() {
                panic!("snapshot channel closed");
            }
        }
    })
    .await;
    match waited {
        Ok(snapshot) => snapshot,
        Err(_) => panic!("condition not reached; last snapshot: {:?}", service.snapshot()),
    }
}

/// Poll `check` until it holds.
pub async fn eventually<F, Fut>(check: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never held");
}

/// Let queued refresh requests drain.
pub async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

/// Route engine logs to the test output.  `RUST_LOG=encore_sync=debug` to see them.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
