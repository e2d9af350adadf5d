//! `PlaybackService`: the public face of the synchronization engine.
//!
//! ```text
//!  client ─► PlaybackService ─► supervisor.current() ─► MediaEngine
//!                 ▲                                          │
//!                 │ watch<PlaybackSnapshot>                  │ EngineEvent
//!                 │                                          ▼
//!             SyncCore ◄── refresh loop ◄── mpsc ◄──── EventBridge
//! ```
//!
//! No method here returns an error.  Failures end up in `snapshot().error`;
//! operations that cannot apply (nothing loaded, song not current) are no-ops.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use encore_proto::config::SyncConfig;
use encore_proto::snapshot::{ConnectionState, PlaybackSnapshot, RepeatMode, UpdateSource};
use encore_proto::song::{SongId, SongSettings};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::bridge::{EventBridge, RefreshRequest};
use crate::collaborators::{
    CommandBridge, ListeningStats, PreferenceStore, QueueRepository, SessionController,
    SnapshotObserver, SongRepository,
};
use crate::engine::{EngineConnector, EngineItem, MediaEngine};
use crate::error::EngineResult;
use crate::history::HistoryDispatcher;
use crate::persistence::QueuePersistence;
use crate::settings::{ApplyMode, ApplyOutcome, CommittedSettings, SettingsApplicator};
use crate::supervisor::{ConnectionSupervisor, EngineSlot};
use crate::sync::SyncCore;

pub const MIN_PLAYBACK_SPEED: f32 = 0.25;
pub const MAX_PLAYBACK_SPEED: f32 = 4.0;

/// Everything the host provides.
pub struct Collaborators {
    pub connector: Arc<dyn EngineConnector>,
    pub songs: Arc<dyn SongRepository>,
    pub queues: Arc<dyn QueueRepository>,
    pub prefs: Arc<dyn PreferenceStore>,
    pub session: Arc<dyn SessionController>,
    pub stats: Arc<dyn ListeningStats>,
    pub commands: Arc<dyn CommandBridge>,
}

pub struct PlaybackService {
    config: SyncConfig,
    supervisor: Arc<ConnectionSupervisor>,
    core: Arc<SyncCore>,
    bridge: Arc<EventBridge>,
    persistence: Arc<QueuePersistence>,
    settings: SettingsApplicator,
    committed: CommittedSettings,
    songs: Arc<dyn SongRepository>,
    shutdown: CancellationToken,
}

impl PlaybackService {
    /// Wire all components and start the background loops.
    ///
    /// Must be called from inside a tokio runtime.  Does not connect.
    pub fn new(collaborators: Collaborators, config: SyncConfig) -> Arc<Self> {
        let Collaborators {
            connector,
            songs,
            queues,
            prefs,
            session,
            stats,
            commands,
        } = collaborators;

        let (refresh_tx, refresh_rx) = mpsc::unbounded_channel();
        let bridge = Arc::new(EventBridge::new(refresh_tx));
        let slot = Arc::new(EngineSlot::default());
        let committed = CommittedSettings::default();

        let persistence = Arc::new(QueuePersistence::new(
            queues,
            prefs,
            committed.clone(),
            &config,
        ));
        let history = Arc::new(HistoryDispatcher::new(
            Arc::clone(&songs),
            session,
            stats,
            Duration::from_millis(config.min_listen_ms),
        ));
        let observers: Vec<Arc<dyn SnapshotObserver>> = vec![persistence.clone(), history];

        let core = Arc::new(SyncCore::new(
            Arc::clone(&slot),
            Arc::clone(&bridge),
            Arc::clone(&songs),
            observers,
        ));
        let supervisor = Arc::new(ConnectionSupervisor::new(
            connector,
            slot,
            Arc::clone(&bridge),
            Arc::clone(&core),
            Arc::clone(&persistence),
        ));

        let service = Arc::new(Self {
            config,
            supervisor,
            core,
            bridge,
            persistence,
            settings: SettingsApplicator::new(commands, committed.clone()),
            committed,
            songs,
            shutdown: CancellationToken::new(),
        });
        service.spawn_refresh_loop(refresh_rx);
        service.spawn_heartbeat();
        service
    }

    // ── background loops ─────────────────────────────────────────────────────

    fn spawn_refresh_loop(&self, mut refresh_rx: mpsc::UnboundedReceiver<RefreshRequest>) {
        let core = Arc::clone(&self.core);
        let persistence = Arc::clone(&self.persistence);
        let save_on_pause = self.config.save_pointer_on_pause;
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            loop {
                let request = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    request = refresh_rx.recv() => match request {
                        Some(request) => request,
                        None => break,
                    },
                };

                // One refresh reads live state, so a burst collapses into it.
                let mut source = request.source;
                let mut play_state_changed = source == UpdateSource::IsPlayingChanged;
                let mut coalesced = 0usize;
                while let Ok(next) = refresh_rx.try_recv() {
                    play_state_changed |= next.source == UpdateSource::IsPlayingChanged;
                    source = next.source;
                    coalesced += 1;
                }
                if coalesced > 0 {
                    trace!("service: coalesced {} refresh requests", coalesced);
                }

                let Some(refreshed) = core.refresh(source).await else {
                    continue;
                };
                let paused =
                    !refreshed.current.is_playing && refreshed.current.current_song.is_some();
                if save_on_pause && play_state_changed && paused {
                    persistence.save_pointer(&core).await;
                }
            }
            debug!("service: refresh loop stopped");
        });
    }

    fn spawn_heartbeat(&self) {
        if self.config.heartbeat_secs == 0 {
            return;
        }
        let supervisor = Arc::clone(&self.supervisor);
        let shutdown = self.shutdown.clone();
        let period = Duration::from_secs(self.config.heartbeat_secs);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // First tick fires immediately.
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        if supervisor.check_liveness().await {
                            info!("service: heartbeat found the media engine gone");
                        }
                    }
                }
            }
        });
    }

    // ── connection ──────────────────────────────────────────────────────────

    pub async fn connect(&self) {
        self.supervisor.connect().await;
    }

    pub async fn disconnect(&self) {
        self.supervisor.disconnect().await;
    }

    pub fn subscribe(&self) -> watch::Receiver<PlaybackSnapshot> {
        self.core.subscribe()
    }

    pub fn snapshot(&self) -> PlaybackSnapshot {
        self.core.snapshot()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.supervisor.state()
    }

    pub fn subscribe_connection(&self) -> watch::Receiver<ConnectionState> {
        self.supervisor.subscribe()
    }

    /// Engine items dropped from snapshots because they named no song.
    pub fn conversion_mismatches(&self) -> u64 {
        self.core.conversion_mismatches()
    }

    async fn engine(&self) -> Option<Arc<dyn MediaEngine>> {
        match self.supervisor.current() {
            Some(engine) => Some(engine),
            None => self.supervisor.connect().await,
        }
    }

    /// Run one engine operation, then refresh.  Failure goes to the snapshot.
    async fn run<F, Fut>(&self, op: &str, f: F) -> bool
    where
        F: FnOnce(Arc<dyn MediaEngine>) -> Fut,
        Fut: Future<Output = EngineResult<()>>,
    {
        let Some(engine) = self.engine().await else {
            debug!("service: {} skipped, no media engine", op);
            return false;
        };
        match f(engine).await {
            Ok(()) => {
                self.core.refresh(UpdateSource::Manual).await;
                true
            }
            Err(e) => {
                warn!("service: {} failed: {}", op, e);
                self.core.record_error(format!("{op} failed: {e}")).await;
                false
            }
        }
    }

    // ── transport ───────────────────────────────────────────────────────────

    pub async fn play(&self) {
        self.bridge.clear_pause_flags();
        self.run("play", |engine| async move { engine.play().await })
            .await;
    }

    pub async fn pause(&self) {
        self.bridge.clear_pause_flags();
        self.run("pause", |engine| async move { engine.pause().await })
            .await;
    }

    pub async fn play_pause(&self) {
        self.bridge.clear_pause_flags();
        self.run("play/pause", |engine| async move {
            if engine.status().await?.is_playing {
                engine.pause().await
            } else {
                engine.play().await
            }
        })
        .await;
    }

    pub async fn seek_to(&self, position_ms: i64) {
        let position_ms = position_ms.max(0);
        self.run("seek", |engine| async move { engine.seek_to(position_ms).await })
            .await;
    }

    pub async fn seek_to_next(&self) {
        self.run("next", |engine| async move { engine.next().await })
            .await;
    }

    pub async fn seek_to_previous(&self) {
        self.run("previous", |engine| async move { engine.previous().await })
            .await;
    }

    // ── queue ───────────────────────────────────────────────────────────────

    /// Resolve songs to engine items, skipping anything unknown or unplayable.
    ///
    /// Returns the items and, for each input position, the index of the
    /// first kept item at or after it.
    async fn resolve_items(&self, song_ids: &[SongId]) -> (Vec<EngineItem>, Vec<usize>) {
        let mut items = Vec::with_capacity(song_ids.len());
        let mut kept_before = Vec::with_capacity(song_ids.len());
        for &id in song_ids {
            kept_before.push(items.len());
            match self.songs.get_by_id(id).await {
                Ok(Some(song)) => match self.committed.item_for(&song) {
                    Ok(item) => items.push(item),
                    Err(e) => warn!("service: {}", e),
                },
                Ok(None) => warn!("service: song {} is not in the library", id),
                Err(e) => warn!("service: lookup of song {} failed: {:#}", id, e),
            }
        }
        (items, kept_before)
    }

    pub async fn play_song(&self, song_id: SongId) {
        self.play_queue(vec![song_id], 0).await;
    }

    pub async fn play_queue(&self, song_ids: Vec<SongId>, start_index: usize) {
        let (items, kept_before) = self.resolve_items(&song_ids).await;
        if items.is_empty() {
            self.core.record_error("Nothing playable in the selection").await;
            return;
        }
        let start = kept_before
            .get(start_index)
            .copied()
            .unwrap_or(0)
            .min(items.len() - 1);

        self.bridge.clear_pause_flags();
        self.run("play queue", |engine| async move {
            engine.replace_items(items, start, None).await?;
            engine.play().await
        })
        .await;
    }

    pub async fn add_to_queue(&self, song_ids: Vec<SongId>) {
        let (items, _) = self.resolve_items(&song_ids).await;
        if items.is_empty() {
            return;
        }
        self.run("add to queue", |engine| async move {
            let len = engine.items().await?.len();
            engine.insert_items(len, items).await
        })
        .await;
    }

    pub async fn play_next(&self, song_ids: Vec<SongId>) {
        let (items, _) = self.resolve_items(&song_ids).await;
        if items.is_empty() {
            return;
        }
        self.run("play next", |engine| async move {
            let at = match engine.status().await?.current_index {
                Some(current) => current + 1,
                None => engine.items().await?.len(),
            };
            engine.insert_items(at, items).await
        })
        .await;
    }

    pub async fn remove_from_queue(&self, index: usize) {
        let Some(engine_index) = self.core.engine_index(index) else {
            debug!("service: remove_from_queue({}) out of range", index);
            return;
        };
        self.run("remove from queue", |engine| async move {
            engine.remove_item(engine_index).await
        })
        .await;
    }

    pub async fn seek_to_queue_index(&self, index: usize) {
        let Some(engine_index) = self.core.engine_index(index) else {
            debug!("service: seek_to_queue_index({}) out of range", index);
            return;
        };
        self.run("jump in queue", |engine| async move {
            engine.seek_to_item(engine_index, None).await
        })
        .await;
    }

    // ── modes ───────────────────────────────────────────────────────────────

    pub async fn set_repeat_mode(&self, mode: RepeatMode) {
        self.run("repeat mode", |engine| async move {
            engine.set_repeat_mode(mode).await
        })
        .await;
    }

    pub async fn set_shuffle_enabled(&self, enabled: bool) {
        self.run("shuffle", |engine| async move {
            engine.set_shuffle_enabled(enabled).await
        })
        .await;
    }

    pub async fn set_playback_speed(&self, speed: f32) {
        if !speed.is_finite() {
            return;
        }
        let speed = speed.clamp(MIN_PLAYBACK_SPEED, MAX_PLAYBACK_SPEED);
        self.run("playback speed", |engine| async move {
            let pitch = engine.status().await?.pitch;
            engine.set_playback_parameters(speed, pitch).await
        })
        .await;
    }

    // ── per-song settings ───────────────────────────────────────────────────

    pub async fn apply_settings_now(&self, song_id: SongId, settings: SongSettings) {
        self.apply_settings(song_id, settings, ApplyMode::Commit).await;
    }

    pub async fn preview_settings(&self, song_id: SongId, settings: SongSettings) {
        self.apply_settings(song_id, settings, ApplyMode::Preview).await;
    }

    async fn apply_settings(&self, song_id: SongId, settings: SongSettings, mode: ApplyMode) {
        if self.engine().await.is_none() {
            debug!("service: settings for song {} skipped, no media engine", song_id);
            return;
        }
        match self.settings.apply(&self.core, song_id, &settings, mode).await {
            ApplyOutcome::NotCurrent => {}
            ApplyOutcome::ParametersOnly | ApplyOutcome::Swapped { .. } => {
                self.core.refresh(UpdateSource::SettingsApplied).await;
            }
            ApplyOutcome::Failed(message) => {
                warn!("service: settings for song {}: {}", song_id, message);
                self.core.record_error(message).await;
            }
        }
    }

    // ── state ───────────────────────────────────────────────────────────────

    /// Write the recovery pointer now.
    pub async fn save_playback_state(&self) -> bool {
        self.persistence.save_pointer(&self.core).await
    }

    /// Re-read the engine.  `force_resync` first drops a dead handle and
    /// reconnects if needed.
    pub async fn refresh_playback_state(&self, force_resync: bool) {
        if force_resync {
            self.supervisor.check_liveness().await;
            if self.engine().await.is_none() {
                return;
            }
            self.core.refresh(UpdateSource::ForcedResync).await;
        } else {
            self.core.refresh(UpdateSource::Manual).await;
        }
    }

    pub async fn dismiss_error(&self) {
        self.core.dismiss_error().await;
    }

    /// Save the pointer, stop background loops and detach from the engine.
    pub async fn shutdown(&self) {
        info!("service: shutting down");
        self.persistence.save_pointer(&self.core).await;
        self.shutdown.cancel();
        self.supervisor.disconnect().await;
    }
}
