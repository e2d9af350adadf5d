//! State synchronization core.
//!
//! Owns the only `watch::Sender<PlaybackSnapshot>`.  Every publish happens
//! under one async mutex, so snapshots form a total order and `rev` goes up by
//! exactly one each time:
//!
//! ```text
//!   lock ─► status() + items() ─► build_snapshot ─► send_replace ─► observers
//!    │                                                                  │
//!    └────────────────────────────── unlock ◄──────────────────────────┘
//!                                      │
//!                                      └─► spawned liked-flag re-fetch
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use encore_proto::snapshot::{clamp_position, ConnectionState, PlaybackSnapshot, UpdateSource};
use encore_proto::song::{SongId, SongRef};
use tokio::sync::{watch, MutexGuard};
use tracing::{debug, warn};

use crate::bridge::{EventBridge, PauseFlags};
use crate::collaborators::{SnapshotObserver, SongRepository};
use crate::engine::{EngineItem, EngineStatus, MediaEngine};
use crate::supervisor::EngineSlot;

/// The two snapshots either side of a successful refresh.
#[derive(Debug, Clone)]
pub struct Refreshed {
    pub previous: PlaybackSnapshot,
    pub current: PlaybackSnapshot,
}

pub struct SyncCore {
    slot: Arc<EngineSlot>,
    bridge: Arc<EventBridge>,
    songs: Arc<dyn SongRepository>,
    snapshot_tx: watch::Sender<PlaybackSnapshot>,
    lock: tokio::sync::Mutex<()>,
    /// Published queue index -> engine item index.
    index_map: Mutex<Vec<usize>>,
    mismatches: AtomicU64,
    observers: Vec<Arc<dyn SnapshotObserver>>,
}

impl SyncCore {
    pub fn new(
        slot: Arc<EngineSlot>,
        bridge: Arc<EventBridge>,
        songs: Arc<dyn SongRepository>,
        observers: Vec<Arc<dyn SnapshotObserver>>,
    ) -> Self {
        let (snapshot_tx, _) = watch::channel(PlaybackSnapshot::default());
        Self {
            slot,
            bridge,
            songs,
            snapshot_tx,
            lock: tokio::sync::Mutex::new(()),
            index_map: Mutex::new(Vec::new()),
            mismatches: AtomicU64::new(0),
            observers,
        }
    }

    pub fn snapshot(&self) -> PlaybackSnapshot {
        self.snapshot_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PlaybackSnapshot> {
        self.snapshot_tx.subscribe()
    }

    /// Engine items skipped so far because they did not map to a song.
    pub fn conversion_mismatches(&self) -> u64 {
        self.mismatches.load(Ordering::Relaxed)
    }

    /// Engine index of the item shown at `queue_index` in the last snapshot.
    pub fn engine_index(&self, queue_index: usize) -> Option<usize> {
        self.index_map
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(queue_index)
            .copied()
    }

    /// Take the sync lock together with the live engine.
    ///
    /// Used by callers that must read the engine and act on what they read
    /// without a refresh slipping in between.
    pub async fn lock_engine(&self) -> Option<(MutexGuard<'_, ()>, Arc<dyn MediaEngine>)> {
        let guard = self.lock.lock().await;
        let engine = self.slot.current()?;
        Some((guard, engine))
    }

    /// Recompute the snapshot from the live engine and publish it.
    ///
    /// Returns `None` when there is no live engine or the engine query failed
    /// (the failure is recorded into the published snapshot).
    pub async fn refresh(self: &Arc<Self>, source: UpdateSource) -> Option<Refreshed> {
        let guard = self.lock.lock().await;
        let Some(engine) = self.slot.current() else {
            debug!("sync: refresh ({:?}) skipped, no live engine", source);
            return None;
        };

        let queried = match engine.status().await {
            Ok(status) => engine.items().await.map(|items| (status, items)),
            Err(e) => Err(e),
        };
        let (status, items) = match queried {
            Ok(q) => q,
            Err(e) => {
                warn!("sync: engine query failed during {:?}: {}", source, e);
                self.publish_error_locked(format!("Playback state unavailable: {e}"));
                return None;
            }
        };

        let previous = self.snapshot();
        let built = build_snapshot(&previous, &status, &items, self.bridge.flags(), source);
        if built.skipped > 0 {
            self.mismatches
                .fetch_add(built.skipped as u64, Ordering::Relaxed);
        }
        *self.index_map.lock().unwrap_or_else(|e| e.into_inner()) = built.index_map;

        let (previous, current) = self.publish_locked(built.snapshot);
        drop(guard);

        if let Some(song_id) = current.current_song_id() {
            self.spawn_liked_refresh(song_id);
        }
        Some(Refreshed { previous, current })
    }

    /// Publish the current snapshot again with `message` as its error.
    pub async fn record_error(&self, message: impl Into<String>) {
        let _guard = self.lock.lock().await;
        self.publish_error_locked(message.into());
    }

    pub async fn dismiss_error(&self) {
        let _guard = self.lock.lock().await;
        let mut next = self.snapshot();
        if next.error.take().is_none() {
            return;
        }
        next.last_update_source = UpdateSource::Manual;
        self.publish_locked(next);
    }

    /// Mirror the supervisor's connection state into the snapshot.
    pub async fn set_connection(&self, state: ConnectionState) {
        let _guard = self.lock.lock().await;
        let mut next = self.snapshot();
        if next.connection == state {
            return;
        }
        next.connection = state;
        if state == ConnectionState::Disconnected {
            next.is_playing = false;
            next.is_buffering = false;
        }
        next.last_update_source = UpdateSource::ConnectionChanged;
        self.publish_locked(next);
    }

    fn publish_error_locked(&self, message: String) {
        let mut next = self.snapshot();
        next.error = Some(message);
        next.last_update_source = UpdateSource::Failure;
        self.publish_locked(next);
    }

    /// Caller holds `self.lock`.
    fn publish_locked(&self, mut next: PlaybackSnapshot) -> (PlaybackSnapshot, PlaybackSnapshot) {
        let previous = self.snapshot();
        next.rev = previous.rev + 1;
        self.snapshot_tx.send_replace(next.clone());
        for observer in &self.observers {
            observer.on_published(&previous, &next);
        }
        (previous, next)
    }

    fn spawn_liked_refresh(self: &Arc<Self>, song_id: SongId) {
        let core = Arc::clone(self);
        tokio::spawn(async move {
            let liked = match core.songs.get_by_id(song_id).await {
                Ok(Some(song)) => song.liked,
                Ok(None) => return,
                Err(e) => {
                    warn!("sync: liked lookup for song {} failed: {:#}", song_id, e);
                    return;
                }
            };

            let _guard = core.lock.lock().await;
            let mut next = core.snapshot();
            let Some(current) = next.current_song.as_mut() else {
                return;
            };
            if current.id != song_id || current.liked == liked {
                return;
            }
            current.liked = liked;
            if let Some(entry) = next
                .current_queue_index
                .and_then(|i| next.queue.get_mut(i))
            {
                entry.liked = liked;
            }
            next.last_update_source = UpdateSource::LikedRefresh;
            core.publish_locked(next);
        });
    }
}

// ── snapshot construction ───────────────────────────────────────────────────

pub(crate) struct Built {
    pub snapshot: PlaybackSnapshot,
    pub index_map: Vec<usize>,
    pub skipped: usize,
}

/// Pure translation of one engine reading into a snapshot (`rev` unset).
pub(crate) fn build_snapshot(
    previous: &PlaybackSnapshot,
    status: &EngineStatus,
    items: &[EngineItem],
    flags: PauseFlags,
    source: UpdateSource,
) -> Built {
    // Liked flags are not carried by the engine; keep what we already knew.
    let known_liked: HashMap<SongId, bool> = previous
        .queue
        .iter()
        .chain(previous.current_song.iter())
        .map(|s| (s.id, s.liked))
        .collect();

    let mut queue: Vec<SongRef> = Vec::with_capacity(items.len());
    let mut index_map = Vec::with_capacity(items.len());
    let mut skipped = 0;
    for (engine_index, item) in items.iter().enumerate() {
        match item.to_song_ref() {
            Ok(mut song) => {
                song.liked = known_liked.get(&song.id).copied().unwrap_or(false);
                queue.push(song);
                index_map.push(engine_index);
            }
            Err(e) => {
                warn!("sync: skipping engine item {}: {}", engine_index, e);
                skipped += 1;
            }
        }
    }

    let current_queue_index = status
        .current_index
        .and_then(|engine_index| index_map.iter().position(|&m| m == engine_index));
    let current_song = current_queue_index.map(|i| queue[i].clone());

    let duration_ms = status.duration_ms.max(0);
    let snapshot = PlaybackSnapshot {
        rev: previous.rev,
        is_playing: status.is_playing,
        is_buffering: status.is_buffering,
        current_song,
        position_ms: clamp_position(status.position_ms, duration_ms),
        duration_ms,
        queue,
        current_queue_index,
        repeat_mode: status.repeat_mode,
        shuffle_enabled: status.shuffle_enabled,
        playback_speed: status.speed,
        paused_by_focus_loss: flags.focus_loss,
        paused_by_noisy_route: flags.noisy_route,
        last_update_source: source,
        error: status.error.clone(),
        connection: previous.connection,
    };

    Built {
        snapshot,
        index_map,
        skipped,
    }
}
