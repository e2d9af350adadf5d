//! Queue persistence: debounced auto-save and startup restore.
//!
//! Auto-save keeps two memos, the last queue written and the one waiting in
//! the debounce timer.  A published queue equal to the saved one cancels the
//! timer; a queue equal to the pending one leaves it alone; anything else
//! restarts it.
//!
//! ```text
//!   publish ─► differs? ─► abort pending ─► sleep(debounce) ─► save ─► memo
//! ```

use std::sync::{Arc, Mutex};
use std::time::Duration;

use encore_proto::config::{RestoreFallback, SyncConfig};
use encore_proto::snapshot::PlaybackSnapshot;
use encore_proto::song::{PlaybackPointer, SongId, SongRef};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::collaborators::{PreferenceStore, QueueRepository, SnapshotObserver};
use crate::engine::{EngineItem, MediaEngine};
use crate::settings::CommittedSettings;
use crate::sync::SyncCore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreOutcome {
    NothingSaved,
    /// The connect was cancelled before the queue was loaded.
    Cancelled,
    Restored {
        index: usize,
        position_ms: Option<i64>,
        songs: usize,
    },
    Failed(String),
}

/// Where a restored queue starts.  `position_ms: None` means no seek.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartPoint {
    pub index: usize,
    pub position_ms: Option<i64>,
}

/// Pick the restore start for `song_ids` from a saved pointer.
///
/// The saved index is clamped first; if the song there is not the saved one
/// the queue is searched for it, and only if it is gone does `fallback`
/// decide.
pub fn resolve_start(
    song_ids: &[SongId],
    pointer: Option<&PlaybackPointer>,
    fallback: RestoreFallback,
) -> StartPoint {
    let default = StartPoint {
        index: 0,
        position_ms: None,
    };
    let Some(pointer) = pointer else {
        return default;
    };
    if song_ids.is_empty() {
        return default;
    }

    let last = (song_ids.len() - 1) as i64;
    let clamped = pointer.queue_index.clamp(0, last) as usize;
    let position_ms = Some(pointer.position_ms.max(0));

    if song_ids[clamped] == pointer.song_id {
        return StartPoint {
            index: clamped,
            position_ms,
        };
    }
    if let Some(found) = song_ids.iter().position(|&id| id == pointer.song_id) {
        return StartPoint {
            index: found,
            position_ms,
        };
    }
    match fallback {
        RestoreFallback::ClampedIndex => StartPoint {
            index: clamped,
            position_ms,
        },
        RestoreFallback::DropPointer => default,
    }
}

struct PendingSave {
    generation: u64,
    song_ids: Vec<SongId>,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct AutoSaveState {
    /// Song ids of the last queue written or restored.
    saved: Option<Vec<SongId>>,
    pending: Option<PendingSave>,
    generation: u64,
}

pub struct QueuePersistence {
    queues: Arc<dyn QueueRepository>,
    prefs: Arc<dyn PreferenceStore>,
    committed: CommittedSettings,
    queue_name: String,
    debounce: Duration,
    fallback: RestoreFallback,
    state: Arc<Mutex<AutoSaveState>>,
}

impl QueuePersistence {
    pub fn new(
        queues: Arc<dyn QueueRepository>,
        prefs: Arc<dyn PreferenceStore>,
        committed: CommittedSettings,
        config: &SyncConfig,
    ) -> Self {
        Self {
            queues,
            prefs,
            committed,
            queue_name: config.queue_name.clone(),
            debounce: Duration::from_millis(config.debounce_ms),
            fallback: config.restore_fallback,
            state: Arc::new(Mutex::new(AutoSaveState::default())),
        }
    }

    fn schedule(&self, songs: Vec<SongRef>) {
        let song_ids: Vec<SongId> = songs.iter().map(|s| s.id).collect();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        if state.saved.as_ref().is_some_and(|saved| *saved == song_ids) {
            if let Some(pending) = state.pending.take() {
                debug!("persistence: queue back to saved state, dropping pending save");
                pending.handle.abort();
            }
            return;
        }
        if state.pending.as_ref().is_some_and(|p| p.song_ids == song_ids) {
            return;
        }
        if let Some(pending) = state.pending.take() {
            pending.handle.abort();
        }

        state.generation += 1;
        let generation = state.generation;
        let shared = Arc::clone(&self.state);
        let queues = Arc::clone(&self.queues);
        let name = self.queue_name.clone();
        let debounce = self.debounce;
        let ids = song_ids.clone();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            {
                let mut state = shared.lock().unwrap_or_else(|e| e.into_inner());
                if !state
                    .pending
                    .as_ref()
                    .is_some_and(|p| p.generation == generation)
                {
                    return;
                }
                state.pending = None;
            }
            match queues.save_or_update_current_queue(&name, &songs).await {
                Ok(queue_id) => {
                    debug!("persistence: saved {} songs as queue {}", songs.len(), queue_id);
                    let mut state = shared.lock().unwrap_or_else(|e| e.into_inner());
                    state.saved = Some(ids);
                }
                Err(e) => warn!("persistence: queue save failed: {:#}", e),
            }
        });

        state.pending = Some(PendingSave {
            generation,
            song_ids,
            handle,
        });
    }

    /// Load the saved queue into an engine that has nothing loaded.
    ///
    /// Nothing is written to the engine or the pointer store once `cancel`
    /// fires.
    pub async fn restore(
        &self,
        engine: &dyn MediaEngine,
        cancel: &CancellationToken,
    ) -> RestoreOutcome {
        let loaded = tokio::select! {
            _ = cancel.cancelled() => return RestoreOutcome::Cancelled,
            loaded = self.queues.get_current_queue_with_songs() => loaded,
        };
        let saved = match loaded {
            Ok(Some(saved)) => saved,
            Ok(None) => return RestoreOutcome::NothingSaved,
            Err(e) => {
                return RestoreOutcome::Failed(format!("Could not load the saved queue: {e:#}"))
            }
        };

        let mut song_ids = Vec::with_capacity(saved.songs.len());
        let mut items = Vec::with_capacity(saved.songs.len());
        for song in &saved.songs {
            match self.committed.item_for(song) {
                Ok(item) => {
                    song_ids.push(song.id);
                    items.push(item);
                }
                Err(e) => warn!("persistence: skipping saved song: {}", e),
            }
        }
        if items.is_empty() {
            debug!("persistence: saved queue {} has nothing playable", saved.queue.queue_id);
            return RestoreOutcome::NothingSaved;
        }

        let pointer = tokio::select! {
            _ = cancel.cancelled() => return RestoreOutcome::Cancelled,
            pointer = self.prefs.get_playback_pointer() => pointer,
        };
        let pointer = match pointer {
            Ok(pointer) => pointer,
            Err(e) => {
                warn!("persistence: playback pointer unreadable, ignoring: {:#}", e);
                None
            }
        };
        let start = resolve_start(&song_ids, pointer.as_ref(), self.fallback);
        let count = items.len();
        if cancel.is_cancelled() {
            return RestoreOutcome::Cancelled;
        }

        // Seeded before loading so the refreshes the load triggers see it.
        self.state.lock().unwrap_or_else(|e| e.into_inner()).saved = Some(song_ids);

        if let Err(e) = engine
            .replace_items(items, start.index, start.position_ms)
            .await
        {
            return RestoreOutcome::Failed(format!("Could not restore the saved queue: {e}"));
        }

        if pointer.is_some() {
            if let Err(e) = self.prefs.clear_playback_pointer().await {
                warn!("persistence: could not clear playback pointer: {:#}", e);
            }
        }

        RestoreOutcome::Restored {
            index: start.index,
            position_ms: start.position_ms,
            songs: count,
        }
    }

    /// Write the pointer for whatever the engine has loaded right now.
    pub async fn save_pointer(&self, core: &SyncCore) -> bool {
        let Some((_guard, engine)) = core.lock_engine().await else {
            return false;
        };
        let (status, items) = match engine.status().await {
            Ok(status) => match engine.items().await {
                Ok(items) => (status, items),
                Err(e) => {
                    warn!("persistence: pointer not saved: {}", e);
                    return false;
                }
            },
            Err(e) => {
                warn!("persistence: pointer not saved: {}", e);
                return false;
            }
        };

        let Some((index, song_id)) = status
            .current_index
            .and_then(|i| items.get(i).and_then(|item| item.song_id()).map(|id| (i, id)))
        else {
            return false;
        };
        let pointer = PlaybackPointer {
            song_id,
            queue_index: queue_position(&items, index) as i64,
            position_ms: status.position_ms.max(0),
            queue_name: self.queue_name.clone(),
        };
        match self.prefs.save_playback_pointer(&pointer).await {
            Ok(()) => {
                info!(
                    "persistence: pointer saved (song {}, index {}, {} ms)",
                    pointer.song_id, pointer.queue_index, pointer.position_ms
                );
                true
            }
            Err(e) => {
                warn!("persistence: pointer save failed: {:#}", e);
                false
            }
        }
    }
}

/// Position of engine item `engine_index` in the published queue, which
/// leaves out items that do not map to a song.
fn queue_position(items: &[EngineItem], engine_index: usize) -> usize {
    items[..engine_index.min(items.len())]
        .iter()
        .filter(|item| item.song_id().is_some())
        .count()
}

impl SnapshotObserver for QueuePersistence {
    fn on_published(&self, _previous: &PlaybackSnapshot, current: &PlaybackSnapshot) {
        // An empty queue would clobber the saved one before restore runs.
        if current.queue.is_empty() {
            return;
        }
        self.schedule(current.queue.clone());
    }
}
