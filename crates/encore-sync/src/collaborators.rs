//! Contracts for everything the sync engine consumes besides the media engine.
//!
//! All of these are implemented by the host (the daemon's file stores, or
//! in-memory fakes in tests).  I/O failures come back as `anyhow::Error` and are
//! logged by the caller; none of them reach the published snapshot except
//! through the restore path.

use async_trait::async_trait;
use encore_proto::snapshot::PlaybackSnapshot;
use encore_proto::song::{PlaybackPointer, SavedQueueWithSongs, SongId, SongRef};
use serde_json::Value;

#[async_trait]
pub trait SongRepository: Send + Sync {
    async fn get_by_id(&self, id: SongId) -> anyhow::Result<Option<SongRef>>;

    /// Append a "recently played" entry.
    async fn log_play(&self, id: SongId) -> anyhow::Result<()>;
}

#[async_trait]
pub trait QueueRepository: Send + Sync {
    async fn get_current_queue_with_songs(&self) -> anyhow::Result<Option<SavedQueueWithSongs>>;

    /// Create or overwrite the single "current" queue, returning its id.
    async fn save_or_update_current_queue(
        &self,
        name: &str,
        songs: &[SongRef],
    ) -> anyhow::Result<i64>;
}

#[async_trait]
pub trait PreferenceStore: Send + Sync {
    async fn get_playback_pointer(&self) -> anyhow::Result<Option<PlaybackPointer>>;

    async fn save_playback_pointer(&self, pointer: &PlaybackPointer) -> anyhow::Result<()>;

    async fn clear_playback_pointer(&self) -> anyhow::Result<()>;
}

#[async_trait]
pub trait SessionController: Send + Sync {
    async fn is_session_private(&self) -> bool;

    async fn refresh_inactivity_timer(&self);
}

#[async_trait]
pub trait ListeningStats: Send + Sync {
    async fn record_play_event(&self, artist: &str, duration_ms: i64) -> anyhow::Result<()>;
}

/// Out-of-band command channel owned by the host.
#[async_trait]
pub trait CommandBridge: Send + Sync {
    /// Returns `true` when the host handled the command itself.
    async fn dispatch(&self, action: &str, payload: Value) -> bool;
}

/// Hook run after every publish, while the sync lock is still held.
///
/// Must not block; anything slow belongs on a spawned task.
pub trait SnapshotObserver: Send + Sync {
    fn on_published(&self, previous: &PlaybackSnapshot, current: &PlaybackSnapshot);
}
