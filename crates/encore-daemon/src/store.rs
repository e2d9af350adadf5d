//! JSON file stores behind the sync engine's persistence collaborators.
//!
//! Every store owns one file under the data dir.  Writes go through a
//! temporary file and a rename so a crash never leaves half a document.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use encore_proto::song::{PlaybackPointer, SavedQueue, SavedQueueWithSongs, SongId, SongRef};
use encore_sync::collaborators::{
    CommandBridge, ListeningStats, PreferenceStore, QueueRepository, SessionController,
    SongRepository,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Recently-played entries kept in the history file.
const HISTORY_LIMIT: usize = 500;

async fn read_json<T: DeserializeOwned>(path: &Path) -> anyhow::Result<Option<T>> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => {
            let value = serde_json::from_str(&content)
                .with_context(|| format!("invalid JSON in {}", path.display()))?;
            Ok(Some(value))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("failed to read {}", path.display())),
    }
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let json = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, json).await?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}

// ── library ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PlayEntry {
    song_id: SongId,
    played_at: DateTime<Utc>,
}

#[derive(Default)]
struct LibraryCache {
    loaded_at: Option<SystemTime>,
    songs: HashMap<SongId, SongRef>,
}

/// Song library index (a JSON array of songs) plus the recently-played log.
///
/// The index is re-read whenever its modification time moves, so liked flags
/// edited by other tools show up on the next lookup.
pub struct LibraryStore {
    library_file: PathBuf,
    history_file: PathBuf,
    cache: Mutex<LibraryCache>,
    history: Mutex<()>,
}

impl LibraryStore {
    pub fn new(library_file: PathBuf, history_file: PathBuf) -> Self {
        Self {
            library_file,
            history_file,
            cache: Mutex::new(LibraryCache::default()),
            history: Mutex::new(()),
        }
    }

    async fn refresh_cache(&self, cache: &mut LibraryCache) -> anyhow::Result<()> {
        let modified = match tokio::fs::metadata(&self.library_file).await {
            Ok(meta) => meta.modified().ok(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if cache.loaded_at.is_none() {
                    warn!("library: {} does not exist", self.library_file.display());
                    cache.loaded_at = Some(SystemTime::UNIX_EPOCH);
                }
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        if modified.is_some() && modified == cache.loaded_at {
            return Ok(());
        }
        let songs: Vec<SongRef> = read_json(&self.library_file).await?.unwrap_or_default();
        info!("library: loaded {} songs", songs.len());
        cache.songs = songs.into_iter().map(|s| (s.id, s)).collect();
        cache.loaded_at = modified;
        Ok(())
    }

    #[cfg(test)]
    async fn recently_played(&self) -> anyhow::Result<Vec<SongId>> {
        let entries: Vec<PlayEntry> = read_json(&self.history_file).await?.unwrap_or_default();
        Ok(entries.iter().rev().map(|e| e.song_id).collect())
    }
}

#[async_trait]
impl SongRepository for LibraryStore {
    async fn get_by_id(&self, id: SongId) -> anyhow::Result<Option<SongRef>> {
        let mut cache = self.cache.lock().await;
        self.refresh_cache(&mut cache).await?;
        Ok(cache.songs.get(&id).cloned())
    }

    async fn log_play(&self, id: SongId) -> anyhow::Result<()> {
        let _guard = self.history.lock().await;
        let mut entries: Vec<PlayEntry> =
            read_json(&self.history_file).await?.unwrap_or_default();
        entries.push(PlayEntry {
            song_id: id,
            played_at: Utc::now(),
        });
        if entries.len() > HISTORY_LIMIT {
            entries.drain(..entries.len() - HISTORY_LIMIT);
        }
        write_json(&self.history_file, &entries).await
    }
}

// ── queues ────────────────────────────────────────────────────────────────────

/// Saved queues (ids only); songs are resolved through the library.
pub struct QueueStore {
    path: PathBuf,
    library: Arc<LibraryStore>,
    lock: Mutex<()>,
}

impl QueueStore {
    pub fn new(path: PathBuf, library: Arc<LibraryStore>) -> Self {
        Self {
            path,
            library,
            lock: Mutex::new(()),
        }
    }

    async fn load(&self) -> anyhow::Result<Vec<SavedQueue>> {
        Ok(read_json(&self.path).await?.unwrap_or_default())
    }
}

#[async_trait]
impl QueueRepository for QueueStore {
    async fn get_current_queue_with_songs(&self) -> anyhow::Result<Option<SavedQueueWithSongs>> {
        let _guard = self.lock.lock().await;
        let Some(queue) = self.load().await?.into_iter().find(|q| q.is_current) else {
            return Ok(None);
        };
        let mut songs = Vec::with_capacity(queue.song_ids.len());
        for id in &queue.song_ids {
            match self.library.get_by_id(*id).await? {
                Some(song) => songs.push(song),
                None => debug!("queues: song {} is no longer in the library", id),
            }
        }
        Ok(Some(SavedQueueWithSongs { queue, songs }))
    }

    async fn save_or_update_current_queue(
        &self,
        name: &str,
        songs: &[SongRef],
    ) -> anyhow::Result<i64> {
        let _guard = self.lock.lock().await;
        let mut queues = self.load().await?;
        let song_ids: Vec<SongId> = songs.iter().map(|s| s.id).collect();

        let queue_id = match queues.iter_mut().find(|q| q.is_current) {
            Some(current) => {
                current.name = name.to_string();
                current.song_ids = song_ids;
                current.saved_at = Utc::now();
                current.queue_id
            }
            None => {
                let queue_id = queues.iter().map(|q| q.queue_id).max().unwrap_or(0) + 1;
                queues.push(SavedQueue {
                    queue_id,
                    song_ids,
                    name: name.to_string(),
                    is_current: true,
                    saved_at: Utc::now(),
                });
                queue_id
            }
        };
        write_json(&self.path, &queues).await?;
        debug!("queues: saved current queue {} ({} songs)", queue_id, songs.len());
        Ok(queue_id)
    }
}

// ── playback pointer ──────────────────────────────────────────────────────────

pub struct PointerStore {
    path: PathBuf,
}

impl PointerStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl PreferenceStore for PointerStore {
    async fn get_playback_pointer(&self) -> anyhow::Result<Option<PlaybackPointer>> {
        read_json(&self.path).await
    }

    async fn save_playback_pointer(&self, pointer: &PlaybackPointer) -> anyhow::Result<()> {
        write_json(&self.path, pointer).await
    }

    async fn clear_playback_pointer(&self) -> anyhow::Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

// ── listening stats ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArtistTotals {
    pub plays: u64,
    pub listened_ms: i64,
}

/// Per-artist play counts and listening time.
pub struct StatsStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl StatsStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    pub async fn totals(&self) -> anyhow::Result<BTreeMap<String, ArtistTotals>> {
        Ok(read_json(&self.path).await?.unwrap_or_default())
    }
}

#[async_trait]
impl ListeningStats for StatsStore {
    async fn record_play_event(&self, artist: &str, duration_ms: i64) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        let mut totals = self.totals().await?;
        let entry = totals.entry(artist.to_string()).or_default();
        entry.plays += 1;
        entry.listened_ms += duration_ms.max(0);
        write_json(&self.path, &totals).await
    }
}

// ── session ───────────────────────────────────────────────────────────────────

/// Private-listening flag from config plus the last-activity instant.
pub struct LocalSession {
    private: AtomicBool,
    last_activity: std::sync::Mutex<Instant>,
}

impl LocalSession {
    pub fn new(private: bool) -> Self {
        Self {
            private: AtomicBool::new(private),
            last_activity: std::sync::Mutex::new(Instant::now()),
        }
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .elapsed()
    }
}

#[async_trait]
impl SessionController for LocalSession {
    async fn is_session_private(&self) -> bool {
        self.private.load(Ordering::SeqCst)
    }

    async fn refresh_inactivity_timer(&self) {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }
}

/// The daemon has no host-side handlers; every command goes to mpv.
pub struct DeclineCommands;

#[async_trait]
impl CommandBridge for DeclineCommands {
    async fn dispatch(&self, action: &str, _payload: Value) -> bool {
        debug!("commands: passing '{}' to the engine", action);
        false
    }
}
