//! Contract of the external media engine.
//!
//! The engine is a black box that renders audio on its own threads and owns
//! the real-time position.  The sync engine talks to it only through
//! [`MediaEngine`] and hears back only through [`EngineListener`].
//!
//! Positions are in song time: a clipped item starting at 10 s reports
//! 10 000 ms at its first audible sample.

use std::sync::Arc;

use async_trait::async_trait;
use encore_proto::snapshot::{RepeatMode, UpdateSource};
use encore_proto::song::{ClipWindow, SongId, SongRef};
use serde_json::Value;

use crate::error::{EngineResult, SyncError};

/// One entry of the engine's play list, in the engine's own terms.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineItem {
    /// Song id rendered as text; the engine treats it as opaque.
    pub media_id: String,
    pub uri: String,
    pub title: String,
    pub artist: String,
    pub album: Option<String>,
    pub artwork: Option<String>,
    pub clip: Option<ClipWindow>,
}

impl EngineItem {
    pub fn from_song(song: &SongRef, clip: Option<ClipWindow>) -> Result<Self, SyncError> {
        if song.uri.trim().is_empty() {
            return Err(SyncError::Unplayable { song_id: song.id });
        }
        Ok(Self {
            media_id: song.id.to_string(),
            uri: song.uri.clone(),
            title: song.title.clone(),
            artist: song.artist.clone(),
            album: song.album.clone(),
            artwork: song.artwork.clone(),
            clip,
        })
    }

    pub fn song_id(&self) -> Option<SongId> {
        self.media_id.trim().parse().ok()
    }

    /// Map back to the song this item was built from.
    ///
    /// The liked flag is not carried by the engine and comes back `false`.
    pub fn to_song_ref(&self) -> Result<SongRef, SyncError> {
        let id = self.song_id().ok_or_else(|| SyncError::Unmappable {
            media_id: self.media_id.clone(),
        })?;
        Ok(SongRef {
            id,
            title: self.title.clone(),
            artist: self.artist.clone(),
            album: self.album.clone(),
            artwork: self.artwork.clone(),
            uri: self.uri.clone(),
            liked: false,
        })
    }

    /// Same item bound again with a different clip window.
    pub fn with_clip(&self, clip: Option<ClipWindow>) -> Self {
        Self {
            clip,
            ..self.clone()
        }
    }
}

/// Everything about the engine except its item list, read in one query.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineStatus {
    pub is_playing: bool,
    pub is_buffering: bool,
    pub position_ms: i64,
    /// 0 when unknown.
    pub duration_ms: i64,
    pub current_index: Option<usize>,
    pub repeat_mode: RepeatMode,
    pub shuffle_enabled: bool,
    pub speed: f32,
    pub pitch: f32,
    pub error: Option<String>,
}

impl Default for EngineStatus {
    fn default() -> Self {
        Self {
            is_playing: false,
            is_buffering: false,
            position_ms: 0,
            duration_ms: 0,
            current_index: None,
            repeat_mode: RepeatMode::Off,
            shuffle_enabled: false,
            speed: 1.0,
            pitch: 1.0,
            error: None,
        }
    }
}

/// Why the engine's intent to play changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayIntentReason {
    UserRequest,
    Remote,
    AudioFocusLoss,
    AudioBecomingNoisy,
    EndOfMedia,
}

/// Raw engine notifications, one variant per callback kind.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    IsPlayingChanged(bool),
    BufferingChanged(bool),
    ItemTransition { index: Option<usize> },
    RepeatModeChanged(RepeatMode),
    ShuffleChanged(bool),
    PlaybackParametersChanged { speed: f32, pitch: f32 },
    ErrorChanged(Option<String>),
    TimelineChanged,
    PositionDiscontinuity,
    PlayIntentChanged {
        play_when_ready: bool,
        reason: PlayIntentReason,
    },
}

impl EngineEvent {
    pub fn source(&self) -> UpdateSource {
        match self {
            EngineEvent::IsPlayingChanged(_) => UpdateSource::IsPlayingChanged,
            EngineEvent::BufferingChanged(_) => UpdateSource::BufferingChanged,
            EngineEvent::ItemTransition { .. } => UpdateSource::ItemTransition,
            EngineEvent::RepeatModeChanged(_) => UpdateSource::RepeatModeChanged,
            EngineEvent::ShuffleChanged(_) => UpdateSource::ShuffleChanged,
            EngineEvent::PlaybackParametersChanged { .. } => {
                UpdateSource::PlaybackParametersChanged
            }
            EngineEvent::ErrorChanged(_) => UpdateSource::ErrorChanged,
            EngineEvent::TimelineChanged => UpdateSource::TimelineChanged,
            EngineEvent::PositionDiscontinuity => UpdateSource::PositionDiscontinuity,
            EngineEvent::PlayIntentChanged { .. } => UpdateSource::PlayIntentChanged,
        }
    }
}

/// Callback interface the engine invokes on its own thread.
///
/// Implementations must return quickly and never block on I/O.
pub trait EngineListener: Send + Sync {
    fn on_event(&self, event: EngineEvent);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// False once the engine process behind this handle has gone away.
    fn is_alive(&self) -> bool;

    async fn status(&self) -> EngineResult<EngineStatus>;

    async fn items(&self) -> EngineResult<Vec<EngineItem>>;

    async fn play(&self) -> EngineResult<()>;

    async fn pause(&self) -> EngineResult<()>;

    async fn seek_to(&self, position_ms: i64) -> EngineResult<()>;

    /// Make `index` current, optionally starting at `position_ms`.
    async fn seek_to_item(&self, index: usize, position_ms: Option<i64>) -> EngineResult<()>;

    async fn next(&self) -> EngineResult<()>;

    async fn previous(&self) -> EngineResult<()>;

    /// Replace the whole item list.  Play/pause state is left as it was.
    async fn replace_items(
        &self,
        items: Vec<EngineItem>,
        start_index: usize,
        start_position_ms: Option<i64>,
    ) -> EngineResult<()>;

    /// Insert before `index`; `index == len` appends.
    async fn insert_items(&self, index: usize, items: Vec<EngineItem>) -> EngineResult<()>;

    async fn remove_item(&self, index: usize) -> EngineResult<()>;

    async fn set_repeat_mode(&self, mode: RepeatMode) -> EngineResult<()>;

    async fn set_shuffle_enabled(&self, enabled: bool) -> EngineResult<()>;

    async fn set_playback_parameters(&self, speed: f32, pitch: f32) -> EngineResult<()>;

    fn add_listener(&self, listener: Arc<dyn EngineListener>) -> ListenerId;

    fn remove_listener(&self, id: ListenerId);

    /// Generic named command channel for things the typed API cannot say.
    async fn send_command(&self, action: &str, payload: Value) -> EngineResult<()>;
}

/// Platform session lookup: produces a fresh handle to the running engine,
/// starting it when needed.
#[async_trait]
pub trait EngineConnector: Send + Sync {
    async fn connect(&self) -> anyhow::Result<Arc<dyn MediaEngine>>;
}
