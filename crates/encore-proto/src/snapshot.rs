use serde::{Deserialize, Serialize};

use crate::song::{SongId, SongRef};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RepeatMode {
    #[default]
    Off,
    One,
    All,
}

/// Link state between the sync engine and the media engine.
///
/// Transitions:
///   Disconnected -> Connecting -> Connected -> Disconnected
///   Connecting -> Disconnected (failure or cancel)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// What caused a snapshot to be published.  Diagnostic only.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum UpdateSource {
    #[default]
    Initial,
    Connected,
    ConnectionChanged,
    Restore,
    IsPlayingChanged,
    BufferingChanged,
    ItemTransition,
    RepeatModeChanged,
    ShuffleChanged,
    PlaybackParametersChanged,
    ErrorChanged,
    TimelineChanged,
    PositionDiscontinuity,
    PlayIntentChanged,
    SettingsApplied,
    LikedRefresh,
    ForcedResync,
    Manual,
    Failure,
}

/// The single published view of playback.
///
/// Replaced wholesale on every change; observers never see a partial update.
/// `rev` increases by one with every publish.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlaybackSnapshot {
    pub rev: u64,
    pub is_playing: bool,
    pub is_buffering: bool,
    pub current_song: Option<SongRef>,
    /// Always within `[0, duration_ms]` when the duration is known.
    pub position_ms: i64,
    /// 0 means unknown.
    pub duration_ms: i64,
    pub queue: Vec<SongRef>,
    /// `Some(i)` with `i < queue.len()` whenever `current_song` is set.
    pub current_queue_index: Option<usize>,
    pub repeat_mode: RepeatMode,
    pub shuffle_enabled: bool,
    pub playback_speed: f32,
    pub paused_by_focus_loss: bool,
    pub paused_by_noisy_route: bool,
    pub last_update_source: UpdateSource,
    pub error: Option<String>,
    #[serde(default)]
    pub connection: ConnectionState,
}

impl Default for PlaybackSnapshot {
    fn default() -> Self {
        Self {
            rev: 0,
            is_playing: false,
            is_buffering: false,
            current_song: None,
            position_ms: 0,
            duration_ms: 0,
            queue: Vec::new(),
            current_queue_index: None,
            repeat_mode: RepeatMode::Off,
            shuffle_enabled: false,
            playback_speed: 1.0,
            paused_by_focus_loss: false,
            paused_by_noisy_route: false,
            last_update_source: UpdateSource::Initial,
            error: None,
            connection: ConnectionState::Disconnected,
        }
    }
}

impl PlaybackSnapshot {
    pub fn current_song_id(&self) -> Option<SongId> {
        self.current_song.as_ref().map(|s| s.id)
    }

    pub fn queue_song_ids(&self) -> Vec<SongId> {
        self.queue.iter().map(|s| s.id).collect()
    }
}

/// Clamp an engine-reported position into `[0, duration_ms]`.
/// An unknown (zero or negative) duration only clamps the lower bound.
pub fn clamp_position(position_ms: i64, duration_ms: i64) -> i64 {
    let pos = position_ms.max(0);
    if duration_ms > 0 {
        pos.min(duration_ms)
    } else {
        pos
    }
}
