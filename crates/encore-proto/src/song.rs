use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type SongId = i64;

/// A playable song as the rest of the app knows it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SongRef {
    pub id: SongId,
    pub title: String,
    pub artist: String,
    #[serde(default)]
    pub album: Option<String>,
    /// Artwork location (file path or URL), if any.
    #[serde(default)]
    pub artwork: Option<String>,
    /// Where the engine loads the audio from.
    pub uri: String,
    #[serde(default)]
    pub liked: bool,
}

/// Trim window applied to a loaded item, in song time.
///
/// `end_ms` is exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClipWindow {
    pub start_ms: i64,
    #[serde(default)]
    pub end_ms: Option<i64>,
}

impl ClipWindow {
    /// Clamp a playhead position into this window.
    pub fn clamp(&self, position_ms: i64) -> i64 {
        let mut pos = position_ms.max(self.start_ms);
        if let Some(end) = self.end_ms {
            pos = pos.min(end - 1);
        }
        pos
    }
}

/// Per-song playback configuration edited from the song settings sheet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SongSettings {
    pub enabled: bool,
    #[serde(default)]
    pub start_ms: i64,
    #[serde(default)]
    pub end_ms: Option<i64>,
    #[serde(default = "unit_rate")]
    pub speed: f32,
    #[serde(default = "unit_rate")]
    pub pitch: f32,
}

fn unit_rate() -> f32 {
    1.0
}

impl Default for SongSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            start_ms: 0,
            end_ms: None,
            speed: 1.0,
            pitch: 1.0,
        }
    }
}

impl SongSettings {
    /// The clip window these settings ask for.
    ///
    /// `None` when trimming is disabled or the window would not trim anything
    /// (starts at zero with no end, or ends before it starts).
    pub fn clip_window(&self) -> Option<ClipWindow> {
        if !self.enabled {
            return None;
        }
        let start_ms = self.start_ms.max(0);
        match self.end_ms {
            Some(end) if end <= start_ms => None,
            None if start_ms == 0 => None,
            end_ms => Some(ClipWindow { start_ms, end_ms }),
        }
    }
}

/// Where playback was when the app last saved it.  Read once at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybackPointer {
    pub song_id: SongId,
    /// Engine index at save time.  May be stale or out of range on restore.
    pub queue_index: i64,
    pub position_ms: i64,
    #[serde(default)]
    pub queue_name: String,
}

/// A persisted queue (ids only).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedQueue {
    pub queue_id: i64,
    pub song_ids: Vec<SongId>,
    pub name: String,
    pub is_current: bool,
    #[serde(default = "Utc::now")]
    pub saved_at: DateTime<Utc>,
}

/// A saved queue with its songs resolved from the library.
#[derive(Debug, Clone, PartialEq)]
pub struct SavedQueueWithSongs {
    pub queue: SavedQueue,
    pub songs: Vec<SongRef>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trim(start_ms: i64, end_ms: Option<i64>) -> SongSettings {
        SongSettings {
            enabled: true,
            start_ms,
            end_ms,
            ..SongSettings::default()
        }
    }

    #[test]
    fn test_disabled_settings_have_no_window() {
        let settings = SongSettings {
            enabled: false,
            ..trim(10_000, Some(60_000))
        };
        assert_eq!(settings.clip_window(), None);
    }

    #[test]
    fn test_degenerate_windows_are_dropped() {
        assert_eq!(trim(0, None).clip_window(), None);
        assert_eq!(trim(-500, None).clip_window(), None);
        assert_eq!(trim(30_000, Some(30_000)).clip_window(), None);
        assert_eq!(trim(30_000, Some(10_000)).clip_window(), None);
    }

    #[test]
    fn test_window_clamp() {
        let window = trim(10_000, Some(60_000)).clip_window().unwrap();
        assert_eq!(window.clamp(70_000), 59_999);
        assert_eq!(window.clamp(5_000), 10_000);
        assert_eq!(window.clamp(42_000), 42_000);

        let open_ended = trim(10_000, None).clip_window().unwrap();
        assert_eq!(open_ended.clamp(500_000), 500_000);
    }

    #[test]
    fn test_settings_defaults_from_json() {
        let settings: SongSettings = serde_json::from_str(r#"{"enabled":true}"#).unwrap();
        assert_eq!(settings.speed, 1.0);
        assert_eq!(settings.pitch, 1.0);
        assert_eq!(settings.end_ms, None);
    }
}
