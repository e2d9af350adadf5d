//! Per-song settings: trim window hot-swap plus speed and pitch.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use encore_proto::song::{ClipWindow, SongId, SongRef, SongSettings};
use serde_json::json;
use tracing::{debug, warn};

use crate::collaborators::CommandBridge;
use crate::engine::EngineItem;
use crate::error::Result;
use crate::sync::SyncCore;

pub const APPLY_SETTINGS_ACTION: &str = "apply_song_settings";

/// Settings the user committed, keyed by song.  Shared by everything that
/// builds engine items so a committed trim survives queue edits and restore.
#[derive(Clone, Default)]
pub struct CommittedSettings {
    inner: Arc<Mutex<HashMap<SongId, SongSettings>>>,
}

impl CommittedSettings {
    pub fn get(&self, song_id: SongId) -> Option<SongSettings> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&song_id)
            .cloned()
    }

    pub fn commit(&self, song_id: SongId, settings: SongSettings) {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(song_id, settings);
    }

    pub fn clip_for(&self, song_id: SongId) -> Option<ClipWindow> {
        self.get(song_id).and_then(|s| s.clip_window())
    }

    pub fn item_for(&self, song: &SongRef) -> Result<EngineItem> {
        EngineItem::from_song(song, self.clip_for(song.id))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyMode {
    Commit,
    Preview,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The song is not the one loaded; nothing was touched.
    NotCurrent,
    /// Clip unchanged; only speed and pitch were pushed.
    ParametersOnly,
    /// The current item was reloaded with a new clip at this position.
    Swapped { position_ms: i64 },
    Failed(String),
}

pub struct SettingsApplicator {
    commands: Arc<dyn CommandBridge>,
    committed: CommittedSettings,
}

impl SettingsApplicator {
    pub fn new(commands: Arc<dyn CommandBridge>, committed: CommittedSettings) -> Self {
        Self {
            commands,
            committed,
        }
    }

    pub async fn apply(
        &self,
        core: &SyncCore,
        song_id: SongId,
        settings: &SongSettings,
        mode: ApplyMode,
    ) -> ApplyOutcome {
        let Some((guard, engine)) = core.lock_engine().await else {
            return ApplyOutcome::NotCurrent;
        };
        let (status, items) = match engine.status().await {
            Ok(status) => match engine.items().await {
                Ok(items) => (status, items),
                Err(e) => return ApplyOutcome::Failed(format!("Could not apply settings: {e}")),
            },
            Err(e) => return ApplyOutcome::Failed(format!("Could not apply settings: {e}")),
        };

        let Some((index, current)) = status
            .current_index
            .and_then(|i| items.get(i).map(|item| (i, item)))
        else {
            return ApplyOutcome::NotCurrent;
        };
        if current.song_id() != Some(song_id) {
            debug!(
                "settings: song {} is not loaded (current {:?}), ignoring",
                song_id,
                current.song_id()
            );
            return ApplyOutcome::NotCurrent;
        }
        if mode == ApplyMode::Commit {
            self.committed.commit(song_id, settings.clone());
        }

        let desired = settings.clip_window();
        let mut outcome = ApplyOutcome::ParametersOnly;
        if current.clip != desired {
            let position_ms = match desired {
                Some(window) => window.clamp(status.position_ms),
                None => status.position_ms.max(0),
            };
            let mut rebuilt = items.clone();
            rebuilt[index] = current.with_clip(desired);

            if let Err(e) = engine.replace_items(rebuilt, index, Some(position_ms)).await {
                return ApplyOutcome::Failed(format!("Could not apply trim: {e}"));
            }
            let resumed = if status.is_playing {
                engine.play().await
            } else {
                engine.pause().await
            };
            if let Err(e) = resumed {
                return ApplyOutcome::Failed(format!("Could not resume after trim: {e}"));
            }
            debug!("settings: song {} reloaded with {:?} at {} ms", song_id, desired, position_ms);
            outcome = ApplyOutcome::Swapped { position_ms };
        }

        if let Err(e) = engine
            .set_playback_parameters(settings.speed, settings.pitch)
            .await
        {
            warn!("settings: speed/pitch for song {} not applied: {}", song_id, e);
        }
        drop(guard);

        let payload = json!({
            "song_id": song_id,
            "speed": settings.speed,
            "pitch": settings.pitch,
            "preview": mode == ApplyMode::Preview,
        });
        if !self
            .commands
            .dispatch(APPLY_SETTINGS_ACTION, payload.clone())
            .await
        {
            if let Err(e) = engine.send_command(APPLY_SETTINGS_ACTION, payload).await {
                warn!("settings: engine refused {}: {}", APPLY_SETTINGS_ACTION, e);
            }
        }

        outcome
    }
}
