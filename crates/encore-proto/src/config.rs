use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::platform;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub socket: SocketConfig,
    #[serde(default)]
    pub mpv: MpvConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

/// Files backing the persistence collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Song library index (JSON array of songs).
    #[serde(default = "default_library_file")]
    pub library_file: PathBuf,
    #[serde(default = "default_queues_file")]
    pub queues_file: PathBuf,
    #[serde(default = "default_pointer_file")]
    pub pointer_file: PathBuf,
    #[serde(default = "default_history_file")]
    pub history_file: PathBuf,
    #[serde(default = "default_stats_file")]
    pub stats_file: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocketConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MpvConfig {
    /// Explicit mpv binary.  Falls back to beside-exe, then PATH.
    #[serde(default)]
    pub binary: Option<PathBuf>,
    #[serde(default = "default_volume")]
    pub default_volume: f32,
}

/// What restore does when the saved song is no longer in the saved queue.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RestoreFallback {
    /// Restore to the clamped saved index at the saved position.
    #[default]
    ClampedIndex,
    /// Ignore the pointer and load the queue at its default position.
    DropPointer,
}

/// Tuning for the synchronization engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Quiet period before an edited queue is written back.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// Minimum listening time before a play counts towards statistics.
    #[serde(default = "default_min_listen_ms")]
    pub min_listen_ms: u64,
    #[serde(default)]
    pub restore_fallback: RestoreFallback,
    /// Write the playback pointer whenever playback pauses.
    #[serde(default = "default_true")]
    pub save_pointer_on_pause: bool,
    /// Engine liveness check interval.  0 disables the check.
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    /// Name given to the auto-saved queue.
    #[serde(default = "default_queue_name")]
    pub queue_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SessionConfig {
    /// Private listening: nothing is written to history or statistics.
    #[serde(default)]
    pub private: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            library_file: default_library_file(),
            queues_file: default_queues_file(),
            pointer_file: default_pointer_file(),
            history_file: default_history_file(),
            stats_file: default_stats_file(),
        }
    }
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
        }
    }
}

impl Default for MpvConfig {
    fn default() -> Self {
        Self {
            binary: None,
            default_volume: default_volume(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            min_listen_ms: default_min_listen_ms(),
            restore_fallback: RestoreFallback::default(),
            save_pointer_on_pause: default_true(),
            heartbeat_secs: default_heartbeat_secs(),
            queue_name: default_queue_name(),
        }
    }
}

fn default_library_file() -> PathBuf {
    platform::data_dir().join("library.json")
}

fn default_queues_file() -> PathBuf {
    platform::data_dir().join("queues.json")
}

fn default_pointer_file() -> PathBuf {
    platform::data_dir().join("pointer.json")
}

fn default_history_file() -> PathBuf {
    platform::data_dir().join("history.json")
}

fn default_stats_file() -> PathBuf {
    platform::data_dir().join("stats.json")
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    platform::DAEMON_TCP_PORT
}

fn default_volume() -> f32 {
    0.5
}

fn default_debounce_ms() -> u64 {
    2000
}

fn default_min_listen_ms() -> u64 {
    1000
}

fn default_true() -> bool {
    true
}

fn default_heartbeat_secs() -> u64 {
    10
}

fn default_queue_name() -> String {
    "Now Playing".to_string()
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            let config = Self::default();
            config.save()?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(&config_path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let config_path = Self::config_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }
}
