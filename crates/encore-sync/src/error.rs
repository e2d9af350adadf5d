//! Error types for the sync engine

use encore_proto::song::SongId;
use thiserror::Error;

/// Failures reported by a media engine call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    /// No engine handle, or the handle's process has gone away
    #[error("media engine is not connected")]
    Disconnected,

    /// Transport to the engine failed
    #[error("media engine IPC failure: {0}")]
    Ipc(String),

    /// Engine understood the call and refused it
    #[error("media engine rejected the command: {0}")]
    Rejected(String),

    /// Engine did not answer in time
    #[error("media engine did not answer in time")]
    Timeout,
}

/// Errors inside the sync engine.  None of these escape the public service.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// An engine item whose media id does not name a song
    #[error("engine item '{media_id}' does not map to a song")]
    Unmappable { media_id: String },

    /// A song that cannot be turned into an engine item
    #[error("song {song_id} has no playable uri")]
    Unplayable { song_id: SongId },

    #[error(transparent)]
    Collaborator(#[from] anyhow::Error),
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

pub type Result<T> = std::result::Result<T, SyncError>;
