use serde::{Deserialize, Serialize};

use crate::snapshot::{PlaybackSnapshot, RepeatMode};
use crate::song::{SongId, SongSettings};

/// Current protocol version.  Bump this when the wire format changes in a
/// breaking way.  Clients check this on connect and can refuse to talk to an
/// incompatible daemon.
pub const PROTOCOL_VERSION: u32 = 1;

/// Messages sent from a client to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd")]
pub enum Command {
    Play,
    Pause,
    PlayPause,
    SeekTo { position_ms: i64 },
    Next,
    Previous,
    PlaySong { song_id: SongId },
    PlayQueue { song_ids: Vec<SongId>, start_index: usize },
    AddToQueue { song_ids: Vec<SongId> },
    PlayNext { song_ids: Vec<SongId> },
    RemoveFromQueue { index: usize },
    SeekToQueueIndex { index: usize },
    SetRepeatMode { mode: RepeatMode },
    SetShuffle { enabled: bool },
    SetSpeed { speed: f32 },
    ApplySettings { song_id: SongId, settings: SongSettings },
    PreviewSettings { song_id: SongId, settings: SongSettings },
    SavePlaybackState,
    Refresh { force: bool },
    DismissError,
    GetState,
}

/// Messages sent from the daemon to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "broadcast")]
pub enum Broadcast {
    /// Sent immediately on connect: protocol version + full snapshot.
    Hello {
        protocol_version: u32,
        snapshot: PlaybackSnapshot,
    },
    State {
        snapshot: PlaybackSnapshot,
    },
    Log {
        message: String,
    },
    Error {
        message: String,
    },
}

/// Wrapper for socket communication
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Command(Command),
    Broadcast(Broadcast),
}

impl Message {
    /// Frame as a 4-byte big-endian length followed by JSON.
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        let json = serde_json::to_vec(self)?;
        let len = json.len() as u32;
        let mut result = Vec::with_capacity(4 + json.len());
        result.extend_from_slice(&len.to_be_bytes());
        result.extend_from_slice(&json);
        Ok(result)
    }

    /// Decode one frame from the front of `data`, returning the message and
    /// the number of bytes consumed.
    pub fn decode(data: &[u8]) -> anyhow::Result<(Self, usize)> {
        if data.len() < 4 {
            anyhow::bail!("Insufficient data for length header");
        }
        let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if data.len() < 4 + len {
            anyhow::bail!("Insufficient data for message");
        }
        let msg: Self = serde_json::from_slice(&data[4..4 + len])?;
        Ok((msg, 4 + len))
    }
}
