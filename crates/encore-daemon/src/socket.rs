use encore_proto::protocol::{Broadcast, Command, Message, PROTOCOL_VERSION};
use encore_proto::snapshot::PlaybackSnapshot;
use encore_sync::PlaybackService;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Frames above this are treated as garbage and the buffer is dropped.
const MAX_FRAME_LEN: usize = 1 << 20;

pub fn start_server(
    bind_address: String,
    port: u16,
    service: Arc<PlaybackService>,
    log_tx: broadcast::Sender<String>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let addr = format!("{}:{}", bind_address, port);

        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("socket: failed to bind {}: {}", addr, e);
                return;
            }
        };

        info!("socket: listening at {}", addr);

        let mut client_id = 0usize;

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    client_id += 1;
                    let id = client_id;
                    info!("socket: client {} connected from {}", id, peer);

                    let service = service.clone();
                    let log_rx = log_tx.subscribe();
                    tokio::spawn(async move {
                        handle_client(stream, service, id, log_rx).await;
                        info!("socket: client {} disconnected", id);
                    });
                }
                Err(e) => {
                    error!("socket: failed to accept connection: {}", e);
                }
            }
        }
    })
}

async fn send(write_half: &mut OwnedWriteHalf, broadcast: Broadcast) -> bool {
    match Message::Broadcast(broadcast).encode() {
        Ok(encoded) => write_half.write_all(&encoded).await.is_ok(),
        Err(e) => {
            warn!("socket: failed to encode broadcast: {}", e);
            true
        }
    }
}

async fn handle_client(
    stream: TcpStream,
    service: Arc<PlaybackService>,
    client_id: usize,
    mut log_rx: broadcast::Receiver<String>,
) {
    let (mut read_half, mut write_half) = stream.into_split();
    let mut tmp = [0u8; 4096];
    let mut read_buf: Vec<u8> = Vec::new();

    let mut snapshot_rx = service.subscribe();
    let hello = snapshot_rx.borrow_and_update().clone();
    let mut last_error = hello.error.clone();
    let hello = Broadcast::Hello {
        protocol_version: PROTOCOL_VERSION,
        snapshot: hello,
    };
    if !send(&mut write_half, hello).await {
        return;
    }

    loop {
        tokio::select! {
            result = read_half.read(&mut tmp) => {
                match result {
                    Ok(0) => {
                        debug!("socket: client {} closed connection", client_id);
                        break;
                    }
                    Ok(n) => {
                        read_buf.extend_from_slice(&tmp[..n]);
                        for frame in drain_frames(&mut read_buf) {
                            let reply = match frame {
                                Frame::Command(cmd) => {
                                    info!("socket: client {} sent {:?}", client_id, cmd);
                                    execute(&service, cmd).await
                                }
                                Frame::Malformed(reason) => {
                                    warn!("socket: client {} sent a bad frame: {}", client_id, reason);
                                    Some(Broadcast::Error { message: format!("Bad request: {reason}") })
                                }
                            };
                            if let Some(reply) = reply {
                                if !send(&mut write_half, reply).await {
                                    return;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        error!("socket: read error from client {}: {}", client_id, e);
                        break;
                    }
                }
            }

            changed = snapshot_rx.changed() => {
                if changed.is_err() {
                    debug!("socket: playback service gone");
                    break;
                }
                let snapshot = snapshot_rx.borrow_and_update().clone();
                for broadcast in state_broadcasts(snapshot, &mut last_error) {
                    if !send(&mut write_half, broadcast).await {
                        return;
                    }
                }
            }

            msg = log_rx.recv() => {
                match msg {
                    Ok(message) => {
                        if !send(&mut write_half, Broadcast::Log { message }).await {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("socket: client {} missed {} log lines", client_id, n);
                    }
                    Err(_) => break,
                }
            }
        }
    }
}

/// The new state, preceded by an `Error` when a fresh error shows up.
fn state_broadcasts(snapshot: PlaybackSnapshot, last_error: &mut Option<String>) -> Vec<Broadcast> {
    let mut out = Vec::with_capacity(2);
    if snapshot.error != *last_error {
        if let Some(message) = &snapshot.error {
            out.push(Broadcast::Error {
                message: message.clone(),
            });
        }
        last_error.clone_from(&snapshot.error);
    }
    out.push(Broadcast::State { snapshot });
    out
}

#[derive(Debug)]
enum Frame {
    Command(Command),
    Malformed(String),
}

/// Pull every complete frame off the front of `buf`.
fn drain_frames(buf: &mut Vec<u8>) -> Vec<Frame> {
    let mut frames = Vec::new();
    while buf.len() >= 4 {
        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if len > MAX_FRAME_LEN {
            frames.push(Frame::Malformed(format!("frame of {len} bytes")));
            buf.clear();
            break;
        }
        if buf.len() < 4 + len {
            break;
        }
        match Message::decode(buf) {
            Ok((Message::Command(cmd), consumed)) => {
                buf.drain(..consumed);
                frames.push(Frame::Command(cmd));
            }
            Ok((Message::Broadcast(_), consumed)) => {
                buf.drain(..consumed);
                frames.push(Frame::Malformed("clients cannot broadcast".to_string()));
            }
            Err(e) => {
                buf.drain(..4 + len);
                frames.push(Frame::Malformed(e.to_string()));
            }
        }
    }
    frames
}

/// Run one client command.  Returns a direct reply when the command has one;
/// state changes reach the client through the snapshot broadcast.
async fn execute(service: &PlaybackService, command: Command) -> Option<Broadcast> {
    match command {
        Command::Play => service.play().await,
        Command::Pause => service.pause().await,
        Command::PlayPause => service.play_pause().await,
        Command::SeekTo { position_ms } => service.seek_to(position_ms).await,
        Command::Next => service.seek_to_next().await,
        Command::Previous => service.seek_to_previous().await,
        Command::PlaySong { song_id } => service.play_song(song_id).await,
        Command::PlayQueue {
            song_ids,
            start_index,
        } => service.play_queue(song_ids, start_index).await,
        Command::AddToQueue { song_ids } => service.add_to_queue(song_ids).await,
        Command::PlayNext { song_ids } => service.play_next(song_ids).await,
        Command::RemoveFromQueue { index } => service.remove_from_queue(index).await,
        Command::SeekToQueueIndex { index } => service.seek_to_queue_index(index).await,
        Command::SetRepeatMode { mode } => service.set_repeat_mode(mode).await,
        Command::SetShuffle { enabled } => service.set_shuffle_enabled(enabled).await,
        Command::SetSpeed { speed } => service.set_playback_speed(speed).await,
        Command::ApplySettings { song_id, settings } => {
            service.apply_settings_now(song_id, settings).await
        }
        Command::PreviewSettings { song_id, settings } => {
            service.preview_settings(song_id, settings).await
        }
        Command::SavePlaybackState => {
            if !service.save_playback_state().await {
                return Some(Broadcast::Error {
                    message: "Nothing to save: no song is loaded".to_string(),
                });
            }
        }
        Command::Refresh { force } => service.refresh_playback_state(force).await,
        Command::DismissError => service.dismiss_error().await,
        Command::GetState => {
            return Some(Broadcast::State {
                snapshot: service.snapshot(),
            })
        }
    }
    None
}
