/// mpv-backed media engine.
///
/// Architecture:
///
/// ```text
///   MpvConnector::connect()
///         │
///         ├── MpvDriver            owns the mpv process, (re)attaches the IPC socket
///         │     ├── writer_task    ← MpvRequest via mpsc, serialised → socket
///         │     └── reader_task    ← JSON lines from socket
///         │                           ├── response (request_id) → matched oneshot
///         │                           └── event / property-change → event_pump
///         │
///         └── MpvEngine            MediaEngine impl
///               ├── PlayerProps    cache of observed properties
///               ├── item mirror    playlist entries as EngineItems
///               └── event_pump     MpvEvent → EngineEvent → listeners
/// ```
///
/// mpv does not keep our metadata, so the engine mirrors its playlist
/// locally and keeps the mirror in step with every playlist command it sends.
/// Clip windows become per-file `start`/`end` options (mpv >= 0.38 loadfile
/// syntax).
///
/// Platform notes:
/// - Unix:   Unix domain sockets
/// - Windows: Named pipes  \\.\pipe\<name>
use anyhow::Context;
use async_trait::async_trait;
use encore_proto::config::MpvConfig;
use encore_proto::snapshot::RepeatMode;
use encore_proto::song::ClipWindow;
use encore_sync::engine::{
    EngineConnector, EngineEvent, EngineItem, EngineListener, EngineStatus, ListenerId,
    MediaEngine, PlayIntentReason,
};
use encore_sync::error::{EngineError, EngineResult};
use rand::seq::SliceRandom;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, MutexGuard};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

#[cfg(unix)]
use tokio::net::UnixStream;

#[cfg(windows)]
use tokio::net::windows::named_pipe::ClientOptions;

// ── global request-id counter ─────────────────────────────────────────────────

static NEXT_REQ_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

const IPC_TIMEOUT: tokio::time::Duration = tokio::time::Duration::from_secs(5);

// ── observation property IDs ──────────────────────────────────────────────────

/// Fixed observe_property IDs.  We match on these in property-change events.
pub const OBS_PAUSE: u64 = 1;
pub const OBS_IDLE: u64 = 2;
pub const OBS_BUFFERING: u64 = 3;
pub const OBS_PLAYLIST_POS: u64 = 4;
pub const OBS_PLAYLIST_COUNT: u64 = 5;
pub const OBS_DURATION: u64 = 6;
pub const OBS_LOOP_FILE: u64 = 7;
pub const OBS_LOOP_PLAYLIST: u64 = 8;
pub const OBS_SPEED: u64 = 9;
pub const OBS_PITCH: u64 = 10;

const OBSERVED: [(u64, &str); 10] = [
    (OBS_PAUSE, "pause"),
    (OBS_IDLE, "idle-active"),
    (OBS_BUFFERING, "paused-for-cache"),
    (OBS_PLAYLIST_POS, "playlist-pos"),
    (OBS_PLAYLIST_COUNT, "playlist-count"),
    (OBS_DURATION, "duration"),
    (OBS_LOOP_FILE, "loop-file"),
    (OBS_LOOP_PLAYLIST, "loop-playlist"),
    (OBS_SPEED, "speed"),
    (OBS_PITCH, "pitch"),
];

// ── internal channel types ────────────────────────────────────────────────────

type Reply = oneshot::Sender<EngineResult<Value>>;
type PendingMap = Arc<Mutex<HashMap<u64, Reply>>>;

struct PendingRequest {
    req_id: u64,
    payload: String, // serialised JSON line (already has '\n')
    reply: Reply,
}

/// An mpv event / property-change that arrived unsolicited (no request_id).
#[derive(Debug, Clone)]
pub struct MpvEvent {
    pub raw: Value,
}

impl MpvEvent {
    /// Returns `Some((obs_id, data))` if this is a property-change event.
    pub fn as_property_change(&self) -> Option<(u64, &Value)> {
        if self.raw.get("event")?.as_str()? == "property-change" {
            let id = self.raw.get("id")?.as_u64()?;
            let data = self.raw.get("data").unwrap_or(&Value::Null);
            Some((id, data))
        } else {
            None
        }
    }

    /// Returns the event name, e.g. "end-file", "start-file", "file-loaded".
    pub fn event_name(&self) -> Option<&str> {
        self.raw.get("event")?.as_str()
    }

    fn str_field(&self, key: &str) -> Option<&str> {
        self.raw.get(key)?.as_str()
    }
}

// ── public handle ─────────────────────────────────────────────────────────────

/// Cloneable handle to the mpv writer task.  Use `send()` to fire a command
/// and await the response.
#[derive(Clone)]
pub struct MpvHandle {
    tx: mpsc::Sender<PendingRequest>,
}

impl MpvHandle {
    pub async fn send(&self, command: Value) -> EngineResult<Value> {
        let req_id = NEXT_REQ_ID.fetch_add(1, Ordering::Relaxed);
        let msg = json!({ "command": command, "request_id": req_id });
        let mut raw = serde_json::to_string(&msg).map_err(|e| EngineError::Ipc(e.to_string()))?;
        raw.push('\n');

        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(PendingRequest {
                req_id,
                payload: raw,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::Disconnected)?;

        match tokio::time::timeout(IPC_TIMEOUT, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(EngineError::Disconnected),
            Err(_) => {
                warn!("mpv: IPC timeout for req={}", req_id);
                Err(EngineError::Timeout)
            }
        }
    }

    /// `get_property`, with "property unavailable" (idle player) as `None`.
    pub async fn get_optional(&self, name: &str) -> EngineResult<Option<Value>> {
        match self.send(json!(["get_property", name])).await {
            Ok(resp) => Ok(Some(resp["data"].clone()).filter(|v| !v.is_null())),
            Err(EngineError::Rejected(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn set_property(&self, name: &str, value: Value) -> EngineResult<()> {
        self.send(json!(["set_property", name, value])).await?;
        Ok(())
    }

    pub async fn seek_absolute(&self, position_ms: i64) -> EngineResult<()> {
        self.send(json!(["seek", ms_to_secs(position_ms), "absolute"]))
            .await?;
        Ok(())
    }

    /// Register observe_property for everything `PlayerProps` tracks.
    /// Must be called after every fresh connection.  mpv answers each
    /// registration with the current value, which seeds the cache.
    pub async fn observe_all_properties(&self) {
        for (id, name) in &OBSERVED {
            match self.send(json!(["observe_property", id, name])).await {
                Ok(_) => debug!("mpv: observe_property id={} name={}", id, name),
                Err(e) => warn!("mpv: observe_property {} failed: {}", name, e),
            }
        }
    }
}

// ── driver ────────────────────────────────────────────────────────────────────

/// Owns the mpv child process and manages (re)connection.
pub struct MpvDriver {
    socket_name: String,
    binary: Option<PathBuf>,
    process: Option<tokio::process::Child>,
    pub last_volume: f32,
}

impl MpvDriver {
    pub fn new(config: &MpvConfig) -> Self {
        Self {
            socket_name: encore_proto::platform::mpv_socket_name(),
            binary: config.binary.clone(),
            process: None,
            last_volume: config.default_volume,
        }
    }

    /// Kill the process if we started it.
    pub async fn kill(&mut self) {
        if let Some(mut p) = self.process.take() {
            let _ = p.kill().await;
        }
    }

    async fn spawn_process(&mut self) -> anyhow::Result<()> {
        self.kill().await;

        info!("mpv: spawning new process");
        let mpv_binary = encore_proto::platform::find_mpv_binary(self.binary.as_deref())
            .ok_or_else(|| anyhow::anyhow!("mpv binary not found"))?;

        let vol_arg = format!(
            "--volume={}",
            (self.last_volume * 100.0).clamp(0.0, 100.0).round() as i64
        );
        let child = tokio::process::Command::new(&mpv_binary)
            .arg("--no-video")
            .arg("--idle=yes")
            .arg("--audio-display=no")
            .arg(encore_proto::platform::mpv_socket_arg())
            .arg("--quiet")
            .arg(vol_arg)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()
            .with_context(|| format!("failed to start {}", mpv_binary.display()))?;
        self.process = Some(child);
        Ok(())
    }

    #[cfg(unix)]
    pub async fn spawn_and_connect(
        &mut self,
        event_tx: mpsc::Sender<MpvEvent>,
    ) -> anyhow::Result<MpvHandle> {
        let socket_path = PathBuf::from(&self.socket_name);
        let _ = tokio::fs::remove_file(&socket_path).await;

        self.spawn_process().await?;

        // Wait for socket to appear
        for _ in 0..50 {
            tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
            if socket_path.exists() {
                break;
            }
        }
        if !socket_path.exists() {
            anyhow::bail!("mpv IPC socket did not appear");
        }
        tokio::time::sleep(tokio::time::Duration::from_millis(200)).await;

        let stream = UnixStream::connect(&socket_path).await?;
        info!("mpv: connected to IPC socket");
        Ok(start_io_tasks(stream, event_tx))
    }

    /// Attach to an mpv left running by an earlier daemon, without spawning.
    #[cfg(unix)]
    pub async fn try_reconnect(&mut self, event_tx: mpsc::Sender<MpvEvent>) -> Option<MpvHandle> {
        let socket_path = PathBuf::from(&self.socket_name);
        if !socket_path.exists() {
            return None;
        }
        match UnixStream::connect(&socket_path).await {
            Ok(stream) => {
                info!("mpv: attached to existing IPC socket");
                Some(start_io_tasks(stream, event_tx))
            }
            Err(e) => {
                debug!("mpv: stale IPC socket: {}", e);
                None
            }
        }
    }

    #[cfg(windows)]
    pub async fn spawn_and_connect(
        &mut self,
        event_tx: mpsc::Sender<MpvEvent>,
    ) -> anyhow::Result<MpvHandle> {
        self.spawn_process().await?;

        let pipe_path = format!(r"\\.\pipe\{}", self.socket_name);
        for _ in 0..50 {
            tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
            if let Ok(client) = ClientOptions::new().open(&pipe_path) {
                info!("mpv: connected to named pipe");
                return Ok(start_io_tasks(client, event_tx));
            }
        }
        anyhow::bail!("mpv named pipe did not appear")
    }

    #[cfg(windows)]
    pub async fn try_reconnect(&mut self, event_tx: mpsc::Sender<MpvEvent>) -> Option<MpvHandle> {
        let pipe_path = format!(r"\\.\pipe\{}", self.socket_name);
        match ClientOptions::new().open(&pipe_path) {
            Ok(client) => {
                info!("mpv: attached to existing named pipe");
                Some(start_io_tasks(client, event_tx))
            }
            Err(e) => {
                debug!("mpv: no named pipe to attach to: {}", e);
                None
            }
        }
    }
}

fn start_io_tasks<S>(stream: S, event_tx: mpsc::Sender<MpvEvent>) -> MpvHandle
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let reader = BufReader::new(read_half);

    // req_id → reply channel.  Writer inserts, reader resolves.
    let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
    let (cmd_tx, cmd_rx) = mpsc::channel::<PendingRequest>(64);

    tokio::spawn(writer_task(write_half, cmd_rx, pending.clone()));
    tokio::spawn(reader_task(reader, pending, event_tx));

    MpvHandle { tx: cmd_tx }
}

// ── reader task ───────────────────────────────────────────────────────────────

async fn fail_pending(pending: &PendingMap, error: EngineError) {
    let mut map = pending.lock().await;
    for (_, tx) in map.drain() {
        let _ = tx.send(Err(error.clone()));
    }
}

/// Ends when the socket closes.  Dropping `event_tx` then tells the event
/// pump that this connection is dead.
async fn reader_task<R>(mut reader: BufReader<R>, pending: PendingMap, event_tx: mpsc::Sender<MpvEvent>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                debug!("mpv reader: connection closed");
                fail_pending(&pending, EngineError::Disconnected).await;
                break;
            }
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let val: Value = match serde_json::from_str(trimmed) {
                    Ok(v) => v,
                    Err(e) => {
                        debug!("mpv reader: invalid json '{}': {}", trimmed, e);
                        continue;
                    }
                };

                if let Some(req_id) = val.get("request_id").and_then(|v| v.as_u64()) {
                    let mut map = pending.lock().await;
                    if let Some(tx) = map.remove(&req_id) {
                        let _ = tx.send(reply_result(val));
                    } else {
                        debug!("mpv reader: response for unknown req={}", req_id);
                    }
                } else {
                    debug!("mpv reader: event {}", trimmed);
                    if event_tx.send(MpvEvent { raw: val }).await.is_err() {
                        debug!("mpv reader: event pump gone");
                        break;
                    }
                }
            }
            Err(e) => {
                warn!("mpv reader: read error: {}", e);
                fail_pending(&pending, EngineError::Ipc(e.to_string())).await;
                break;
            }
        }
    }
}

fn reply_result(val: Value) -> EngineResult<Value> {
    match val["error"].as_str() {
        Some("success") => Ok(val),
        other => Err(EngineError::Rejected(
            other.unwrap_or("unknown error").to_string(),
        )),
    }
}

// ── writer task ───────────────────────────────────────────────────────────────

async fn writer_task<W>(mut writer: W, mut rx: mpsc::Receiver<PendingRequest>, pending: PendingMap)
where
    W: tokio::io::AsyncWrite + Unpin,
{
    while let Some(req) = rx.recv().await {
        // Register before writing so the reader can always match the reply
        pending.lock().await.insert(req.req_id, req.reply);
        debug!("mpv writer: send req={} payload={}", req.req_id, req.payload.trim());
        if let Err(e) = writer.write_all(req.payload.as_bytes()).await {
            warn!("mpv writer: write error: {}", e);
            if let Some(tx) = pending.lock().await.remove(&req.req_id) {
                let _ = tx.send(Err(EngineError::Ipc(e.to_string())));
            }
            break;
        }
    }
    debug!("mpv writer: task exiting");
}

// ── property cache ────────────────────────────────────────────────────────────

/// Last known value of every observed property.
#[derive(Debug, Clone, PartialEq)]
struct PlayerProps {
    pause: bool,
    idle: bool,
    buffering: bool,
    playlist_pos: Option<usize>,
    duration_ms: i64,
    loop_file: bool,
    loop_playlist: bool,
    speed: f32,
    pitch: f32,
    error: Option<String>,
}

impl Default for PlayerProps {
    fn default() -> Self {
        Self {
            pause: false,
            idle: true,
            buffering: false,
            playlist_pos: None,
            duration_ms: 0,
            loop_file: false,
            loop_playlist: false,
            speed: 1.0,
            pitch: 1.0,
            error: None,
        }
    }
}

impl PlayerProps {
    fn is_playing(&self) -> bool {
        !self.pause && !self.idle && !self.buffering && self.playlist_pos.is_some()
    }

    /// Playing, or about to once buffering ends.
    fn wants_play(&self) -> bool {
        !self.pause && !self.idle
    }

    fn repeat_mode(&self) -> RepeatMode {
        if self.loop_file {
            RepeatMode::One
        } else if self.loop_playlist {
            RepeatMode::All
        } else {
            RepeatMode::Off
        }
    }

    /// Fold one mpv event into the cache and say what changed.
    fn apply(&mut self, event: &MpvEvent) -> Vec<EngineEvent> {
        let was_playing = self.is_playing();
        let was_idle = self.idle;
        let was_repeat = self.repeat_mode();
        let mut out = Vec::new();

        if let Some((id, data)) = event.as_property_change() {
            match id {
                OBS_PAUSE => {
                    let pause = data.as_bool().unwrap_or(false);
                    if pause != self.pause {
                        self.pause = pause;
                        out.push(EngineEvent::PlayIntentChanged {
                            play_when_ready: !pause,
                            reason: PlayIntentReason::UserRequest,
                        });
                    }
                }
                OBS_IDLE => self.idle = data.as_bool().unwrap_or(true),
                OBS_BUFFERING => {
                    let buffering = data.as_bool().unwrap_or(false);
                    if buffering != self.buffering {
                        self.buffering = buffering;
                        out.push(EngineEvent::BufferingChanged(buffering));
                    }
                }
                OBS_PLAYLIST_POS => {
                    let pos = data.as_i64().and_then(|p| usize::try_from(p).ok());
                    if pos != self.playlist_pos {
                        self.playlist_pos = pos;
                        out.push(EngineEvent::ItemTransition { index: pos });
                    }
                }
                OBS_PLAYLIST_COUNT => out.push(EngineEvent::TimelineChanged),
                OBS_DURATION => {
                    let duration_ms = secs_to_ms(data);
                    if duration_ms != self.duration_ms {
                        self.duration_ms = duration_ms;
                        out.push(EngineEvent::TimelineChanged);
                    }
                }
                OBS_LOOP_FILE => self.loop_file = loop_enabled(data),
                OBS_LOOP_PLAYLIST => self.loop_playlist = loop_enabled(data),
                OBS_SPEED | OBS_PITCH => {
                    let value = data.as_f64().unwrap_or(1.0) as f32;
                    let slot = if id == OBS_SPEED {
                        &mut self.speed
                    } else {
                        &mut self.pitch
                    };
                    if *slot != value {
                        *slot = value;
                        out.push(EngineEvent::PlaybackParametersChanged {
                            speed: self.speed,
                            pitch: self.pitch,
                        });
                    }
                }
                _ => {}
            }
        } else {
            match event.event_name() {
                Some("playback-restart") => out.push(EngineEvent::PositionDiscontinuity),
                Some("end-file") if event.str_field("reason") == Some("error") => {
                    let message = event
                        .str_field("file_error")
                        .map(|e| format!("Playback failed: {e}"))
                        .unwrap_or_else(|| "Playback failed".to_string());
                    self.error = Some(message);
                    out.push(EngineEvent::ErrorChanged(self.error.clone()));
                }
                Some("file-loaded") if self.error.is_some() => {
                    self.error = None;
                    out.push(EngineEvent::ErrorChanged(None));
                }
                _ => {}
            }
        }

        let repeat = self.repeat_mode();
        if repeat != was_repeat {
            out.push(EngineEvent::RepeatModeChanged(repeat));
        }
        let playing = self.is_playing();
        if playing != was_playing {
            out.push(EngineEvent::IsPlayingChanged(playing));
        }
        if self.idle && !was_idle && was_playing {
            out.push(EngineEvent::PlayIntentChanged {
                play_when_ready: false,
                reason: PlayIntentReason::EndOfMedia,
            });
        }
        out
    }
}

fn secs_to_ms(data: &Value) -> i64 {
    data.as_f64()
        .map(|secs| (secs * 1000.0).round() as i64)
        .unwrap_or(0)
}

fn ms_to_secs(ms: i64) -> f64 {
    ms as f64 / 1000.0
}

/// `loop-file` / `loop-playlist` come back as "inf", "no", "force", a count
/// or a bool depending on how they were set.
fn loop_enabled(data: &Value) -> bool {
    match data {
        Value::Bool(b) => *b,
        Value::String(s) => s != "no",
        Value::Number(n) => n.as_i64().is_some_and(|n| n > 0),
        _ => false,
    }
}

fn clip_options(clip: Option<ClipWindow>) -> String {
    let Some(clip) = clip else {
        return String::new();
    };
    let mut options = format!("start={:.3}", ms_to_secs(clip.start_ms));
    if let Some(end_ms) = clip.end_ms {
        options.push_str(&format!(",end={:.3}", ms_to_secs(end_ms)));
    }
    options
}

/// `None` appends.
fn loadfile_command(item: &EngineItem, insert_at: Option<usize>) -> Value {
    let options = clip_options(item.clip);
    match insert_at {
        Some(index) => json!(["loadfile", item.uri, "insert-at", index, options]),
        None => json!(["loadfile", item.uri, "append", -1, options]),
    }
}

/// `playlist-move` steps that turn the order `0..target.len()` into `target`.
///
/// Each step `(from, to)` takes the entry at `from` and puts it at `to`;
/// `from` is always greater than `to`, which is how mpv reads the command.
fn move_plan(target: &[usize]) -> Vec<(usize, usize)> {
    let mut working: Vec<usize> = (0..target.len()).collect();
    let mut plan = Vec::new();
    for (pos, wanted) in target.iter().enumerate() {
        let Some(found) = working[pos..].iter().position(|i| i == wanted) else {
            continue;
        };
        if found > 0 {
            let entry = working.remove(pos + found);
            working.insert(pos, entry);
            plan.push((pos + found, pos));
        }
    }
    plan
}

fn lock<T>(mutex: &std::sync::Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

// ── engine ────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct Shared {
    alive: AtomicBool,
    shuffle: AtomicBool,
    props: std::sync::Mutex<PlayerProps>,
    items: std::sync::Mutex<Vec<EngineItem>>,
    listeners: std::sync::Mutex<Vec<(ListenerId, Arc<dyn EngineListener>)>>,
    /// Applied once the next file has loaded.
    pending_seek_ms: std::sync::Mutex<Option<i64>>,
}

impl Shared {
    fn notify(&self, event: EngineEvent) {
        let listeners: Vec<_> = lock(&self.listeners)
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener.on_event(event.clone());
        }
    }
}

async fn event_pump(handle: MpvHandle, shared: Arc<Shared>, mut events: mpsc::Receiver<MpvEvent>) {
    while let Some(event) = events.recv().await {
        if event.event_name() == Some("file-loaded") {
            if let Some(position_ms) = lock(&shared.pending_seek_ms).take() {
                let handle = handle.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle.seek_absolute(position_ms).await {
                        warn!("mpv: start position seek failed: {}", e);
                    }
                });
            }
        }
        let changes = lock(&shared.props).apply(&event);
        for change in changes {
            shared.notify(change);
        }
    }
    shared.alive.store(false, Ordering::SeqCst);
    info!("mpv: event stream closed, engine handle is dead");
}

pub struct MpvEngine {
    handle: MpvHandle,
    shared: Arc<Shared>,
}

impl MpvEngine {
    /// Start the event pump and subscribe to the properties we mirror.
    async fn start(handle: MpvHandle, events: mpsc::Receiver<MpvEvent>) -> Arc<Self> {
        let shared = Arc::new(Shared::default());
        shared.alive.store(true, Ordering::SeqCst);
        tokio::spawn(event_pump(handle.clone(), Arc::clone(&shared), events));
        handle.observe_all_properties().await;
        Arc::new(Self { handle, shared })
    }

    fn ensure_alive(&self) -> EngineResult<()> {
        if self.is_alive() {
            Ok(())
        } else {
            Err(EngineError::Disconnected)
        }
    }

    fn item_count(&self) -> usize {
        lock(&self.shared.items).len()
    }

    fn check_index(&self, index: usize, len: usize) -> EngineResult<()> {
        if index < len {
            Ok(())
        } else {
            Err(EngineError::Rejected(format!(
                "index {index} out of range for {len} items"
            )))
        }
    }

    async fn play_index(&self, index: usize, position_ms: Option<i64>) -> EngineResult<()> {
        *lock(&self.shared.pending_seek_ms) = position_ms;
        self.handle
            .send(json!(["playlist-play-index", index]))
            .await?;
        Ok(())
    }

    /// Clear the playlist left behind by a previous owner of this mpv.
    async fn reset(&self) -> EngineResult<()> {
        self.handle.send(json!(["stop"])).await?;
        lock(&self.shared.items).clear();
        Ok(())
    }
}

#[async_trait]
impl MediaEngine for MpvEngine {
    fn is_alive(&self) -> bool {
        self.shared.alive.load(Ordering::SeqCst)
    }

    async fn status(&self) -> EngineResult<EngineStatus> {
        self.ensure_alive()?;
        let position_ms = match self.handle.get_optional("time-pos").await? {
            Some(secs) => secs_to_ms(&secs),
            None => 0,
        };
        let props = lock(&self.shared.props).clone();
        Ok(EngineStatus {
            is_playing: props.is_playing(),
            is_buffering: props.buffering,
            position_ms,
            duration_ms: props.duration_ms,
            current_index: props.playlist_pos,
            repeat_mode: props.repeat_mode(),
            shuffle_enabled: self.shared.shuffle.load(Ordering::SeqCst),
            speed: props.speed,
            pitch: props.pitch,
            error: props.error,
        })
    }

    async fn items(&self) -> EngineResult<Vec<EngineItem>> {
        self.ensure_alive()?;
        Ok(lock(&self.shared.items).clone())
    }

    async fn play(&self) -> EngineResult<()> {
        self.ensure_alive()?;
        self.handle.set_property("pause", json!(false)).await
    }

    async fn pause(&self) -> EngineResult<()> {
        self.ensure_alive()?;
        self.handle.set_property("pause", json!(true)).await
    }

    async fn seek_to(&self, position_ms: i64) -> EngineResult<()> {
        self.ensure_alive()?;
        self.handle.seek_absolute(position_ms).await
    }

    async fn seek_to_item(&self, index: usize, position_ms: Option<i64>) -> EngineResult<()> {
        self.ensure_alive()?;
        self.check_index(index, self.item_count())?;
        self.play_index(index, position_ms).await
    }

    async fn next(&self) -> EngineResult<()> {
        self.ensure_alive()?;
        self.handle.send(json!(["playlist-next"])).await?;
        Ok(())
    }

    async fn previous(&self) -> EngineResult<()> {
        self.ensure_alive()?;
        self.handle.send(json!(["playlist-prev"])).await?;
        Ok(())
    }

    async fn replace_items(
        &self,
        items: Vec<EngineItem>,
        start_index: usize,
        start_position_ms: Option<i64>,
    ) -> EngineResult<()> {
        self.ensure_alive()?;
        // mpv starts whatever it loads unless paused
        let keep_playing = lock(&self.shared.props).wants_play();
        self.reset().await?;
        if !keep_playing {
            self.handle.set_property("pause", json!(true)).await?;
        }
        let count = items.len();
        for item in items {
            self.handle.send(loadfile_command(&item, None)).await?;
            lock(&self.shared.items).push(item);
        }
        if count > 0 {
            self.play_index(start_index.min(count - 1), start_position_ms)
                .await?;
        }
        debug!("mpv: playlist replaced with {} items", count);
        Ok(())
    }

    async fn insert_items(&self, index: usize, items: Vec<EngineItem>) -> EngineResult<()> {
        self.ensure_alive()?;
        let len = self.item_count();
        if index > len {
            return Err(EngineError::Rejected(format!(
                "insert index {index} beyond {len} items"
            )));
        }
        for (offset, item) in items.into_iter().enumerate() {
            let at = index + offset;
            let append = at == self.item_count();
            self.handle
                .send(loadfile_command(&item, (!append).then_some(at)))
                .await?;
            lock(&self.shared.items).insert(at, item);
        }
        Ok(())
    }

    async fn remove_item(&self, index: usize) -> EngineResult<()> {
        self.ensure_alive()?;
        self.check_index(index, self.item_count())?;
        self.handle.send(json!(["playlist-remove", index])).await?;
        let mut items = lock(&self.shared.items);
        if index < items.len() {
            items.remove(index);
        }
        Ok(())
    }

    async fn set_repeat_mode(&self, mode: RepeatMode) -> EngineResult<()> {
        self.ensure_alive()?;
        let (loop_file, loop_playlist) = match mode {
            RepeatMode::Off => ("no", "no"),
            RepeatMode::One => ("inf", "no"),
            RepeatMode::All => ("no", "inf"),
        };
        self.handle.set_property("loop-file", json!(loop_file)).await?;
        self.handle
            .set_property("loop-playlist", json!(loop_playlist))
            .await
    }

    /// Enabling shuffles everything after the current entry in place;
    /// disabling keeps the order as it now is.
    async fn set_shuffle_enabled(&self, enabled: bool) -> EngineResult<()> {
        self.ensure_alive()?;
        if enabled {
            let len = self.item_count();
            let from = lock(&self.shared.props)
                .playlist_pos
                .map_or(0, |pos| pos + 1)
                .min(len);
            let mut order: Vec<usize> = (0..len).collect();
            order[from..].shuffle(&mut rand::thread_rng());
            for (src, dst) in move_plan(&order) {
                self.handle.send(json!(["playlist-move", src, dst])).await?;
                let mut items = lock(&self.shared.items);
                if src < items.len() {
                    let entry = items.remove(src);
                    items.insert(dst, entry);
                }
            }
        }
        let was = self.shared.shuffle.swap(enabled, Ordering::SeqCst);
        if was != enabled {
            self.shared.notify(EngineEvent::ShuffleChanged(enabled));
        }
        if enabled {
            self.shared.notify(EngineEvent::TimelineChanged);
        }
        Ok(())
    }

    async fn set_playback_parameters(&self, speed: f32, pitch: f32) -> EngineResult<()> {
        self.ensure_alive()?;
        self.handle.set_property("speed", json!(speed)).await?;
        self.handle.set_property("pitch", json!(pitch)).await
    }

    fn add_listener(&self, listener: Arc<dyn EngineListener>) -> ListenerId {
        let id = ListenerId(NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed));
        lock(&self.shared.listeners).push((id, listener));
        id
    }

    fn remove_listener(&self, id: ListenerId) {
        lock(&self.shared.listeners).retain(|(existing, _)| *existing != id);
    }

    /// Delivered to mpv scripts as `script-message <action> <json>`.
    async fn send_command(&self, action: &str, payload: Value) -> EngineResult<()> {
        self.ensure_alive()?;
        self.handle
            .send(json!(["script-message", action, payload.to_string()]))
            .await?;
        Ok(())
    }
}

// ── connector ─────────────────────────────────────────────────────────────────

/// Hands out the live engine, attaching to or starting mpv when there is none.
pub struct MpvConnector {
    driver: Mutex<MpvDriver>,
    current: Mutex<Option<Arc<MpvEngine>>>,
}

impl MpvConnector {
    pub fn new(config: &MpvConfig) -> Self {
        Self {
            driver: Mutex::new(MpvDriver::new(config)),
            current: Mutex::new(None),
        }
    }

    /// Stop the mpv process this daemon started, if any.
    pub async fn shutdown(&self) {
        if let Some(engine) = self.current.lock().await.take() {
            if engine.is_alive() {
                let _ = engine.handle.send(json!(["quit"])).await;
            }
        }
        self.driver.lock().await.kill().await;
    }
}

#[async_trait]
impl EngineConnector for MpvConnector {
    async fn connect(&self) -> anyhow::Result<Arc<dyn MediaEngine>> {
        let mut current = self.current.lock().await;
        if let Some(engine) = current.as_ref().filter(|e| e.is_alive()) {
            debug!("mpv: reusing live engine");
            let engine: Arc<dyn MediaEngine> = engine.clone();
            return Ok(engine);
        }

        let mut driver = self.driver.lock().await;
        let (event_tx, event_rx) = mpsc::channel(256);
        let (handle, inherited) = match driver.try_reconnect(event_tx.clone()).await {
            Some(handle) => (handle, true),
            None => (driver.spawn_and_connect(event_tx).await?, false),
        };
        let engine = MpvEngine::start(handle, event_rx).await;
        if inherited {
            // Our item mirror starts empty, so the inherited playlist must go.
            engine
                .reset()
                .await
                .context("failed to reset inherited mpv playlist")?;
        }
        *current = Some(Arc::clone(&engine));
        let engine: Arc<dyn MediaEngine> = engine;
        Ok(engine)
    }
}
