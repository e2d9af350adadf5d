//! Connection supervisor: the only owner of the live engine handle.
//!
//! Connect attempts are serialized by an async mutex.  A caller arriving
//! while another attempt runs waits for it and then re-checks, so concurrent
//! `connect()` calls end up sharing one handle.

use std::sync::{Arc, Mutex, RwLock};

use encore_proto::snapshot::{ConnectionState, UpdateSource};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bridge::EventBridge;
use crate::engine::{EngineConnector, EngineListener, ListenerId, MediaEngine};
use crate::persistence::{QueuePersistence, RestoreOutcome};
use crate::sync::SyncCore;

struct Attached {
    engine: Arc<dyn MediaEngine>,
    listener: ListenerId,
}

/// Holder of the current engine handle, shared read-only with the sync core.
#[derive(Default)]
pub struct EngineSlot {
    inner: RwLock<Option<Attached>>,
}

impl EngineSlot {
    /// The stored handle, if its engine is still alive.
    pub fn current(&self) -> Option<Arc<dyn MediaEngine>> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner
            .as_ref()
            .filter(|a| a.engine.is_alive())
            .map(|a| Arc::clone(&a.engine))
    }

    fn is_stale(&self) -> bool {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.as_ref().is_some_and(|a| !a.engine.is_alive())
    }

    fn attach(&self, engine: Arc<dyn MediaEngine>, listener: ListenerId) {
        *self.inner.write().unwrap_or_else(|e| e.into_inner()) = Some(Attached { engine, listener });
    }

    fn take(&self) -> Option<Attached> {
        self.inner.write().unwrap_or_else(|e| e.into_inner()).take()
    }
}

pub struct ConnectionSupervisor {
    connector: Arc<dyn EngineConnector>,
    slot: Arc<EngineSlot>,
    bridge: Arc<EventBridge>,
    core: Arc<SyncCore>,
    persistence: Arc<QueuePersistence>,
    state_tx: watch::Sender<ConnectionState>,
    attempt: tokio::sync::Mutex<()>,
    cancel: Mutex<CancellationToken>,
}

impl ConnectionSupervisor {
    pub fn new(
        connector: Arc<dyn EngineConnector>,
        slot: Arc<EngineSlot>,
        bridge: Arc<EventBridge>,
        core: Arc<SyncCore>,
        persistence: Arc<QueuePersistence>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            connector,
            slot,
            bridge,
            core,
            persistence,
            state_tx,
            attempt: tokio::sync::Mutex::new(()),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn current(&self) -> Option<Arc<dyn MediaEngine>> {
        self.slot.current()
    }

    /// Make sure a live engine is attached, returning it.
    ///
    /// Failures leave the supervisor `Disconnected` with the message recorded
    /// in the snapshot.  There is no retry.
    pub async fn connect(&self) -> Option<Arc<dyn MediaEngine>> {
        if let Some(engine) = self.live_connected() {
            return Some(engine);
        }

        let _attempt = self.attempt.lock().await;
        if let Some(engine) = self.live_connected() {
            debug!("supervisor: joined a connect that already finished");
            return Some(engine);
        }

        let token = {
            let mut cancel = self.cancel.lock().unwrap_or_else(|e| e.into_inner());
            *cancel = CancellationToken::new();
            cancel.clone()
        };

        self.release();
        self.set_state(ConnectionState::Connecting).await;
        info!("supervisor: connecting to media engine");

        let result = tokio::select! {
            _ = token.cancelled() => None,
            result = self.connector.connect() => Some(result),
        };
        let engine = match result {
            None => {
                info!("supervisor: connect cancelled");
                self.set_state(ConnectionState::Disconnected).await;
                return None;
            }
            Some(Err(e)) => {
                warn!("supervisor: connect failed: {:#}", e);
                self.set_state(ConnectionState::Disconnected).await;
                self.core
                    .record_error(format!("Could not connect to the media engine: {e:#}"))
                    .await;
                return None;
            }
            Some(Ok(engine)) => engine,
        };
        if token.is_cancelled() {
            info!("supervisor: connect cancelled after the engine answered");
            self.set_state(ConnectionState::Disconnected).await;
            return None;
        }

        let bridge: Arc<dyn EngineListener> = self.bridge.clone();
        let listener = engine.add_listener(bridge);
        self.slot.attach(Arc::clone(&engine), listener);
        self.set_state(ConnectionState::Connected).await;
        info!("supervisor: connected");

        let queue_empty = self
            .core
            .refresh(UpdateSource::Connected)
            .await
            .is_some_and(|r| r.current.queue.is_empty());
        if queue_empty && !token.is_cancelled() {
            match self.persistence.restore(engine.as_ref(), &token).await {
                RestoreOutcome::Restored {
                    index,
                    position_ms,
                    songs,
                } => {
                    info!(
                        "supervisor: restored {} songs at index {} ({:?} ms)",
                        songs, index, position_ms
                    );
                    self.core.refresh(UpdateSource::Restore).await;
                }
                RestoreOutcome::NothingSaved => debug!("supervisor: nothing to restore"),
                RestoreOutcome::Cancelled => {
                    info!("supervisor: restore abandoned, disconnected meanwhile");
                    return None;
                }
                RestoreOutcome::Failed(message) => {
                    warn!("supervisor: restore failed: {}", message);
                    self.core.record_error(message).await;
                }
            }
        }

        Some(engine)
    }

    /// Cancel any attempt in flight and drop the handle.  Always safe.
    pub async fn disconnect(&self) {
        self.cancel
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .cancel();
        if self.release() {
            info!("supervisor: disconnected");
        }
        self.set_state(ConnectionState::Disconnected).await;
    }

    /// Heartbeat check.  Returns `true` when a dead handle was dropped.
    pub async fn check_liveness(&self) -> bool {
        if !self.slot.is_stale() {
            return false;
        }
        warn!("supervisor: media engine handle is no longer alive");
        self.release();
        self.set_state(ConnectionState::Disconnected).await;
        true
    }

    fn live_connected(&self) -> Option<Arc<dyn MediaEngine>> {
        if self.state() != ConnectionState::Connected {
            return None;
        }
        self.slot.current()
    }

    fn release(&self) -> bool {
        match self.slot.take() {
            Some(attached) => {
                attached.engine.remove_listener(attached.listener);
                true
            }
            None => false,
        }
    }

    async fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
        self.core.set_connection(state).await;
    }
}
