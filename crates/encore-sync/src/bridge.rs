//! The one listener registered with the media engine.
//!
//! ```text
//!  engine thread ──► on_event ──► flag bookkeeping (std Mutex)
//!                             └─► RefreshRequest ──► refresh loop (service)
//! ```
//!
//! Nothing here touches the engine or does I/O; callbacks return immediately.

use std::sync::Mutex;

use encore_proto::snapshot::UpdateSource;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::engine::{EngineEvent, EngineListener, PlayIntentReason};

/// Why playback was paused by something other than the user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PauseFlags {
    pub focus_loss: bool,
    pub noisy_route: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshRequest {
    pub source: UpdateSource,
}

pub struct EventBridge {
    flags: Mutex<PauseFlags>,
    refresh_tx: mpsc::UnboundedSender<RefreshRequest>,
}

impl EventBridge {
    pub fn new(refresh_tx: mpsc::UnboundedSender<RefreshRequest>) -> Self {
        Self {
            flags: Mutex::new(PauseFlags::default()),
            refresh_tx,
        }
    }

    pub fn flags(&self) -> PauseFlags {
        *self.flags.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Explicit user actions forget why playback last stopped.
    pub fn clear_pause_flags(&self) {
        *self.flags.lock().unwrap_or_else(|e| e.into_inner()) = PauseFlags::default();
    }

    pub fn request_refresh(&self, source: UpdateSource) {
        // The loop is gone only during shutdown.
        if self.refresh_tx.send(RefreshRequest { source }).is_err() {
            trace!("bridge: refresh loop closed, dropping {:?}", source);
        }
    }

    fn update_flags(&self, event: &EngineEvent) {
        let mut flags = self.flags.lock().unwrap_or_else(|e| e.into_inner());
        match event {
            EngineEvent::IsPlayingChanged(true) => *flags = PauseFlags::default(),
            EngineEvent::PlayIntentChanged { reason, .. } => match reason {
                PlayIntentReason::UserRequest | PlayIntentReason::Remote => {
                    *flags = PauseFlags::default();
                }
                PlayIntentReason::AudioFocusLoss => {
                    *flags = PauseFlags {
                        focus_loss: true,
                        noisy_route: false,
                    };
                }
                PlayIntentReason::AudioBecomingNoisy => {
                    *flags = PauseFlags {
                        focus_loss: false,
                        noisy_route: true,
                    };
                }
                PlayIntentReason::EndOfMedia => {}
            },
            _ => {}
        }
    }
}

impl EngineListener for EventBridge {
    fn on_event(&self, event: EngineEvent) {
        debug!("bridge: {:?}", event);
        self.update_flags(&event);
        self.request_refresh(event.source());
    }
}
