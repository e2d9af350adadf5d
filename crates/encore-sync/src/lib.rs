//! Playback state synchronization between a media engine and its observers.
//!
//! The media engine runs on its own threads, can die at any time and only
//! talks back through callbacks.  This crate keeps one coherent
//! [`PlaybackSnapshot`](encore_proto::snapshot::PlaybackSnapshot) of it,
//! persists the queue and a recovery pointer, and hands out a single
//! [`PlaybackService`] through which every client acts.

pub mod bridge;
pub mod collaborators;
pub mod engine;
pub mod error;
pub mod history;
pub mod persistence;
pub mod service;
pub mod settings;
pub mod supervisor;
pub mod sync;

pub use error::{EngineError, SyncError};
pub use service::{Collaborators, PlaybackService};
