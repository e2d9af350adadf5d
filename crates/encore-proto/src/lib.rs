//! Shared types for the encore playback engine and its clients.
//!
//! Everything here is plain data: the published [`snapshot::PlaybackSnapshot`],
//! song and settings records, the persisted recovery records, the client wire
//! protocol and the on-disk configuration.

pub mod config;
pub mod platform;
pub mod protocol;
pub mod snapshot;
pub mod song;
