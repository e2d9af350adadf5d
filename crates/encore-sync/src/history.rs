//! Listening statistics and recently-played logging.
//!
//! Watches published snapshots for song transitions.  All collaborator calls
//! run on a spawned task; failures are logged and dropped.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use encore_proto::snapshot::PlaybackSnapshot;
use encore_proto::song::{SongId, SongRef};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::collaborators::{ListeningStats, SessionController, SnapshotObserver, SongRepository};

#[derive(Default)]
struct ListenTracker {
    song: Option<SongRef>,
    /// Where `song` sat in `queue` when last published.
    index: Option<usize>,
    queue: Vec<SongId>,
    accumulated: Duration,
    playing_since: Option<Instant>,
}

impl ListenTracker {
    fn listened(&self, now: Instant) -> Duration {
        self.accumulated + self.playing_since.map_or(Duration::ZERO, |since| now - since)
    }

    /// Same item as before.  Moving to another copy of the same song in an
    /// unchanged queue is a transition; an edit that shifts the index is not.
    fn is_same_item(&self, snapshot: &PlaybackSnapshot, queue: &[SongId]) -> bool {
        if self.song.as_ref().map(|s| s.id) != snapshot.current_song_id() {
            return false;
        }
        self.index == snapshot.current_queue_index || self.queue != queue
    }
}

pub struct HistoryDispatcher {
    songs: Arc<dyn SongRepository>,
    session: Arc<dyn SessionController>,
    stats: Arc<dyn ListeningStats>,
    min_listen: Duration,
    tracker: Mutex<ListenTracker>,
}

impl HistoryDispatcher {
    pub fn new(
        songs: Arc<dyn SongRepository>,
        session: Arc<dyn SessionController>,
        stats: Arc<dyn ListeningStats>,
        min_listen: Duration,
    ) -> Self {
        Self {
            songs,
            session,
            stats,
            min_listen,
            tracker: Mutex::new(ListenTracker::default()),
        }
    }

    fn dispatch(&self, finished: Option<(SongRef, Duration)>, started: Option<SongRef>) {
        let songs = Arc::clone(&self.songs);
        let session = Arc::clone(&self.session);
        let stats = Arc::clone(&self.stats);
        let min_listen = self.min_listen;

        tokio::spawn(async move {
            let private = session.is_session_private().await;

            if let Some((song, listened)) = finished {
                if private {
                    debug!("history: private session, not counting song {}", song.id);
                } else if listened >= min_listen {
                    let ms = listened.as_millis() as i64;
                    if let Err(e) = stats.record_play_event(&song.artist, ms).await {
                        warn!("history: play event for '{}' not recorded: {:#}", song.artist, e);
                    }
                } else {
                    debug!("history: song {} heard for {:?}, below threshold", song.id, listened);
                }
            }

            if let Some(song) = started {
                if !private {
                    if let Err(e) = songs.log_play(song.id).await {
                        warn!("history: recently played entry for {} failed: {:#}", song.id, e);
                    }
                }
            }

            session.refresh_inactivity_timer().await;
        });
    }
}

impl SnapshotObserver for HistoryDispatcher {
    fn on_published(&self, _previous: &PlaybackSnapshot, current: &PlaybackSnapshot) {
        let now = Instant::now();
        let mut tracker = self.tracker.lock().unwrap_or_else(|e| e.into_inner());

        let queue = current.queue_song_ids();
        if tracker.is_same_item(current, &queue) {
            tracker.index = current.current_queue_index;
            tracker.queue = queue;
            match (tracker.playing_since, current.is_playing) {
                (Some(since), false) => {
                    tracker.accumulated += now - since;
                    tracker.playing_since = None;
                }
                (None, true) => tracker.playing_since = Some(now),
                _ => {}
            }
            return;
        }

        let listened = tracker.listened(now);
        let finished = tracker.song.take().map(|song| (song, listened));
        *tracker = ListenTracker {
            song: current.current_song.clone(),
            index: current.current_queue_index,
            queue,
            accumulated: Duration::ZERO,
            playing_since: current.is_playing.then_some(now),
        };
        drop(tracker);

        self.dispatch(finished, current.current_song.clone());
    }
}
