mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{eventually, harness, item, settle, wait_for, FakeEngine, HarnessBuilder};
use encore_proto::snapshot::{PlaybackSnapshot, RepeatMode, UpdateSource};
use encore_sync::engine::{EngineEvent, PlayIntentReason};
use encore_sync::EngineError;

/// Collect what one subscriber observes until nothing changes for 300 ms.
fn record(h: &common::Harness) -> tokio::task::JoinHandle<Vec<PlaybackSnapshot>> {
    let mut rx = h.service.subscribe();
    let first = rx.borrow_and_update().clone();
    tokio::spawn(async move {
        let mut seen = vec![first];
        while tokio::time::timeout(Duration::from_millis(300), rx.changed())
            .await
            .is_ok_and(|changed| changed.is_ok())
        {
            seen.push(rx.borrow_and_update().clone());
        }
        seen
    })
}

#[tokio::test]
async fn test_position_stays_within_duration() {
    let h = HarnessBuilder::new()
        .engine(FakeEngine::loaded(&[1, 2], 0))
        .build();
    h.service.connect().await;

    for (position_ms, duration_ms) in [
        (-5_000, 180_000),
        (200_000, 180_000),
        (180_000, 180_000),
        (90_000, 180_000),
        (1_000_000, 1),
    ] {
        h.engine.with_state(|s| {
            s.position_ms = position_ms;
            s.duration_ms = duration_ms;
        });
        h.engine.emit(EngineEvent::PositionDiscontinuity);
        h.service.refresh_playback_state(false).await;

        let snapshot = h.service.snapshot();
        assert!(snapshot.position_ms >= 0);
        assert!(
            snapshot.position_ms <= snapshot.duration_ms,
            "{} > {}",
            snapshot.position_ms,
            snapshot.duration_ms
        );
    }
}

#[tokio::test]
async fn test_rev_strictly_increases() {
    let h = harness();
    h.service.connect().await;
    let recorder = record(&h);

    h.service.play_queue(vec![1, 2, 3], 0).await;
    h.service.seek_to(10_000).await;
    h.service.seek_to_next().await;
    h.service.set_repeat_mode(RepeatMode::All).await;
    h.service.set_shuffle_enabled(true).await;
    h.service.pause().await;

    let seen = recorder.await.unwrap();
    assert!(seen.len() >= 2);
    for pair in seen.windows(2) {
        assert!(pair[1].rev > pair[0].rev, "{} then {}", pair[0].rev, pair[1].rev);
    }
    let last = seen.last().unwrap();
    assert_eq!(last.repeat_mode, RepeatMode::All);
    assert!(last.shuffle_enabled);
    assert_eq!(last.current_song_id(), Some(2));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_edits_never_publish_out_of_bounds_index() {
    let h = harness();
    h.service.connect().await;
    h.service.play_queue((1..=10).collect(), 9).await;
    let recorder = record(&h);

    let mut tasks = Vec::new();
    for round in 0..8usize {
        let service = Arc::clone(&h.service);
        tasks.push(tokio::spawn(async move {
            match round % 4 {
                0 => service.remove_from_queue(9 - round).await,
                1 => service.seek_to_queue_index(round).await,
                2 => service.add_to_queue(vec![11 + round as i64]).await,
                _ => service.refresh_playback_state(true).await,
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    for snapshot in recorder.await.unwrap() {
        if let Some(index) = snapshot.current_queue_index {
            assert!(index < snapshot.queue.len());
            assert_eq!(
                snapshot.current_song_id(),
                Some(snapshot.queue[index].id)
            );
        } else {
            assert!(snapshot.current_song.is_none());
        }
    }
}

#[tokio::test]
async fn test_engine_error_is_recorded_then_dismissed() {
    let h = HarnessBuilder::new()
        .engine(FakeEngine::loaded(&[1], 0))
        .build();
    h.service.connect().await;
    let queue_before = h.service.snapshot().queue;

    h.engine
        .fail_next(EngineError::Rejected("busy".to_string()));
    h.service.play().await;

    let snapshot = h.service.snapshot();
    assert!(snapshot.error.as_deref().unwrap_or_default().contains("busy"));
    assert_eq!(snapshot.last_update_source, UpdateSource::Failure);
    assert_eq!(snapshot.queue, queue_before);
    assert!(!h.engine.state().playing);

    h.service.dismiss_error().await;
    assert_eq!(h.service.snapshot().error, None);
}

#[tokio::test]
async fn test_next_successful_sync_clears_error() {
    let h = HarnessBuilder::new()
        .engine(FakeEngine::loaded(&[1], 0))
        .build();
    h.service.connect().await;

    h.engine.fail_next(EngineError::Timeout);
    h.service.seek_to(1_000).await;
    assert!(h.service.snapshot().error.is_some());

    h.service.refresh_playback_state(false).await;
    assert_eq!(h.service.snapshot().error, None);
}

#[tokio::test]
async fn test_unmappable_items_are_skipped() {
    let engine = FakeEngine::loaded(&[1, 2], 1);
    engine.with_state(|s| {
        let mut foreign = item(99);
        foreign.media_id = "radio:stream".to_string();
        s.items.insert(1, foreign);
        s.current = Some(2);
    });
    let h = HarnessBuilder::new().engine(engine).build();

    h.service.connect().await;

    let snapshot = h.service.snapshot();
    assert_eq!(snapshot.queue_song_ids(), vec![1, 2]);
    assert_eq!(snapshot.current_queue_index, Some(1));
    assert!(h.service.conversion_mismatches() >= 1);

    // Queue index 1 is engine index 2.
    h.service.remove_from_queue(1).await;
    assert_eq!(h.engine.state().items.len(), 2);
    assert_eq!(h.service.snapshot().queue_song_ids(), vec![1]);
}

#[tokio::test]
async fn test_liked_flag_is_refreshed_from_library() {
    let h = harness();
    h.songs.set_liked(5, true);
    h.service.connect().await;

    h.service.play_song(5).await;

    let snapshot = wait_for(&h.service, |s| {
        s.current_song.as_ref().is_some_and(|song| song.liked)
    })
    .await;
    assert!(snapshot.queue[0].liked);
    assert!(!h.service.snapshot().queue.iter().any(|song| song.id != 5));
}

#[tokio::test]
async fn test_focus_loss_is_reported_until_user_plays() {
    let h = HarnessBuilder::new()
        .engine(FakeEngine::loaded(&[1], 0))
        .build();
    h.service.connect().await;

    h.engine.emit(EngineEvent::PlayIntentChanged {
        play_when_ready: false,
        reason: PlayIntentReason::AudioFocusLoss,
    });
    let snapshot = wait_for(&h.service, |s| s.paused_by_focus_loss).await;
    assert!(!snapshot.paused_by_noisy_route);

    h.service.play().await;
    let snapshot = h.service.snapshot();
    assert!(!snapshot.paused_by_focus_loss);
    assert!(snapshot.is_playing);
}

#[tokio::test]
async fn test_pause_saves_pointer() {
    let h = harness();
    h.service.connect().await;
    h.service.play_queue(vec![3, 4], 1).await;
    h.service.seek_to(42_000).await;

    h.service.pause().await;

    let prefs = h.prefs.clone();
    eventually(|| {
        let prefs = prefs.clone();
        async move { prefs.pointer().is_some() }
    })
    .await;
    let pointer = h.prefs.pointer().unwrap();
    assert_eq!(pointer.song_id, 4);
    assert_eq!(pointer.queue_index, 1);
    assert_eq!(pointer.position_ms, 42_000);
    assert_eq!(pointer.queue_name, "Now Playing");
}

#[tokio::test]
async fn test_save_playback_state_needs_a_loaded_song() {
    let h = harness();
    assert!(!h.service.save_playback_state().await);

    h.service.connect().await;
    assert!(!h.service.save_playback_state().await);

    h.service.play_song(2).await;
    assert!(h.service.save_playback_state().await);
    assert_eq!(h.prefs.pointer().unwrap().song_id, 2);
}

#[tokio::test]
async fn test_pointer_records_published_queue_index() {
    let engine = FakeEngine::loaded(&[5, 5, 6], 1);
    engine.with_state(|s| {
        let mut foreign = item(99);
        foreign.media_id = "radio:stream".to_string();
        s.items.insert(0, foreign);
        s.current = Some(2);
    });
    let h = HarnessBuilder::new().engine(engine).build();
    h.service.connect().await;
    assert_eq!(h.service.snapshot().current_queue_index, Some(1));

    assert!(h.service.save_playback_state().await);

    let pointer = h.prefs.pointer().unwrap();
    assert_eq!(pointer.song_id, 5);
    assert_eq!(pointer.queue_index, 1);
}

#[tokio::test]
async fn test_play_pause_toggles() {
    let h = HarnessBuilder::new()
        .engine(FakeEngine::loaded(&[1], 0))
        .build();
    h.service.connect().await;

    h.service.play_pause().await;
    assert!(h.engine.state().playing);
    h.service.play_pause().await;
    assert!(!h.engine.state().playing);
}

#[tokio::test]
async fn test_play_queue_skips_unknown_songs() {
    let h = harness();
    h.service.connect().await;

    // 404 is not in the library; the start moves to the next playable song.
    h.service.play_queue(vec![1, 404, 3], 1).await;

    let snapshot = h.service.snapshot();
    assert_eq!(snapshot.queue_song_ids(), vec![1, 3]);
    assert_eq!(snapshot.current_song_id(), Some(3));
    assert!(snapshot.is_playing);
}

#[tokio::test]
async fn test_play_next_inserts_after_current() {
    let h = HarnessBuilder::new()
        .engine(FakeEngine::loaded(&[1, 2, 3], 0))
        .build();
    h.service.connect().await;

    h.service.play_next(vec![9]).await;
    h.service.add_to_queue(vec![10]).await;

    assert_eq!(h.service.snapshot().queue_song_ids(), vec![1, 9, 2, 3, 10]);
}

#[tokio::test]
async fn test_speed_is_clamped() {
    let h = HarnessBuilder::new()
        .engine(FakeEngine::loaded(&[1], 0))
        .build();
    h.service.connect().await;

    h.service.set_playback_speed(12.0).await;
    assert_eq!(h.service.snapshot().playback_speed, 4.0);

    h.service.set_playback_speed(f32::NAN).await;
    assert_eq!(h.engine.state().speed, 4.0);
}

#[tokio::test]
async fn test_operations_without_engine_are_noops() {
    let h = harness();
    h.connector.fail.store(true, std::sync::atomic::Ordering::SeqCst);

    h.service.remove_from_queue(0).await;
    h.service.seek_to_queue_index(3).await;
    h.service.apply_settings_now(1, Default::default()).await;
    h.service.refresh_playback_state(false).await;
    settle().await;

    let snapshot = h.service.snapshot();
    assert!(snapshot.queue.is_empty());
    assert_eq!(h.connector.calls(), 0);
}

#[tokio::test]
async fn test_shutdown_saves_pointer_and_detaches() {
    let h = HarnessBuilder::new()
        .engine(FakeEngine::loaded(&[6, 7], 1))
        .build();
    h.service.connect().await;

    h.service.shutdown().await;

    assert_eq!(h.prefs.pointer().unwrap().song_id, 7);
    assert_eq!(h.engine.listener_count(), 0);
}
