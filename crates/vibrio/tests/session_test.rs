//! Async Session Integration Tests
//!
//! End-to-end calls through `LazerAsync` against the stub engine:
//! 1. Encode → engine → decode round trips for every request shape
//! 2. Concurrent calls with inverted latencies keep their own results
//! 3. Crash recovery, failing recovery and manual restart
//! 4. Close while calls are in flight
//! 5. Beatmap cache operations and error mapping

#![cfg(unix)]

mod common;

use std::time::{Duration, Instant};

use common::*;
use futures::future::join_all;
use nix::sys::signal::Signal;
use vibrio::{
    CalculationRequest, HitStatistics, LazerAsync, ModSet, OsuMod, RetryConfig, SessionState,
    VibrioError,
};

// ============================================================================
// Calculations
// ============================================================================

#[tokio::test]
async fn test_example_play_returns_engine_total() {
    let lazer = LazerAsync::new(test_config().with_engine_env("STUB_TOTAL", "1234.5")).unwrap();

    let performance = lazer.calculate_performance(&example_request()).await.unwrap();

    assert_eq!(performance.total, 1234.5);
    assert_eq!(performance.aim, 2019.0);
    assert_eq!(performance.speed, 104.0);
    assert_eq!(performance.accuracy, 0.0);
    assert_eq!(performance.flashlight, 3.0);
    assert_eq!(performance.effective_miss_count, 3141.0);
    lazer.close().await;
}

#[tokio::test]
async fn test_difficulty_round_trip() {
    let lazer = LazerAsync::new(test_config()).unwrap();

    let difficulty = lazer
        .calculate_difficulty(1001682u32, [OsuMod::DoubleTime, OsuMod::Hidden])
        .await
        .unwrap();

    assert_eq!(difficulty.max_combo, 1001682);
    assert_eq!(difficulty.mods, ModSet::from([OsuMod::Hidden, OsuMod::DoubleTime]));
    assert_eq!(difficulty.star_rating, 6.0);
    lazer.close().await;
}

#[tokio::test]
async fn test_difficulty_from_uploaded_content() {
    let lazer = LazerAsync::new(test_config()).unwrap();
    let content = "osu file format v14\n\n[Metadata]\nBeatmapID:75\n";

    let result = lazer
        .calculate(&CalculationRequest::by_content(content).with_mods([OsuMod::HardRock]))
        .await
        .unwrap();

    let difficulty = result.difficulty().unwrap();
    assert_eq!(difficulty.max_combo, 75);
    assert!(difficulty.mods.contains(OsuMod::HardRock));
    lazer.close().await;
}

#[tokio::test]
async fn test_uploads_reach_engine_byte_for_byte() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config().with_engine_env("STUB_UPLOAD_DIR", dir.path().to_str().unwrap());
    let lazer = LazerAsync::new(config).unwrap();

    let beatmap = b"osu file format v14\r\n\r\n[Metadata]\r\nBeatmapID:75\r\n--\r\n".to_vec();
    let replay: Vec<u8> = (0..=255u8).chain(*b"\r\n--\r\n").collect();
    let request = CalculationRequest::by_content(beatmap.clone()).with_replay(replay.clone());
    lazer.calculate_performance(&request).await.unwrap();

    let read = |name: &str| std::fs::read(dir.path().join(name)).unwrap();
    assert_eq!(read("beatmap"), beatmap);
    assert_eq!(read("beatmap.filename"), b"beatmap.osu");
    assert_eq!(read("replay"), replay);
    assert_eq!(read("replay.filename"), b"replay.osr");
    lazer.close().await;
}

#[tokio::test]
async fn test_performance_from_difficulty_attributes() {
    let lazer = LazerAsync::new(test_config().with_engine_env("STUB_TOTAL", "99.5")).unwrap();

    let difficulty = lazer
        .calculate_difficulty(1001682u32, [OsuMod::Hidden])
        .await
        .unwrap();
    let request = CalculationRequest::from_difficulty(difficulty)
        .with_hit_stats(HitStatistics::new(500, 10, 1, 0, 700));
    let performance = lazer.calculate_performance(&request).await.unwrap();

    assert_eq!(performance.total, 99.5);
    assert_eq!(performance.aim, 500.0);
    assert_eq!(performance.effective_miss_count, 700.0);
    lazer.close().await;
}

#[tokio::test]
async fn test_performance_from_replay() {
    let lazer = LazerAsync::new(test_config().with_engine_env("STUB_TOTAL", "321.0")).unwrap();

    let request = CalculationRequest::by_id(1001682).with_replay(&b"osr replay data"[..]);
    let performance = lazer.calculate_performance(&request).await.unwrap();

    assert_eq!(performance.total, 321.0);
    lazer.close().await;
}

#[tokio::test]
async fn test_calculate_performance_requires_play_data() {
    let lazer = LazerAsync::new(test_config()).unwrap();
    let err = lazer
        .calculate_performance(&CalculationRequest::by_id(1001682))
        .await
        .unwrap_err();
    assert!(matches!(err, VibrioError::Validation(_)));
    assert_eq!(lazer.state(), SessionState::Unstarted);
}

#[tokio::test]
async fn test_engine_starts_lazily() {
    let lazer = LazerAsync::new(test_config()).unwrap();
    assert_eq!(lazer.state(), SessionState::Unstarted);
    assert!(lazer.handle().is_none());

    lazer.calculate(&example_request()).await.unwrap();

    assert_eq!(lazer.state(), SessionState::Ready);
    assert!(lazer.handle().is_some());
    lazer.close().await;
}

#[tokio::test]
async fn test_invalid_request_never_starts_engine() {
    let lazer = LazerAsync::new(test_config()).unwrap();

    let request = CalculationRequest::by_id(1001682).with_mods([OsuMod::Easy, OsuMod::HardRock]);
    let err = lazer.calculate(&request).await.unwrap_err();

    assert!(matches!(err, VibrioError::Validation(_)));
    assert_eq!(lazer.state(), SessionState::Unstarted);
}

#[tokio::test]
async fn test_missing_beatmap() {
    let lazer = LazerAsync::new(test_config()).unwrap();

    let err = lazer
        .calculate_difficulty(900_000_001u32, ModSet::new())
        .await
        .unwrap_err();
    assert_eq!(err, VibrioError::BeatmapNotFound(900_000_001));

    let err = lazer.get_beatmap(900_000_002).await.unwrap_err();
    assert_eq!(err, VibrioError::BeatmapNotFound(900_000_002));

    // The engine stays up after a not-found answer.
    assert_eq!(lazer.state(), SessionState::Ready);
    lazer.close().await;
}

// ============================================================================
// Concurrency
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_calls_keep_their_own_results() {
    let lazer = LazerAsync::new(test_config().with_engine_env("STUB_DELAY_FROM_COMBO", "1")).unwrap();
    lazer.start().await.unwrap();

    // Earlier requests get longer delays, so replies arrive in reverse order.
    let calls = (1..=10u32).map(|i| {
        let lazer = lazer.clone();
        async move {
            let request = CalculationRequest::by_id(1000 + i)
                .with_hit_stats(HitStatistics::new(i, 0, 0, 0, (11 - i) * 30));
            (i, lazer.calculate_performance(&request).await)
        }
    });

    let start = Instant::now();
    let results = join_all(calls).await;
    let elapsed = start.elapsed();

    for (i, result) in results {
        let performance = result.unwrap();
        assert_eq!(performance.aim, i as f64, "call {} got another call's result", i);
        assert_eq!(performance.effective_miss_count, ((11 - i) * 30) as f64);
    }
    // Serial execution would take 1650ms.
    assert!(elapsed < Duration::from_millis(1500), "calls were serialized: {:?}", elapsed);
    lazer.close().await;
}

#[tokio::test]
async fn test_cancelled_call_does_not_affect_others() {
    let lazer = LazerAsync::new(test_config().with_engine_env("STUB_DELAY_FROM_COMBO", "1")).unwrap();
    lazer.start().await.unwrap();

    let slow = CalculationRequest::by_id(1).with_hit_stats(HitStatistics::new(1, 0, 0, 0, 2000));
    let cancelled = tokio::time::timeout(Duration::from_millis(100), lazer.calculate(&slow)).await;
    assert!(cancelled.is_err());

    let fast = CalculationRequest::by_id(2).with_hit_stats(HitStatistics::new(2, 0, 0, 0, 1));
    let performance = lazer.calculate_performance(&fast).await.unwrap();
    assert_eq!(performance.aim, 2.0);
    assert_eq!(lazer.state(), SessionState::Ready);
    lazer.close().await;
}

// ============================================================================
// Recovery
// ============================================================================

#[tokio::test]
async fn test_killed_engine_is_restarted_exactly_once() {
    let lazer = LazerAsync::new(test_config()).unwrap();
    let original = lazer.start().await.unwrap();

    send_signal(original.pid, Signal::SIGKILL);

    let performance = lazer.calculate_performance(&example_request()).await.unwrap();
    assert_eq!(performance.aim, 2019.0);
    assert_eq!(lazer.restart_count(), 1);

    let current = lazer.handle().unwrap();
    assert!(current.generation > original.generation);
    assert_ne!(current.pid, original.pid);
    assert!(!pid_alive(original.pid));
    lazer.close().await;
}

#[tokio::test]
async fn test_failed_recovery_then_manual_start() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("started");
    let config = test_config().with_engine_env("STUB_FAIL_MARKER", marker.to_string_lossy());
    let lazer = LazerAsync::new(config).unwrap();

    // First launch succeeds and leaves the marker, so every restart fails.
    let original = lazer.start().await.unwrap();
    assert!(marker.exists());
    send_signal(original.pid, Signal::SIGKILL);

    let err = lazer.calculate(&example_request()).await.unwrap_err();
    assert!(matches!(err, VibrioError::EngineUnavailable(_)), "{:?}", err);
    assert_eq!(lazer.state(), SessionState::Degraded);
    assert_eq!(lazer.restart_count(), 0);

    std::fs::remove_file(&marker).unwrap();
    lazer.start().await.unwrap();
    assert_eq!(lazer.state(), SessionState::Ready);

    let performance = lazer.calculate_performance(&example_request()).await.unwrap();
    assert_eq!(performance.speed, 104.0);
    lazer.close().await;
}

#[tokio::test]
async fn test_slow_reply_is_transport_error_without_restart() {
    let config = test_config()
        .with_request_timeout(Duration::from_millis(200))
        .with_retry(RetryConfig::none())
        .with_engine_env("STUB_DELAY_FROM_COMBO", "1");
    let lazer = LazerAsync::new(config).unwrap();
    let handle = lazer.start().await.unwrap();

    let request = CalculationRequest::by_id(1).with_hit_stats(HitStatistics::new(1, 0, 0, 0, 2000));
    let err = lazer.calculate(&request).await.unwrap_err();

    assert!(matches!(err, VibrioError::Transport { attempts: 1, .. }), "{:?}", err);
    assert!(err.is_retryable());
    assert_eq!(lazer.state(), SessionState::Ready);
    assert_eq!(lazer.handle().unwrap().pid, handle.pid);
    assert_eq!(lazer.restart_count(), 0);
    lazer.close().await;
}

// ============================================================================
// Close
// ============================================================================

#[tokio::test]
async fn test_close_resolves_in_flight_calls() {
    let lazer = LazerAsync::new(test_config().with_engine_env("STUB_DELAY_FROM_COMBO", "1")).unwrap();
    let handle = lazer.start().await.unwrap();

    let in_flight = {
        let lazer = lazer.clone();
        tokio::spawn(async move {
            let request =
                CalculationRequest::by_id(1).with_hit_stats(HitStatistics::new(1, 0, 0, 0, 3000));
            lazer.calculate(&request).await
        })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;

    let start = Instant::now();
    lazer.close().await;
    let err = in_flight.await.unwrap().unwrap_err();

    assert_eq!(err, VibrioError::EngineUnavailable("session closed".to_string()));
    assert!(start.elapsed() < Duration::from_secs(3));
    assert_eq!(lazer.state(), SessionState::Closed);
    assert!(!pid_alive(handle.pid));
}

#[tokio::test]
async fn test_closed_session_rejects_calls() {
    let lazer = LazerAsync::new(test_config()).unwrap();
    lazer.close().await;
    lazer.close().await;

    let err = lazer.calculate(&example_request()).await.unwrap_err();
    assert_eq!(err, VibrioError::EngineUnavailable("session closed".to_string()));
    assert!(matches!(lazer.start().await, Err(VibrioError::EngineUnavailable(_))));
}

#[tokio::test]
async fn test_dropping_last_clone_kills_engine() {
    let lazer = LazerAsync::new(test_config()).unwrap();
    let handle = lazer.start().await.unwrap();
    let clone = lazer.clone();

    drop(lazer);
    assert!(pid_alive(handle.pid));
    drop(clone);

    assert!(eventually(Duration::from_secs(3), || !pid_alive(handle.pid)).await);
}

// ============================================================================
// Beatmap Cache
// ============================================================================

#[tokio::test]
async fn test_beatmap_cache_operations() {
    let lazer = LazerAsync::new(test_config()).unwrap();

    assert!(!lazer.has_beatmap(5).await.unwrap());

    let content = lazer.get_beatmap(5).await.unwrap();
    assert!(String::from_utf8_lossy(&content).contains("BeatmapID:5"));
    assert!(lazer.has_beatmap(5).await.unwrap());

    lazer.clear_cache().await.unwrap();
    assert!(!lazer.has_beatmap(5).await.unwrap());

    let err = lazer.has_beatmap(0).await.unwrap_err();
    assert!(matches!(err, VibrioError::Validation(_)));
    lazer.close().await;
}

#[tokio::test]
async fn test_missing_executable_fails_at_construction() {
    let dir = tempfile::tempdir().unwrap();
    let result = LazerAsync::new(test_config().with_executable(dir.path().join("Vibrio")));
    assert!(matches!(result, Err(VibrioError::EngineStartup(_))));
}
