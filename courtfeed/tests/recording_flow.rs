//! Recording orchestration against stub encoder binaries.
//!
//! A tiny shell script stands in for ffmpeg: it writes its output file up
//! front, then blocks on stdin until the interactive quit arrives. That
//! exercises spawn, graceful stop, finalization and the corrupt-file floor
//! without a real encoder on the test host.

#![cfg(unix)]

use courtfeed::encoder::EncoderSupervisor;
use courtfeed::recording::RecordingState;
use courtfeed::session::RecordingGuard;
use courtfeed::{RecordingOrchestrator, RelayConfig, RelayError};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Write a stub encoder script. It emits `bytes` to its final argument (the
/// output path), then waits for one line on stdin before exiting cleanly.
fn stub_encoder(dir: &Path, bytes: usize) -> PathBuf {
    let script = dir.join(format!("ffmpeg-stub-{bytes}.sh"));
    let body = format!(
        "#!/bin/sh\n\
         for arg in \"$@\"; do out=\"$arg\"; done\n\
         head -c {bytes} /dev/zero > \"$out\"\n\
         read -r _quit\n\
         exit 0\n"
    );
    std::fs::write(&script, body).unwrap();
    let mut perms = std::fs::metadata(&script).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&script, perms).unwrap();
    script
}

/// Stub that writes its file and exits immediately, like a run that reached
/// its duration bound.
fn stub_encoder_exits(dir: &Path, bytes: usize) -> PathBuf {
    let script = dir.join(format!("ffmpeg-exit-{bytes}.sh"));
    let body = format!(
        "#!/bin/sh\n\
         for arg in \"$@\"; do out=\"$arg\"; done\n\
         head -c {bytes} /dev/zero > \"$out\"\n\
         exit 0\n"
    );
    std::fs::write(&script, body).unwrap();
    let mut perms = std::fs::metadata(&script).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&script, perms).unwrap();
    script
}

fn test_config(dir: &TempDir, ffmpeg: &Path) -> RelayConfig {
    RelayConfig {
        ffmpeg_path: ffmpeg.display().to_string(),
        // Probe failures are tolerated; point at nothing on purpose.
        ffprobe_path: dir.path().join("no-ffprobe").display().to_string(),
        recordings_dir: dir.path().join("recordings"),
        stop_timeout_secs: 2,
        kill_grace_secs: 1,
        finalize_grace_secs: 0,
        ..RelayConfig::default()
    }
}

fn orchestrator(config: RelayConfig) -> Arc<RecordingOrchestrator> {
    Arc::new(RecordingOrchestrator::new(
        Arc::new(config),
        Arc::new(EncoderSupervisor::new()),
    ))
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_finalizes_a_healthy_recording() {
    let dir = TempDir::new().unwrap();
    let ffmpeg = stub_encoder(dir.path(), 60_000);
    let orch = orchestrator(test_config(&dir, &ffmpeg));

    let task = orch
        .start(1, None, "http://127.0.0.1:1/stream.mjpeg", 300, None)
        .await
        .unwrap();
    assert_eq!(task.state, RecordingState::Recording);
    assert!(orch.status(&task.recording_id).is_some());

    let outcome = orch.stop(&task.recording_id).await.unwrap();
    assert!(outcome.success, "60KB file must clear the corrupt floor");
    assert!(outcome.file_size_bytes >= 60_000);
    assert!(outcome.output_path.exists());

    let status = orch.status(&task.recording_id).unwrap();
    assert_eq!(status.state, RecordingState::Completed);
    assert!(!status.corrupt);
}

#[tokio::test(flavor = "multi_thread")]
async fn tiny_output_is_flagged_corrupt() {
    let dir = TempDir::new().unwrap();
    let ffmpeg = stub_encoder(dir.path(), 1_000);
    let orch = orchestrator(test_config(&dir, &ffmpeg));

    let task = orch.start(2, None, "rtsp://cam/ch0", 300, None).await.unwrap();
    let outcome = orch.stop(&task.recording_id).await.unwrap();
    assert!(!outcome.success);

    let status = orch.status(&task.recording_id).unwrap();
    assert_eq!(status.state, RecordingState::Failed);
    assert!(status.corrupt);
    assert!(status.error.unwrap().contains("corrupt"));
}

#[tokio::test(flavor = "multi_thread")]
async fn one_recording_per_court() {
    let dir = TempDir::new().unwrap();
    let ffmpeg = stub_encoder(dir.path(), 60_000);
    let orch = orchestrator(test_config(&dir, &ffmpeg));

    let task = orch.start(3, None, "rtsp://cam/ch0", 300, None).await.unwrap();
    let second = orch.start(3, None, "rtsp://cam/ch0", 300, None).await;
    assert!(matches!(
        second,
        Err(RelayError::AlreadyRecording { court_id: 3 })
    ));

    orch.stop(&task.recording_id).await.unwrap();
    // The court frees up once the first run is terminal.
    let third = orch.start(3, None, "rtsp://cam/ch0", 300, None).await.unwrap();
    orch.stop(&third.recording_id).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_starts_for_one_court_admit_exactly_one() {
    let dir = TempDir::new().unwrap();
    let ffmpeg = stub_encoder(dir.path(), 60_000);
    let orch = orchestrator(test_config(&dir, &ffmpeg));

    for round in 0..5u32 {
        let court = 10 + round;
        let a = {
            let orch = orch.clone();
            tokio::spawn(async move { orch.start(court, None, "rtsp://cam/ch0", 300, None).await })
        };
        let b = {
            let orch = orch.clone();
            tokio::spawn(async move { orch.start(court, None, "rtsp://cam/ch0", 300, None).await })
        };
        let results = [a.await.unwrap(), b.await.unwrap()];

        let admitted: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
        assert_eq!(
            admitted.len(),
            1,
            "round {round}: exactly one start must win for court {court}"
        );
        assert!(results.iter().any(|r| matches!(
            r,
            Err(RelayError::AlreadyRecording { court_id }) if *court_id == court
        )));

        orch.stop(&admitted[0].recording_id).await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn global_recording_cap() {
    let dir = TempDir::new().unwrap();
    let ffmpeg = stub_encoder(dir.path(), 60_000);
    let mut config = test_config(&dir, &ffmpeg);
    config.max_recordings = 1;
    let orch = orchestrator(config);

    let task = orch.start(1, None, "rtsp://cam/ch0", 300, None).await.unwrap();
    let overflow = orch.start(2, None, "rtsp://cam/ch1", 300, None).await;
    assert!(matches!(
        overflow,
        Err(RelayError::CapacityExceeded { max: 1, .. })
    ));
    orch.stop(&task.recording_id).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn stopping_an_unknown_recording_is_not_found() {
    let dir = TempDir::new().unwrap();
    let ffmpeg = stub_encoder(dir.path(), 60_000);
    let orch = orchestrator(test_config(&dir, &ffmpeg));

    let result = orch.stop("rec_9_deadbeef").await;
    assert!(matches!(result, Err(RelayError::NotFound(_))));
}

#[tokio::test(flavor = "multi_thread")]
async fn self_terminating_run_is_finalized_by_the_monitor() {
    let dir = TempDir::new().unwrap();
    let ffmpeg = stub_encoder_exits(dir.path(), 60_000);
    let orch = orchestrator(test_config(&dir, &ffmpeg));

    let task = orch.start(4, None, "rtsp://cam/ch0", 1, None).await.unwrap();

    // Monitor polls at 500ms; give it a couple of cycles.
    let mut state = RecordingState::Recording;
    for _ in 0..20 {
        tokio::time::sleep(Duration::from_millis(200)).await;
        state = orch.status(&task.recording_id).unwrap().state;
        if state.is_terminal() {
            break;
        }
    }
    assert_eq!(state, RecordingState::Completed);
    assert!(orch.status(&task.recording_id).unwrap().output_path.exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_is_bounded_for_a_wedged_encoder() {
    let dir = TempDir::new().unwrap();
    // Ignores the interactive quit entirely; only a kill gets rid of it.
    let script = dir.path().join("ffmpeg-wedged.sh");
    std::fs::write(
        &script,
        "#!/bin/sh\n\
         for arg in \"$@\"; do out=\"$arg\"; done\n\
         head -c 60000 /dev/zero > \"$out\"\n\
         sleep 600\n",
    )
    .unwrap();
    let mut perms = std::fs::metadata(&script).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&script, perms).unwrap();

    let orch = orchestrator(test_config(&dir, &script));
    let task = orch.start(7, None, "rtsp://cam/ch0", 300, None).await.unwrap();

    let begun = std::time::Instant::now();
    let outcome = orch.stop(&task.recording_id).await.unwrap();
    // stop_timeout (2s) + kill_grace (1s) plus scheduling slack.
    assert!(
        begun.elapsed() < Duration::from_secs(8),
        "stop took {:?}",
        begun.elapsed()
    );
    assert!(outcome.success, "the file was written before the wedge");
    assert!(orch.status(&task.recording_id).unwrap().state.is_terminal());
}

#[tokio::test(flavor = "multi_thread")]
async fn recorded_user_is_reported_in_status() {
    let dir = TempDir::new().unwrap();
    let ffmpeg = stub_encoder(dir.path(), 60_000);
    let orch = orchestrator(test_config(&dir, &ffmpeg));

    let task = orch
        .start(8, Some("player-77".into()), "rtsp://cam/ch0", 300, None)
        .await
        .unwrap();
    assert_eq!(
        orch.status(&task.recording_id).unwrap().user_id.as_deref(),
        Some("player-77")
    );
    orch.stop(&task.recording_id).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_racing_the_monitor_still_lands_terminal() {
    let dir = TempDir::new().unwrap();
    // Encoder exits on its own, so the monitor races every explicit stop.
    let ffmpeg = stub_encoder_exits(dir.path(), 60_000);
    let orch = orchestrator(test_config(&dir, &ffmpeg));

    // Stagger the stop across the monitor's 500ms poll cycle so the two
    // finalize paths interleave differently each round.
    for (round, delay_ms) in [0u64, 250, 450, 550, 700].into_iter().enumerate() {
        let court = 20 + round as u32;
        let task = orch.start(court, None, "rtsp://cam/ch0", 1, None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;

        let outcome = orch.stop(&task.recording_id).await.unwrap();
        assert!(outcome.success, "round {round}: file was fully written");

        let status = orch.status(&task.recording_id).unwrap();
        assert!(
            status.state.is_terminal(),
            "round {round}: state stuck at {:?}",
            status.state
        );
        assert!(
            !orch.is_recording(court),
            "round {round}: court {court} left permanently busy"
        );
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn stopping_twice_returns_the_same_outcome() {
    let dir = TempDir::new().unwrap();
    let ffmpeg = stub_encoder(dir.path(), 60_000);
    let orch = orchestrator(test_config(&dir, &ffmpeg));

    let task = orch.start(5, None, "rtsp://cam/ch0", 300, None).await.unwrap();
    let first = orch.stop(&task.recording_id).await.unwrap();
    let second = orch.stop(&task.recording_id).await.unwrap();
    assert_eq!(first.file_size_bytes, second.file_size_bytes);
    assert_eq!(first.success, second.success);
}

#[tokio::test(flavor = "multi_thread")]
async fn explicit_output_path_is_respected() {
    let dir = TempDir::new().unwrap();
    let ffmpeg = stub_encoder(dir.path(), 60_000);
    let orch = orchestrator(test_config(&dir, &ffmpeg));

    let wanted = dir.path().join("match_final.mp4");
    let task = orch
        .start(6, None, "rtsp://cam/ch0", 300, Some(wanted.clone()))
        .await
        .unwrap();
    let outcome = orch.stop(&task.recording_id).await.unwrap();
    assert_eq!(outcome.output_path, wanted);
    assert!(wanted.exists());
}
