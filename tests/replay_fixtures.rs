use ssh_broker::error::ConnectError;
use ssh_broker::recording::{SessionEvent, SessionReplayer};

const CONNECT_AND_EXEC_FIXTURE: &str = include_str!("fixtures/session_replay_connect_and_exec.jsonl");
const PARALLEL_DOWNLOAD_FIXTURE: &str = include_str!("fixtures/session_replay_parallel_download.jsonl");
const PARALLEL_DOWNLOAD_CANCELLED_FIXTURE: &str =
    include_str!("fixtures/session_replay_parallel_download_cancelled.jsonl");
const COMPRESSED_UPLOAD_FIXTURE: &str = include_str!("fixtures/session_replay_compressed_upload.jsonl");
const COMPRESSED_UPLOAD_FAILURE_FIXTURE: &str =
    include_str!("fixtures/session_replay_compressed_upload_failure.jsonl");
const FLAKY_DOWNLOAD_FIXTURE: &str = include_str!("fixtures/session_replay_flaky_download.jsonl");

/// Scenario 1: connect, then run a command, without a live server.
#[test]
fn fixture_scenario1_connect_and_echo_hi() {
    let mut replayer = SessionReplayer::from_jsonl(CONNECT_AND_EXEC_FIXTURE).expect("load fixture");

    let ctx = replayer.initial_context().expect("connection context");
    assert_eq!(ctx.session_id, "s1");
    assert_eq!(ctx.host, "h");
    assert_eq!(ctx.port, 22);

    let out = replayer.replay_next("echo hi").expect("replay exec");
    assert_eq!(out.exit_code, 0);
    assert!(out.success);
    assert_eq!(out.stdout, "hi\n");
}

/// Scenario 3: a parallel download runs to completion at the expected size.
#[test]
fn fixture_scenario3_parallel_download_completes_with_exact_size() {
    let mut replayer = SessionReplayer::from_jsonl(PARALLEL_DOWNLOAD_FIXTURE).expect("load fixture");

    let terminal = replayer
        .replay_transfer_terminal("t3")
        .expect("terminal event");
    match terminal {
        SessionEvent::TransferCompleted { artifact_path, .. } => {
            assert!(artifact_path.ends_with("big.bin"));
        }
        other => panic!("expected TransferCompleted, got {other:?}"),
    }
}

/// Scenario 3: cancelling mid-transfer publishes exactly one cancellation,
/// never a completion.
#[test]
fn fixture_scenario3_cancel_mid_transfer_publishes_cancelled_exactly_once() {
    let recorder =
        ssh_broker::recording::SessionRecorder::from_jsonl(PARALLEL_DOWNLOAD_CANCELLED_FIXTURE)
            .expect("load fixture");
    let cancelled_count = recorder
        .entries()
        .expect("entries")
        .iter()
        .filter(|e| matches!(&e.event, SessionEvent::TransferCancelled { task_id } if task_id == "t3b"))
        .count();
    assert_eq!(cancelled_count, 1);

    let mut replayer = SessionReplayer::from_jsonl(PARALLEL_DOWNLOAD_CANCELLED_FIXTURE).expect("load fixture");
    let terminal = replayer
        .replay_transfer_terminal("t3b")
        .expect("terminal event");
    assert!(matches!(terminal, SessionEvent::TransferCancelled { .. }));
}

/// Scenario 4: a compressed upload only reaches `completed` after the
/// remote extract command reports exit 0, and progress never exceeds 100%.
#[test]
fn fixture_scenario4_compressed_upload_completes_only_after_remote_extract_exit_zero() {
    let recorder =
        ssh_broker::recording::SessionRecorder::from_jsonl(COMPRESSED_UPLOAD_FIXTURE).expect("load fixture");
    let entries = recorder.entries().expect("entries");

    let extract_index = entries
        .iter()
        .position(|e| matches!(&e.event, SessionEvent::CommandExecuted { exit_code, .. } if *exit_code == 0))
        .expect("extract command entry");
    let completed_index = entries
        .iter()
        .position(|e| matches!(&e.event, SessionEvent::TransferCompleted { task_id, .. } if task_id == "t4"))
        .expect("completed entry");
    assert!(extract_index < completed_index);

    for entry in &entries {
        if let SessionEvent::TransferProgress { percentage, .. } = &entry.event {
            assert!(*percentage <= 100.0);
        }
    }
}

/// Scenario 4: a failed remote extract never reaches `completed` and is
/// reported as `failed` instead.
#[test]
fn fixture_scenario4_compressed_upload_failure_never_reaches_completed() {
    let recorder =
        ssh_broker::recording::SessionRecorder::from_jsonl(COMPRESSED_UPLOAD_FAILURE_FIXTURE).expect("load fixture");
    let entries = recorder.entries().expect("entries");

    assert!(!entries
        .iter()
        .any(|e| matches!(&e.event, SessionEvent::TransferCompleted { task_id, .. } if task_id == "t4f")));

    let failed = entries
        .iter()
        .find(|e| matches!(&e.event, SessionEvent::TransferFailed { task_id, .. } if task_id == "t4f"))
        .expect("failed entry");
    assert!(matches!(&failed.event, SessionEvent::TransferFailed { error, .. } if error.contains("exit 1")));

    let extract = entries
        .iter()
        .find(|e| matches!(&e.event, SessionEvent::CommandExecuted { .. }))
        .expect("extract command entry");
    match &extract.event {
        SessionEvent::CommandExecuted { exit_code, success, .. } => {
            assert_ne!(*exit_code, 0);
            assert!(!success);
        }
        _ => unreachable!(),
    }
}

/// Scenario 6: a download that stalls and retries still reports monotonic
/// (non-decreasing) `transferred` and eventually completes.
#[test]
fn fixture_scenario6_flaky_download_progress_is_monotonic_despite_retries() {
    let recorder = ssh_broker::recording::SessionRecorder::from_jsonl(FLAKY_DOWNLOAD_FIXTURE).expect("load fixture");
    let entries = recorder.entries().expect("entries");

    let mut last = 0u64;
    for entry in &entries {
        if let SessionEvent::TransferProgress { transferred, .. } = &entry.event {
            assert!(*transferred >= last, "progress went backwards: {transferred} < {last}");
            last = *transferred;
        }
    }

    let mut replayer = SessionReplayer::from_jsonl(FLAKY_DOWNLOAD_FIXTURE).expect("load fixture");
    let terminal = replayer.replay_transfer_terminal("t6").expect("terminal event");
    assert!(matches!(terminal, SessionEvent::TransferCompleted { .. }));
}

/// Replaying a command absent from the fixture is reported, not silently
/// stubbed — matches the offline-replay contract used by the scenarios above.
#[test]
fn fixture_replay_next_detects_missing_command() {
    let mut replayer = SessionReplayer::from_jsonl(CONNECT_AND_EXEC_FIXTURE).expect("load fixture");
    let err = replayer.replay_next("this command was never run").unwrap_err();
    assert!(matches!(err, ConnectError::ReplayMismatchError(_)));
}
