//! Session lifecycle tests driven through the manager with a fake
//! capture supervisor and a scripted upload transport.

use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::{Duration, Utc};
use tempfile::TempDir;

use camfleet::models::command::{CommandAction, QueuedCommand};
use camfleet::models::recording::{RecordingRecord, SessionStatus};
use camfleet::orchestrator::session_manager::SessionManager;
use camfleet::orchestrator::uploader::UploadPipeline;
use camfleet::persistence::db;
use camfleet::persistence::recording_repo::RecordingRepo;
use camfleet::AppError;

use super::test_helpers::{agent_config, FakeSupervisor, ScriptedTransport};

struct Harness {
    temp: TempDir,
    supervisor: Arc<FakeSupervisor>,
    transport: Arc<ScriptedTransport>,
    manager: SessionManager,
}

fn harness(statuses: &[u16]) -> Harness {
    let temp = tempfile::tempdir().expect("tempdir");
    let supervisor = FakeSupervisor::new();
    let transport = ScriptedTransport::with_statuses(statuses);
    let config = Arc::new(agent_config("http://127.0.0.1:9", temp.path()));
    let manager = SessionManager::new(
        config,
        supervisor.clone(),
        UploadPipeline::new(transport.clone()),
    );
    Harness {
        temp,
        supervisor,
        transport,
        manager,
    }
}

fn status_of(manager: &SessionManager, session_id: &str) -> SessionStatus {
    manager.store().get(session_id).expect("tracked").status()
}

fn output(temp: &TempDir, session_id: &str) -> std::path::PathBuf {
    temp.path().join(format!("{session_id}.mp4"))
}

fn command(action: CommandAction, camera_id: &str, session_id: Option<&str>) -> QueuedCommand {
    let mut command = QueuedCommand::new(
        "AGENT-1".into(),
        action,
        camera_id.into(),
        session_id.map(str::to_owned),
        Some(5),
    );
    command.command_id = format!("AGENT-1_{}", session_id.unwrap_or("none"));
    command
}

#[tokio::test]
async fn finished_recording_is_completed_and_uploaded() {
    let mut h = harness(&[]);
    let id = h
        .manager
        .start_recording("cam1", Some("S1".into()), Some(5))
        .await
        .expect("start");
    assert_eq!(id, "S1");
    assert_eq!(status_of(&h.manager, "S1"), SessionStatus::Active);

    // Still running: the tick probes but changes nothing.
    let report = h.manager.tick().await;
    assert_eq!(report.probed, 1);
    assert!(report.completed.is_empty());
    assert_eq!(h.transport.attempts(), 0);

    let path = output(&h.temp, "S1");
    h.supervisor.finish(&path);
    let report = h.manager.tick().await;

    assert_eq!(report.completed, vec!["S1".to_owned()]);
    assert_eq!(report.uploaded, vec!["S1".to_owned()]);
    assert_eq!(h.transport.attempts(), 1);
    assert_eq!(status_of(&h.manager, "S1"), SessionStatus::Uploaded);
    assert!(!path.exists(), "uploaded file is removed");
}

#[tokio::test]
async fn failed_upload_keeps_file_and_retries_next_cycle() {
    let mut h = harness(&[500]);
    h.manager
        .start_recording("cam1", Some("S1".into()), None)
        .await
        .expect("start");
    let path = output(&h.temp, "S1");
    h.supervisor.finish(&path);

    let report = h.manager.tick().await;
    assert_eq!(report.upload_failed, vec!["S1".to_owned()]);
    assert_eq!(status_of(&h.manager, "S1"), SessionStatus::Completed);
    assert!(path.exists(), "file kept after failed upload");
    let record = h.manager.store().get("S1").expect("tracked").record().clone();
    assert_eq!(record.upload_attempts, 1);
    assert!(record.last_error.is_some());

    let report = h.manager.tick().await;
    assert_eq!(report.uploaded, vec!["S1".to_owned()]);
    assert_eq!(status_of(&h.manager, "S1"), SessionStatus::Uploaded);
    assert_eq!(h.transport.attempts(), 2);
    assert!(!path.exists());
}

#[tokio::test]
async fn default_session_id_and_duration_are_filled_in() {
    let mut h = harness(&[]);
    let id = h
        .manager
        .start_recording("cam2", None, None)
        .await
        .expect("start");

    assert!(id.starts_with("rec_"));
    let record = h.manager.store().get(&id).expect("tracked").record().clone();
    assert_eq!(record.camera_id, "cam2");
    assert_eq!(
        record.requested_duration,
        agent_config("http://x", h.temp.path()).default_duration_seconds
    );
    assert_eq!(record.pid, Some(40_000));
    assert_eq!(record.output_path, output(&h.temp, &id));
}

#[tokio::test]
async fn unknown_camera_is_rejected_without_session() {
    let mut h = harness(&[]);
    let err = h
        .manager
        .start_recording("cam9", Some("S1".into()), None)
        .await
        .expect_err("unknown camera");

    assert!(matches!(err, AppError::UnknownCamera(_)));
    assert!(h.manager.store().is_empty());
}

#[tokio::test]
async fn spawn_failure_creates_no_session() {
    let mut h = harness(&[]);
    h.supervisor.fail_spawn.store(true, Ordering::SeqCst);

    let err = h
        .manager
        .start_recording("cam1", Some("S1".into()), None)
        .await
        .expect_err("spawn fails");

    assert!(matches!(err, AppError::SpawnFailure(_)));
    assert!(h.manager.store().is_empty());
}

#[tokio::test]
async fn duplicate_and_unsafe_session_ids_are_rejected() {
    let mut h = harness(&[]);
    h.manager
        .start_recording("cam1", Some("S1".into()), None)
        .await
        .expect("start");

    let err = h
        .manager
        .start_recording("cam2", Some("S1".into()), None)
        .await
        .expect_err("duplicate");
    assert!(matches!(err, AppError::SessionExists(_)));

    let err = h
        .manager
        .start_recording("cam2", Some("../escape".into()), None)
        .await
        .expect_err("unsafe id");
    assert!(matches!(err, AppError::InvalidCommand(_)));
    assert_eq!(h.manager.store().len(), 1);
}

#[tokio::test]
async fn stop_signals_running_capture_once() {
    let mut h = harness(&[]);
    h.manager
        .start_recording("cam1", Some("S1".into()), None)
        .await
        .expect("start");
    let path = output(&h.temp, "S1");

    let status = h.manager.stop_recording("S1").await.expect("stop");
    assert_eq!(status, SessionStatus::Stopped);
    assert!(!h.supervisor.is_running(&path));
    let record = h.manager.store().get("S1").expect("tracked").record().clone();
    assert!(record.stop_requested);
    assert_eq!(record.pid, Some(40_000));

    let err = h.manager.stop_recording("S1").await.expect_err("second stop");
    assert!(matches!(err, AppError::NotFound(_)));

    // Uploaded once the tick has seen the capture exit.
    let report = h.manager.tick().await;
    assert_eq!(report.finalized, vec!["S1".to_owned()]);
    assert_eq!(report.uploaded, vec!["S1".to_owned()]);
    assert_eq!(
        h.manager.store().get("S1").expect("tracked").record().pid,
        None
    );
}

#[tokio::test]
async fn stop_after_exit_completes_session() {
    let mut h = harness(&[]);
    h.manager
        .start_recording("cam1", Some("S1".into()), None)
        .await
        .expect("start");
    h.supervisor.finish(&output(&h.temp, "S1"));

    let status = h.manager.stop_recording("S1").await.expect("stop");

    assert_eq!(status, SessionStatus::Completed);
    assert!(h.manager.store().get("S1").expect("tracked").record().stop_requested);
}

#[tokio::test]
async fn stop_unknown_session_is_not_found() {
    let mut h = harness(&[]);
    let err = h.manager.stop_recording("nope").await.expect_err("unknown");
    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test]
async fn missing_output_file_fails_session() {
    let mut h = harness(&[]);
    h.manager
        .start_recording("cam1", Some("S1".into()), None)
        .await
        .expect("start");
    let path = output(&h.temp, "S1");
    h.supervisor.finish(&path);
    std::fs::remove_file(&path).expect("remove");

    let report = h.manager.tick().await;

    assert_eq!(report.failed, vec!["S1".to_owned()]);
    assert_eq!(status_of(&h.manager, "S1"), SessionStatus::Failed);
    assert!(h
        .manager
        .store()
        .get("S1")
        .expect("tracked")
        .record()
        .last_error
        .is_some());
    assert_eq!(h.transport.attempts(), 0);

    // Failed is settled: no further attempts.
    let report = h.manager.tick().await;
    assert!(report.failed.is_empty());
    assert_eq!(h.transport.attempts(), 0);
}

#[tokio::test]
async fn sessions_expire_strictly_after_retention() {
    let mut h = harness(&[]);
    h.manager
        .start_recording("cam1", Some("S1".into()), None)
        .await
        .expect("start");
    h.supervisor.finish(&output(&h.temp, "S1"));
    h.manager.tick().await;
    assert_eq!(status_of(&h.manager, "S1"), SessionStatus::Uploaded);

    let started = h.manager.store().get("S1").expect("tracked").record().start_time;

    let report = h.manager.tick_at(started + Duration::seconds(3600)).await;
    assert!(report.purged.is_empty());
    assert!(h.manager.store().contains("S1"));

    let report = h.manager.tick_at(started + Duration::seconds(3601)).await;
    assert_eq!(report.purged, vec!["S1".to_owned()]);
    assert!(report.abandoned.is_empty());
    assert!(h.manager.store().is_empty());
}

#[tokio::test]
async fn active_sessions_survive_retention() {
    let mut h = harness(&[]);
    h.manager
        .start_recording("cam1", Some("S1".into()), None)
        .await
        .expect("start");

    let report = h.manager.tick_at(Utc::now() + Duration::days(2)).await;

    assert!(report.purged.is_empty());
    assert_eq!(status_of(&h.manager, "S1"), SessionStatus::Active);
}

#[tokio::test]
async fn expired_unuploaded_session_is_reported_abandoned() {
    let mut h = harness(&[500, 500, 500]);
    h.manager
        .start_recording("cam1", Some("S1".into()), None)
        .await
        .expect("start");
    h.supervisor.finish(&output(&h.temp, "S1"));
    h.manager.tick().await;
    assert_eq!(status_of(&h.manager, "S1"), SessionStatus::Completed);

    let started = h.manager.store().get("S1").expect("tracked").record().start_time;
    let report = h.manager.tick_at(started + Duration::seconds(7200)).await;

    assert_eq!(report.upload_failed, vec!["S1".to_owned()]);
    assert_eq!(report.purged, vec!["S1".to_owned()]);
    assert_eq!(report.abandoned, vec!["S1".to_owned()]);
}

#[tokio::test]
async fn command_batch_continues_past_failures() {
    let mut h = harness(&[]);
    let batch = vec![
        command(CommandAction::StartRecording, "cam1", Some("S1")),
        command(CommandAction::StartRecording, "cam9", Some("S2")),
        command(CommandAction::Unknown, "cam1", None),
        command(CommandAction::StopRecording, "cam1", None),
        command(CommandAction::StartRecording, "cam2", Some("S3")),
        command(CommandAction::StopRecording, "cam1", Some("S1")),
    ];

    let applied = h.manager.handle_commands(batch).await;

    assert_eq!(applied, 3);
    assert_eq!(status_of(&h.manager, "S1"), SessionStatus::Stopped);
    assert_eq!(status_of(&h.manager, "S3"), SessionStatus::Active);
    assert!(!h.manager.store().contains("S2"));
    assert_eq!(h.manager.store().len(), 2);
}

fn journaled(session_id: &str, status: SessionStatus, pid: Option<u32>, dir: &Path) -> RecordingRecord {
    RecordingRecord {
        session_id: session_id.into(),
        camera_id: "cam1".into(),
        output_path: dir.join(format!("{session_id}.mp4")),
        start_time: Utc::now(),
        requested_duration: 30,
        status,
        pid,
        stop_requested: false,
        upload_attempts: 0,
        last_error: None,
    }
}

#[tokio::test]
async fn journal_mirrors_session_changes() {
    let h = harness(&[]);
    let journal = RecordingRepo::new(Arc::new(db::connect_memory().await.expect("db")));
    let mut manager = h.manager.with_journal(journal.clone());

    manager
        .start_recording("cam1", Some("S1".into()), None)
        .await
        .expect("start");
    let saved = journal.load_all().await.expect("load");
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].status, SessionStatus::Active);
    assert_eq!(saved[0].pid, Some(40_000));

    h.supervisor.finish(&output(&h.temp, "S1"));
    manager.tick().await;
    let saved = journal.load_all().await.expect("load");
    assert_eq!(saved[0].status, SessionStatus::Uploaded);

    let started = saved[0].start_time;
    manager.tick_at(started + Duration::seconds(3601)).await;
    assert!(journal.load_all().await.expect("load").is_empty());
}

#[tokio::test]
async fn restore_adopts_live_processes_and_completes_the_rest() {
    let h = harness(&[]);
    let journal = RecordingRepo::new(Arc::new(db::connect_memory().await.expect("db")));
    let dir = h.temp.path();
    for record in [
        journaled("live", SessionStatus::Active, Some(50_001), dir),
        journaled("dead", SessionStatus::Active, Some(50_002), dir),
        journaled("mid-upload", SessionStatus::Uploading, None, dir),
        journaled("done", SessionStatus::Uploaded, None, dir),
    ] {
        journal.save(&record).await.expect("save");
    }
    h.supervisor.keep_alive(50_001);

    let mut manager = h.manager.with_journal(journal.clone());
    let restored = manager.restore().await.expect("restore");

    assert_eq!(restored, 4);
    assert_eq!(status_of(&manager, "live"), SessionStatus::Active);
    assert!(manager.store().get("live").expect("tracked").has_process());
    assert_eq!(status_of(&manager, "dead"), SessionStatus::Completed);
    assert!(!manager.store().get("dead").expect("tracked").has_process());
    assert_eq!(status_of(&manager, "mid-upload"), SessionStatus::Completed);
    assert_eq!(status_of(&manager, "done"), SessionStatus::Uploaded);

    let statuses: Vec<(String, SessionStatus)> = journal
        .load_all()
        .await
        .expect("load")
        .into_iter()
        .map(|r| (r.session_id, r.status))
        .collect();
    assert!(statuses.contains(&("dead".to_owned(), SessionStatus::Completed)));
}

#[tokio::test]
async fn stale_journaled_pid_is_not_adopted() {
    let h = harness(&[]);
    let journal = RecordingRepo::new(Arc::new(db::connect_memory().await.expect("db")));
    let dir = h.temp.path();
    let mut stale = journaled("stale", SessionStatus::Active, Some(50_003), dir);
    stale.start_time = Utc::now() - Duration::hours(2);
    let mut stale_stop = journaled("stale-stop", SessionStatus::Stopped, Some(50_004), dir);
    stale_stop.start_time = Utc::now() - Duration::hours(2);
    stale_stop.stop_requested = true;
    journal.save(&stale).await.expect("save");
    journal.save(&stale_stop).await.expect("save");
    // Both pids now belong to unrelated running processes.
    h.supervisor.keep_alive(50_003);
    h.supervisor.keep_alive(50_004);

    let mut manager = h.manager.with_journal(journal);
    assert_eq!(manager.restore().await.expect("restore"), 2);

    let session = manager.store().get("stale").expect("tracked");
    assert_eq!(session.status(), SessionStatus::Completed);
    assert!(!session.has_process());
    assert_eq!(session.record().pid, None);
    let session = manager.store().get("stale-stop").expect("tracked");
    assert_eq!(session.status(), SessionStatus::Stopped);
    assert!(!session.has_process());

    let err = manager.stop_recording("stale").await.expect_err("not active");
    assert!(matches!(err, AppError::NotFound(_)));
    let mut pending = manager.store().upload_pending_ids();
    pending.sort();
    assert_eq!(pending, vec!["stale".to_owned(), "stale-stop".to_owned()]);
}

#[tokio::test]
async fn restored_stopped_session_keeps_stop_request() {
    let h = harness(&[]);
    let journal = RecordingRepo::new(Arc::new(db::connect_memory().await.expect("db")));
    let mut halted = journaled("halted", SessionStatus::Stopped, None, h.temp.path());
    halted.stop_requested = true;
    journal.save(&halted).await.expect("save");

    let mut manager = h.manager.with_journal(journal.clone());
    manager.restore().await.expect("restore");

    let session = manager.store().get("halted").expect("tracked");
    assert_eq!(session.status(), SessionStatus::Stopped);
    assert!(session.record().stop_requested);
    assert_eq!(manager.store().upload_pending_ids(), vec!["halted".to_owned()]);

    let saved = journal.load_all().await.expect("load");
    assert_eq!(saved[0].status, SessionStatus::Stopped);
    assert!(saved[0].stop_requested);
}

/// Transport that keeps the bytes of every file it is handed.
#[cfg(unix)]
#[derive(Default)]
struct CapturingTransport {
    bodies: std::sync::Mutex<Vec<Vec<u8>>>,
}

#[cfg(unix)]
impl camfleet::orchestrator::uploader::UploadTransport for CapturingTransport {
    fn send(
        &self,
        path: &Path,
        _session_id: &str,
        _camera_id: &str,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = camfleet::Result<()>> + Send + '_>>
    {
        let body = std::fs::read(path).map_err(AppError::from);
        Box::pin(async move {
            self.bodies.lock().unwrap().push(body?);
            Ok(())
        })
    }
}

#[cfg(unix)]
#[tokio::test]
async fn stopped_recording_is_uploaded_only_after_capture_exits() {
    use camfleet::config::CaptureConfig;
    use camfleet::orchestrator::supervisor::CommandSupervisor;

    // Writes a header, and on SIGTERM keeps writing for a second first.
    const SCRIPT: &str = "trap 'sleep 1; echo trailer >> \"$0\"; exit 0' TERM; \
                          echo head > \"$0\"; while :; do sleep 0.1; done";

    let temp = tempfile::tempdir().expect("tempdir");
    let mut config = agent_config("http://127.0.0.1:9", temp.path());
    config.capture = CaptureConfig {
        program: "sh".into(),
        args: vec!["-c".into(), SCRIPT.into(), "{output}".into()],
    };
    let transport = Arc::new(CapturingTransport::default());
    let mut manager = SessionManager::new(
        Arc::new(config.clone()),
        Arc::new(CommandSupervisor::new(config.capture.clone())),
        UploadPipeline::new(transport.clone()),
    );

    manager
        .start_recording("cam1", Some("S1".into()), Some(60))
        .await
        .expect("start");
    let path = config.output_path("S1");
    for _ in 0..100 {
        if std::fs::read_to_string(&path).is_ok_and(|body| body.starts_with("head")) {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }

    let applied = manager
        .handle_commands(vec![command(CommandAction::StopRecording, "cam1", Some("S1"))])
        .await;
    assert_eq!(applied, 1);

    let report = manager.tick().await;
    assert!(report.uploaded.is_empty());
    assert!(transport.bodies.lock().unwrap().is_empty());
    let session = manager.store().get("S1").expect("tracked");
    assert_eq!(session.status(), SessionStatus::Stopped);
    assert!(session.has_process());

    let mut uploaded = false;
    for _ in 0..100 {
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        if !manager.tick().await.uploaded.is_empty() {
            uploaded = true;
            break;
        }
    }

    assert!(uploaded, "upload after the capture exited");
    assert_eq!(
        *transport.bodies.lock().unwrap(),
        vec![b"head\ntrailer\n".to_vec()]
    );
    assert_eq!(status_of(&manager, "S1"), SessionStatus::Uploaded);
    assert!(!path.exists());
}
