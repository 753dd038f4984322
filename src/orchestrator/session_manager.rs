//! Recording session lifecycle on the agent.
//!
//! The manager is the only writer of the [`SessionStore`]. It starts and
//! stops recordings in response to commands and, once per cycle, runs
//! [`SessionManager::tick`]: probe every `Active` session once, wait for
//! stopped captures to exit, make one upload attempt per finished
//! session, then drop sessions older than the retention window. Every transition is mirrored into the optional
//! journal so sessions survive an agent restart.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::AgentConfig;
use crate::models::command::{CommandAction, QueuedCommand};
use crate::models::is_path_safe;
use crate::models::recording::{RecordingRecord, SessionStatus};
use crate::persistence::recording_repo::RecordingRepo;
use crate::{AppError, Result};

use super::session_store::{SessionStore, StopOutcome};
use super::supervisor::ProcessSupervisor;
use super::uploader::UploadPipeline;

/// What one [`SessionManager::tick`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// `Active` sessions probed.
    pub probed: usize,
    /// Sessions whose process was found to have exited.
    pub completed: Vec<String>,
    /// Stopped sessions whose process has now exited.
    pub finalized: Vec<String>,
    /// Sessions delivered to the coordinator.
    pub uploaded: Vec<String>,
    /// Sessions whose upload attempt failed and will be retried.
    pub upload_failed: Vec<String>,
    /// Sessions whose output file was missing.
    pub failed: Vec<String>,
    /// Sessions dropped after the retention window.
    pub purged: Vec<String>,
    /// Purged sessions that were never uploaded.
    pub abandoned: Vec<String>,
}

/// Slack past the requested duration within which a journaled process
/// may still be the capture this agent started.
const ADOPTION_GRACE_SECONDS: i64 = 60;

/// Whether a capture started at `record.start_time` could still be running
/// at `now`. Outside this window a live pid belongs to some other process.
fn within_capture_window(record: &RecordingRecord, now: DateTime<Utc>) -> bool {
    let allowed = i64::try_from(record.requested_duration)
        .ok()
        .and_then(|secs| secs.checked_add(ADOPTION_GRACE_SECONDS))
        .and_then(Duration::try_seconds)
        .unwrap_or(Duration::MAX);
    record
        .start_time
        .checked_add_signed(allowed)
        .map_or(true, |deadline| now < deadline)
}

/// Owner of the agent's recording sessions.
pub struct SessionManager {
    config: Arc<AgentConfig>,
    supervisor: Arc<dyn ProcessSupervisor>,
    uploads: UploadPipeline,
    store: SessionStore,
    journal: Option<RecordingRepo>,
}

impl SessionManager {
    /// Create a manager with an empty store and no journal.
    #[must_use]
    pub fn new(
        config: Arc<AgentConfig>,
        supervisor: Arc<dyn ProcessSupervisor>,
        uploads: UploadPipeline,
    ) -> Self {
        Self {
            config,
            supervisor,
            uploads,
            store: SessionStore::new(),
            journal: None,
        }
    }

    /// Mirror every session change into `journal`.
    #[must_use]
    pub fn with_journal(mut self, journal: RecordingRepo) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Read-only view of the sessions.
    #[must_use]
    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// Reload sessions from the journal after a restart.
    ///
    /// `Active` and `Stopped` sessions whose process is still running, and
    /// which are still inside their capture window, are adopted; the rest
    /// are treated as finished recordings so their upload resumes.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the journal cannot be read.
    pub async fn restore(&mut self) -> Result<usize> {
        let Some(journal) = self.journal.clone() else {
            return Ok(0);
        };

        let records = journal.load_all().await?;
        let now = Utc::now();
        let mut restored = 0;
        for record in records {
            let session_id = record.session_id.clone();
            let process = match (record.status, record.pid) {
                (SessionStatus::Active | SessionStatus::Stopped, Some(pid))
                    if !within_capture_window(&record, now) =>
                {
                    warn!(
                        %session_id,
                        pid,
                        "journaled pid is past its capture window, not adopting"
                    );
                    None
                }
                (SessionStatus::Active | SessionStatus::Stopped, Some(pid)) => {
                    let mut handle = self.supervisor.adopt(pid);
                    if handle.is_live() {
                        info!(%session_id, pid, "adopted running capture process");
                        Some(handle)
                    } else {
                        info!(%session_id, pid, "capture process ended while agent was down");
                        None
                    }
                }
                _ => None,
            };

            match self.store.insert_restored(record, process) {
                Ok(_) => {
                    restored += 1;
                    self.persist(&session_id).await;
                }
                Err(err) => warn!(%session_id, %err, "skipping journaled session"),
            }
        }

        info!(count = restored, "sessions restored from journal");
        Ok(restored)
    }

    /// Start recording `camera_id`.
    ///
    /// A missing `session_id` gets a generated `rec_<uuid>` id and a
    /// missing `duration` falls back to the configured default.
    ///
    /// # Errors
    ///
    /// Returns `AppError::UnknownCamera` if the camera is not configured,
    /// `AppError::InvalidCommand` for an unusable session id,
    /// `AppError::SessionExists` if the id is already tracked, and
    /// `AppError::SpawnFailure` if the capture process cannot be started.
    /// No session is created on error.
    pub async fn start_recording(
        &mut self,
        camera_id: &str,
        session_id: Option<String>,
        duration: Option<u64>,
    ) -> Result<String> {
        let session_id = session_id.unwrap_or_else(|| format!("rec_{}", Uuid::new_v4()));
        let span = info_span!("start_recording", %session_id, camera_id);

        async {
            let camera_url = self
                .config
                .camera_url(camera_id)
                .ok_or_else(|| AppError::UnknownCamera(camera_id.to_owned()))?
                .to_owned();
            if !is_path_safe(&session_id) {
                return Err(AppError::InvalidCommand(format!(
                    "invalid session_id '{session_id}'"
                )));
            }
            if self.store.contains(&session_id) {
                return Err(AppError::SessionExists(session_id.clone()));
            }

            let duration = duration.unwrap_or(self.config.default_duration_seconds);
            let output_path = self.config.output_path(&session_id);
            let process = self
                .supervisor
                .spawn(&camera_url, &output_path, duration)
                .await?;

            let record = RecordingRecord {
                session_id: session_id.clone(),
                camera_id: camera_id.to_owned(),
                output_path,
                start_time: Utc::now(),
                requested_duration: duration,
                status: SessionStatus::Active,
                pid: None,
                stop_requested: false,
                upload_attempts: 0,
                last_error: None,
            };
            self.store.insert_active(record, process)?;
            self.persist(&session_id).await;

            info!(duration, "recording started");
            Ok(session_id.clone())
        }
        .instrument(span)
        .await
    }

    /// Stop an `Active` recording.
    ///
    /// Returns the resulting status: `Stopped` when the process was
    /// signalled, `Completed` when it had already exited. The stop
    /// request is recorded on the session in both cases.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the session is unknown or no
    /// longer `Active`, and `AppError::SignalFailure` if the signal could
    /// not be delivered (the session then stays `Active`).
    pub async fn stop_recording(&mut self, session_id: &str) -> Result<SessionStatus> {
        let span = info_span!("stop_recording", session_id);
        async {
            let outcome = self.store.stop(session_id)?;
            self.persist(session_id).await;

            let status = match outcome {
                StopOutcome::Signalled => {
                    info!("recording stopped");
                    SessionStatus::Stopped
                }
                StopOutcome::AlreadyExited => {
                    info!("recording had already finished");
                    SessionStatus::Completed
                }
            };
            Ok(status)
        }
        .instrument(span)
        .await
    }

    /// Apply a batch of drained commands in order.
    ///
    /// A failing command is logged and does not prevent the rest of the
    /// batch. Returns the number of commands applied successfully.
    pub async fn handle_commands(&mut self, commands: Vec<QueuedCommand>) -> usize {
        let mut applied = 0;
        for command in commands {
            let result = match command.action {
                CommandAction::StartRecording => self
                    .start_recording(
                        &command.camera_id,
                        command.session_id.clone(),
                        command.duration,
                    )
                    .await
                    .map(|_| ()),
                CommandAction::StopRecording => match command.session_id.as_deref() {
                    Some(session_id) => self.stop_recording(session_id).await.map(|_| ()),
                    None => Err(AppError::InvalidCommand(
                        "stop_recording without session_id".into(),
                    )),
                },
                CommandAction::Unknown => {
                    warn!(command_id = %command.command_id, "skipping unknown command");
                    continue;
                }
            };

            match result {
                Ok(()) => applied += 1,
                Err(err) => warn!(
                    command_id = %command.command_id,
                    action = command.action.as_str(),
                    %err,
                    "command failed"
                ),
            }
        }
        applied
    }

    /// Run one cycle at the current time. Never fails.
    pub async fn tick(&mut self) -> TickReport {
        self.tick_at(Utc::now()).await
    }

    /// Run one cycle as of `now`. Never fails.
    pub async fn tick_at(&mut self, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();

        for session_id in self.store.ids_with_status(SessionStatus::Active) {
            report.probed += 1;
            if self.store.probe(&session_id) == Some(false) {
                match self.store.transition(&session_id, SessionStatus::Completed) {
                    Ok(()) => {
                        info!(%session_id, "recording completed");
                        self.persist(&session_id).await;
                        report.completed.push(session_id);
                    }
                    Err(err) => error!(%session_id, %err, "failed to complete session"),
                }
            }
        }

        for session_id in self.store.finalizing_ids() {
            if self.store.probe(&session_id) == Some(false) {
                info!(%session_id, "stopped capture exited");
                self.persist(&session_id).await;
                report.finalized.push(session_id);
            }
        }

        for session_id in self.store.upload_pending_ids() {
            self.attempt_upload(&session_id, &mut report).await;
        }

        let retention = i64::try_from(self.config.retention_seconds)
            .ok()
            .and_then(Duration::try_seconds)
            .unwrap_or(Duration::MAX);
        for record in self.store.purge_expired(now, retention) {
            if record.status.is_upload_pending() {
                warn!(
                    event = "recording_abandoned",
                    session_id = %record.session_id,
                    path = %record.output_path.display(),
                    attempts = record.upload_attempts,
                    "recording dropped before it was uploaded"
                );
                report.abandoned.push(record.session_id.clone());
            } else {
                info!(
                    session_id = %record.session_id,
                    status = record.status.as_str(),
                    "session expired"
                );
            }
            self.forget(&record.session_id).await;
            report.purged.push(record.session_id);
        }

        info!(
            active = self.store.ids_with_status(SessionStatus::Active).len(),
            pending_upload = self.store.upload_pending_ids().len(),
            tracked = self.store.len(),
            "cycle complete"
        );
        report
    }

    async fn attempt_upload(&mut self, session_id: &str, report: &mut TickReport) {
        let Some((path, camera_id)) = self
            .store
            .get(session_id)
            .map(|s| (s.record().output_path.clone(), s.record().camera_id.clone()))
        else {
            return;
        };

        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            self.mark_failed(session_id, &path, report).await;
            return;
        }

        if let Err(err) = self.store.begin_upload(session_id) {
            error!(session_id, %err, "cannot begin upload");
            return;
        }

        let result = self.uploads.upload(&path, session_id, &camera_id).await;
        let missing = matches!(result, Err(AppError::FileMissing(_)));
        let outcome = result.map_err(|err| err.to_string());
        let failed_with = outcome.as_ref().err().cloned();

        match self.store.finish_upload(session_id, outcome) {
            Ok(SessionStatus::Uploaded) => {
                info!(session_id, "recording delivered");
                report.uploaded.push(session_id.to_owned());
            }
            Ok(_) if missing => {
                self.mark_failed(session_id, &path, report).await;
                return;
            }
            Ok(_) => {
                warn!(
                    session_id,
                    error = failed_with.as_deref().unwrap_or("unknown"),
                    "upload failed, will retry"
                );
                report.upload_failed.push(session_id.to_owned());
            }
            Err(err) => error!(session_id, %err, "failed to settle upload"),
        }
        self.persist(session_id).await;
    }

    async fn mark_failed(&mut self, session_id: &str, path: &Path, report: &mut TickReport) {
        match self.store.transition(session_id, SessionStatus::Failed) {
            Ok(()) => {
                self.store
                    .note_error(session_id, format!("output file missing: {}", path.display()));
                warn!(session_id, path = %path.display(), "recording file missing");
                report.failed.push(session_id.to_owned());
                self.persist(session_id).await;
            }
            Err(err) => error!(session_id, %err, "failed to mark session failed"),
        }
    }

    /// Write the session's current record to the journal, if any.
    async fn persist(&self, session_id: &str) {
        let (Some(journal), Some(session)) = (&self.journal, self.store.get(session_id)) else {
            return;
        };
        if let Err(err) = journal.save(session.record()).await {
            warn!(session_id, %err, "failed to journal session");
        }
    }

    async fn forget(&self, session_id: &str) {
        if let Some(journal) = &self.journal {
            if let Err(err) = journal.delete(session_id).await {
                warn!(session_id, %err, "failed to remove session from journal");
            }
        }
    }
}
