//! In-memory table of recording sessions.
//!
//! The store enforces the session lifecycle: every status change goes
//! through [`SessionStatus::can_transition_to`]. A session holds a
//! process handle while it is `Active`, and after a stop until the
//! process is seen to exit; a recording is not offered for upload while
//! its process may still be writing. Only the session manager owns a
//! mutable store; everything else sees it through `&SessionStore`.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};

use crate::models::recording::{RecordingRecord, SessionStatus};
use crate::{AppError, Result};

use super::supervisor::ProcessHandle;

/// One recording session: its durable record plus the live process.
#[derive(Debug)]
pub struct RecordingSession {
    record: RecordingRecord,
    process: Option<ProcessHandle>,
    /// Status to fall back to when an upload does not succeed.
    resume_status: Option<SessionStatus>,
}

impl RecordingSession {
    /// Durable view of the session.
    #[must_use]
    pub fn record(&self) -> &RecordingRecord {
        &self.record
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        self.record.status
    }

    /// Whether a process handle is held.
    #[must_use]
    pub fn has_process(&self) -> bool {
        self.process.is_some()
    }

    fn set_status(&mut self, next: SessionStatus) -> Result<()> {
        let current = self.record.status;
        if !current.can_transition_to(next) {
            return Err(AppError::InvalidCommand(format!(
                "session {} cannot move from {} to {}",
                self.record.session_id,
                current.as_str(),
                next.as_str()
            )));
        }
        self.record.status = next;
        if !matches!(next, SessionStatus::Active | SessionStatus::Stopped) {
            self.release();
        }
        Ok(())
    }

    fn release(&mut self) {
        self.process = None;
        self.record.pid = None;
    }
}

/// Outcome of a stop request on an `Active` session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Termination signal delivered.
    Signalled,
    /// Process had already exited; the session is `Completed`.
    AlreadyExited,
}

/// Sessions keyed by `session_id`.
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: BTreeMap<String, RecordingSession>,
}

impl SessionStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tracked sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no sessions are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Look up a session.
    #[must_use]
    pub fn get(&self, session_id: &str) -> Option<&RecordingSession> {
        self.sessions.get(session_id)
    }

    /// Whether `session_id` is tracked.
    #[must_use]
    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    /// All sessions ordered by id.
    pub fn sessions(&self) -> impl Iterator<Item = &RecordingSession> {
        self.sessions.values()
    }

    /// Ids of sessions currently in `status`.
    #[must_use]
    pub fn ids_with_status(&self, status: SessionStatus) -> Vec<String> {
        self.sessions
            .values()
            .filter(|s| s.record.status == status)
            .map(|s| s.record.session_id.clone())
            .collect()
    }

    /// Ids of sessions waiting for upload whose process has exited.
    #[must_use]
    pub fn upload_pending_ids(&self) -> Vec<String> {
        self.sessions
            .values()
            .filter(|s| s.record.status.is_upload_pending() && s.process.is_none())
            .map(|s| s.record.session_id.clone())
            .collect()
    }

    /// Ids of stopped sessions whose process has not yet been seen to exit.
    #[must_use]
    pub fn finalizing_ids(&self) -> Vec<String> {
        self.sessions
            .values()
            .filter(|s| s.record.status == SessionStatus::Stopped && s.process.is_some())
            .map(|s| s.record.session_id.clone())
            .collect()
    }

    /// Track a freshly started recording.
    ///
    /// # Errors
    ///
    /// Returns `AppError::SessionExists` if the id is already tracked.
    pub fn insert_active(
        &mut self,
        mut record: RecordingRecord,
        process: ProcessHandle,
    ) -> Result<&RecordingRecord> {
        if self.sessions.contains_key(&record.session_id) {
            return Err(AppError::SessionExists(record.session_id));
        }
        record.status = SessionStatus::Active;
        record.pid = process.pid();
        let id = record.session_id.clone();
        let session = self.sessions.entry(id).or_insert(RecordingSession {
            record,
            process: Some(process),
            resume_status: None,
        });
        Ok(&session.record)
    }

    /// Track a session recovered from the journal.
    ///
    /// An `Active` record is only kept as `Active` when `process` is given;
    /// otherwise it becomes `Completed`. A `Stopped` record keeps `process`
    /// until it exits. An interrupted upload resumes from `Completed`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::SessionExists` if the id is already tracked.
    pub fn insert_restored(
        &mut self,
        mut record: RecordingRecord,
        process: Option<ProcessHandle>,
    ) -> Result<&RecordingRecord> {
        if self.sessions.contains_key(&record.session_id) {
            return Err(AppError::SessionExists(record.session_id));
        }

        let process = match record.status {
            SessionStatus::Active | SessionStatus::Stopped if process.is_some() => process,
            SessionStatus::Active | SessionStatus::Uploading => {
                record.status = SessionStatus::Completed;
                None
            }
            _ => None,
        };
        record.pid = process.as_ref().and_then(ProcessHandle::pid);

        let id = record.session_id.clone();
        let session = self.sessions.entry(id).or_insert(RecordingSession {
            record,
            process,
            resume_status: None,
        });
        Ok(&session.record)
    }

    /// Probe the process of an `Active` or finalizing `Stopped` session.
    ///
    /// A `Stopped` session whose process has exited drops its handle,
    /// which makes it eligible for upload. Returns `None` when the session
    /// is unknown or has no process to probe.
    pub fn probe(&mut self, session_id: &str) -> Option<bool> {
        let session = self.sessions.get_mut(session_id)?;
        match session.record.status {
            SessionStatus::Active => {
                Some(session.process.as_mut().is_some_and(ProcessHandle::is_live))
            }
            SessionStatus::Stopped => {
                let live = session.process.as_mut()?.is_live();
                if !live {
                    session.release();
                }
                Some(live)
            }
            _ => None,
        }
    }

    /// Move a session to `next` along a permitted edge.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown session and
    /// `AppError::InvalidCommand` for a forbidden transition.
    pub fn transition(&mut self, session_id: &str, next: SessionStatus) -> Result<()> {
        self.get_mut(session_id)?.set_status(next)
    }

    /// Stop an `Active` session.
    ///
    /// A live process is signalled and the session becomes `Stopped`,
    /// keeping the handle until the process exits; a process that already
    /// exited leaves the session `Completed`. Either way the stop request
    /// is recorded on the session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the session is unknown or not
    /// `Active`, and `AppError::SignalFailure` if the signal could not be
    /// delivered, in which case the session stays `Active`.
    pub fn stop(&mut self, session_id: &str) -> Result<StopOutcome> {
        let session = self
            .sessions
            .get_mut(session_id)
            .filter(|s| s.record.status == SessionStatus::Active)
            .ok_or_else(|| AppError::NotFound(format!("no active session {session_id}")))?;

        let live = session.process.as_mut().is_some_and(ProcessHandle::is_live);
        if live {
            if let Some(process) = session.process.as_mut() {
                process.terminate()?;
            }
            session.record.stop_requested = true;
            session.set_status(SessionStatus::Stopped)?;
            Ok(StopOutcome::Signalled)
        } else {
            session.record.stop_requested = true;
            session.set_status(SessionStatus::Completed)?;
            Ok(StopOutcome::AlreadyExited)
        }
    }

    /// Mark an upload-pending session as `Uploading`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown session and
    /// `AppError::InvalidCommand` if it is not waiting for upload or its
    /// process may still be writing.
    pub fn begin_upload(&mut self, session_id: &str) -> Result<()> {
        let session = self.get_mut(session_id)?;
        if session.process.is_some() {
            return Err(AppError::InvalidCommand(format!(
                "session {session_id} is still finalizing"
            )));
        }
        let prior = session.record.status;
        session.set_status(SessionStatus::Uploading)?;
        session.resume_status = Some(prior);
        Ok(())
    }

    /// Settle an `Uploading` session.
    ///
    /// On success the session becomes `Uploaded`. On failure it returns
    /// to the status it had before the attempt, with the attempt counted
    /// and the error kept.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown session and
    /// `AppError::InvalidCommand` if it is not `Uploading`.
    pub fn finish_upload(
        &mut self,
        session_id: &str,
        outcome: std::result::Result<(), String>,
    ) -> Result<SessionStatus> {
        let session = self.get_mut(session_id)?;
        let resume = session.resume_status.unwrap_or(SessionStatus::Completed);
        let next = match &outcome {
            Ok(()) => SessionStatus::Uploaded,
            Err(_) => resume,
        };
        session.set_status(next)?;
        session.resume_status = None;
        session.record.upload_attempts = session.record.upload_attempts.saturating_add(1);
        session.record.last_error = outcome.err();
        Ok(next)
    }

    /// Record an error against a session without changing its status.
    pub fn note_error(&mut self, session_id: &str, error: impl Into<String>) {
        if let Some(session) = self.sessions.get_mut(session_id) {
            session.record.last_error = Some(error.into());
        }
    }

    /// Remove terminal sessions older than `retention`.
    ///
    /// A session exactly `retention` old is kept. `Active` and
    /// `Uploading` sessions are never removed.
    pub fn purge_expired(&mut self, now: DateTime<Utc>, retention: Duration) -> Vec<RecordingRecord> {
        let expired: Vec<String> = self
            .sessions
            .values()
            .filter(|s| s.record.status.is_terminal())
            .filter(|s| now.signed_duration_since(s.record.start_time) > retention)
            .map(|s| s.record.session_id.clone())
            .collect();

        expired
            .iter()
            .filter_map(|id| self.sessions.remove(id))
            .map(|s| s.record)
            .collect()
    }

    fn get_mut(&mut self, session_id: &str) -> Result<&mut RecordingSession> {
        self.sessions
            .get_mut(session_id)
            .ok_or_else(|| AppError::NotFound(format!("no session {session_id}")))
    }
}
