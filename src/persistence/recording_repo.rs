//! Agent-side session journal for `SQLite` persistence.
//!
//! Mirrors the in-memory session store so that recordings survive an
//! agent restart. The store stays authoritative while the agent runs;
//! the journal is only read back on startup.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;

use crate::models::recording::{RecordingRecord, SessionStatus};
use crate::{AppError, Result};

use super::db::Database;

/// Repository for journaled recording sessions.
#[derive(Clone)]
pub struct RecordingRepo {
    db: Arc<Database>,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct RecordingRow {
    session_id: String,
    camera_id: String,
    output_path: String,
    start_time: String,
    requested_duration: i64,
    status: String,
    pid: Option<i64>,
    stop_requested: i64,
    upload_attempts: i64,
    last_error: Option<String>,
}

impl RecordingRow {
    fn into_record(self) -> Result<RecordingRecord> {
        let status = SessionStatus::parse(&self.status)
            .ok_or_else(|| AppError::Db(format!("invalid session status: {}", self.status)))?;
        let start_time = chrono::DateTime::parse_from_rfc3339(&self.start_time)
            .map_err(|e| AppError::Db(format!("invalid start_time: {e}")))?
            .with_timezone(&Utc);
        let requested_duration = u64::try_from(self.requested_duration)
            .map_err(|e| AppError::Db(format!("invalid requested_duration: {e}")))?;
        let pid = self
            .pid
            .map(u32::try_from)
            .transpose()
            .map_err(|e| AppError::Db(format!("invalid pid: {e}")))?;
        let upload_attempts = u32::try_from(self.upload_attempts)
            .map_err(|e| AppError::Db(format!("invalid upload_attempts: {e}")))?;

        Ok(RecordingRecord {
            session_id: self.session_id,
            camera_id: self.camera_id,
            output_path: PathBuf::from(self.output_path),
            start_time,
            requested_duration,
            status,
            pid,
            stop_requested: self.stop_requested != 0,
            upload_attempts,
            last_error: self.last_error,
        })
    }
}

impl RecordingRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert or replace the journal entry for `record.session_id`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the write fails.
    pub async fn save(&self, record: &RecordingRecord) -> Result<()> {
        let requested_duration = i64::try_from(record.requested_duration)
            .map_err(|e| AppError::Db(format!("requested_duration out of range: {e}")))?;

        sqlx::query(
            "INSERT INTO agent_session
                (session_id, camera_id, output_path, start_time, requested_duration,
                 status, pid, stop_requested, upload_attempts, last_error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(session_id) DO UPDATE SET
                status = excluded.status,
                pid = excluded.pid,
                stop_requested = excluded.stop_requested,
                upload_attempts = excluded.upload_attempts,
                last_error = excluded.last_error",
        )
        .bind(&record.session_id)
        .bind(&record.camera_id)
        .bind(record.output_path.to_string_lossy().into_owned())
        .bind(record.start_time.to_rfc3339())
        .bind(requested_duration)
        .bind(record.status.as_str())
        .bind(record.pid.map(i64::from))
        .bind(i64::from(record.stop_requested))
        .bind(i64::from(record.upload_attempts))
        .bind(&record.last_error)
        .execute(self.db.as_ref())
        .await?;

        Ok(())
    }

    /// Remove the journal entry for `session_id`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    pub async fn delete(&self, session_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM agent_session WHERE session_id = ?1")
            .bind(session_id)
            .execute(self.db.as_ref())
            .await?;
        Ok(())
    }

    /// Load every journaled session, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails or a row is malformed.
    pub async fn load_all(&self) -> Result<Vec<RecordingRecord>> {
        let rows: Vec<RecordingRow> = sqlx::query_as(
            "SELECT session_id, camera_id, output_path, start_time, requested_duration,
                    status, pid, stop_requested, upload_attempts, last_error
             FROM agent_session ORDER BY start_time ASC",
        )
        .fetch_all(self.db.as_ref())
        .await?;

        rows.into_iter().map(RecordingRow::into_record).collect()
    }
}
