//! Per-device command mailbox for `SQLite` persistence.
//!
//! Entries are keyed by `(device_id, token)`. The token is the enqueue
//! time in microseconds, bumped past the newest existing token for the
//! device so that two commands enqueued within the same microsecond
//! still get distinct, ordered names.
//!
//! Draining is a single `DELETE … RETURNING` statement: every entry handed
//! back is removed in the same atomic step, and a concurrent drain for
//! the same device sees either all of them or none.

use std::sync::Arc;

use chrono::Utc;

use crate::models::command::{CommandAction, QueuedCommand};
use crate::{AppError, Result};

use super::db::Database;

/// Repository for queued command records.
#[derive(Clone)]
pub struct MailboxRepo {
    db: Arc<Database>,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct MailboxRow {
    device_id: String,
    token: i64,
    action: String,
    camera_id: String,
    session_id: Option<String>,
    duration: Option<i64>,
    enqueued_at: String,
}

impl MailboxRow {
    fn into_command(self) -> Result<QueuedCommand> {
        let action = CommandAction::parse(&self.action)
            .ok_or_else(|| AppError::Db(format!("invalid command action: {}", self.action)))?;
        let enqueued_at = chrono::DateTime::parse_from_rfc3339(&self.enqueued_at)
            .map_err(|e| AppError::Db(format!("invalid enqueued_at: {e}")))?
            .with_timezone(&Utc);
        let duration = self
            .duration
            .map(u64::try_from)
            .transpose()
            .map_err(|e| AppError::Db(format!("invalid duration: {e}")))?;

        Ok(QueuedCommand {
            command_id: command_id(&self.device_id, self.token),
            device_id: self.device_id,
            action,
            camera_id: self.camera_id,
            session_id: self.session_id,
            duration,
            enqueued_at: Some(enqueued_at),
        })
    }
}

/// Mailbox entry name for `device_id` and `token`.
#[must_use]
pub fn command_id(device_id: &str, token: i64) -> String {
    format!("{device_id}_{token}")
}

impl MailboxRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Append `command` to the mailbox of `command.device_id`.
    ///
    /// The insert only happens when the device is registered; the check
    /// and the write are one statement.
    ///
    /// # Errors
    ///
    /// Returns `AppError::DeviceNotFound` if the device never registered,
    /// `AppError::InvalidCommand` for an unsupported action, or
    /// `AppError::EnqueueFailed` if the write fails.
    pub async fn enqueue(&self, command: &QueuedCommand) -> Result<QueuedCommand> {
        if command.action == CommandAction::Unknown {
            return Err(AppError::InvalidCommand("unsupported action".into()));
        }

        let now = Utc::now();
        let duration = command
            .duration
            .map(i64::try_from)
            .transpose()
            .map_err(|e| AppError::InvalidCommand(format!("duration out of range: {e}")))?;

        let inserted: Option<(i64,)> = sqlx::query_as(
            "INSERT INTO command_mailbox
                (device_id, token, action, camera_id, session_id, duration, enqueued_at)
             SELECT ?1,
                    MAX(?2, COALESCE((SELECT MAX(token) + 1 FROM command_mailbox WHERE device_id = ?1), 0)),
                    ?3, ?4, ?5, ?6, ?7
             WHERE EXISTS (SELECT 1 FROM device WHERE device_id = ?1)
             RETURNING token",
        )
        .bind(&command.device_id)
        .bind(now.timestamp_micros())
        .bind(command.action.as_str())
        .bind(&command.camera_id)
        .bind(&command.session_id)
        .bind(duration)
        .bind(now.to_rfc3339())
        .fetch_optional(self.db.as_ref())
        .await
        .map_err(|err| AppError::EnqueueFailed(err.to_string()))?;

        let Some((token,)) = inserted else {
            return Err(AppError::DeviceNotFound(command.device_id.clone()));
        };

        let mut queued = command.clone();
        queued.command_id = command_id(&command.device_id, token);
        queued.enqueued_at = Some(now);
        Ok(queued)
    }

    /// Remove and return every pending command for `device_id`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the statement fails; nothing is removed
    /// in that case.
    pub async fn drain(&self, device_id: &str) -> Result<Vec<QueuedCommand>> {
        let mut rows: Vec<MailboxRow> = sqlx::query_as(
            "DELETE FROM command_mailbox WHERE device_id = ?1
             RETURNING device_id, token, action, camera_id, session_id, duration, enqueued_at",
        )
        .bind(device_id)
        .fetch_all(self.db.as_ref())
        .await?;

        // RETURNING does not guarantee row order.
        rows.sort_by_key(|row| row.token);
        rows.into_iter().map(MailboxRow::into_command).collect()
    }

    /// List pending commands for `device_id` without removing them.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn peek(&self, device_id: &str) -> Result<Vec<QueuedCommand>> {
        let rows: Vec<MailboxRow> = sqlx::query_as(
            "SELECT device_id, token, action, camera_id, session_id, duration, enqueued_at
             FROM command_mailbox WHERE device_id = ?1
             ORDER BY token ASC",
        )
        .bind(device_id)
        .fetch_all(self.db.as_ref())
        .await?;

        rows.into_iter().map(MailboxRow::into_command).collect()
    }
}
