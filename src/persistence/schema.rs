//! `SQLite` schema bootstrap logic.
//!
//! All table definitions use `CREATE TABLE IF NOT EXISTS`, safe to
//! re-run on every startup. Coordinator and agent share the bootstrap;
//! each only touches its own tables.

use sqlx::SqlitePool;

use crate::Result;

/// Apply all table definitions to the connected `SQLite` database.
///
/// # Errors
///
/// Returns `AppError::Db` if any DDL statement fails.
pub async fn bootstrap_schema(pool: &SqlitePool) -> Result<()> {
    let ddl = r"
CREATE TABLE IF NOT EXISTS device (
    device_id       TEXT PRIMARY KEY NOT NULL,
    ip              TEXT,
    last_seen       TEXT NOT NULL,
    status          TEXT NOT NULL CHECK(status IN ('online')),
    version         TEXT NOT NULL,
    cameras         TEXT NOT NULL,
    capabilities    TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS command_mailbox (
    device_id       TEXT NOT NULL,
    token           INTEGER NOT NULL,
    action          TEXT NOT NULL CHECK(action IN ('start_recording','stop_recording')),
    camera_id       TEXT NOT NULL,
    session_id      TEXT,
    duration        INTEGER,
    enqueued_at     TEXT NOT NULL,
    PRIMARY KEY (device_id, token)
);

CREATE TABLE IF NOT EXISTS agent_session (
    session_id          TEXT PRIMARY KEY NOT NULL,
    camera_id           TEXT NOT NULL,
    output_path         TEXT NOT NULL,
    start_time          TEXT NOT NULL,
    requested_duration  INTEGER NOT NULL,
    status              TEXT NOT NULL CHECK(status IN ('active','completed','stopped','uploading','uploaded','failed')),
    pid                 INTEGER,
    stop_requested      INTEGER NOT NULL DEFAULT 0,
    upload_attempts     INTEGER NOT NULL DEFAULT 0,
    last_error          TEXT
);
";

    sqlx::raw_sql(ddl).execute(pool).await?;
    Ok(())
}
