//! Device registry repository for `SQLite` persistence.
//!
//! Each registration is a single keyed upsert, so registrations for
//! different devices never touch each other's rows. Two registrations
//! for the same device race with last-writer-wins semantics.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;

use crate::models::device::{Device, DeviceStatus};
use crate::{AppError, Result};

use super::db::Database;

/// Repository for device registry records.
#[derive(Clone)]
pub struct DeviceRepo {
    db: Arc<Database>,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct DeviceRow {
    device_id: String,
    ip: Option<String>,
    last_seen: String,
    status: String,
    version: String,
    cameras: String,
    capabilities: String,
}

impl DeviceRow {
    fn into_device(self) -> Result<Device> {
        let status = parse_status(&self.status)?;
        let last_seen = chrono::DateTime::parse_from_rfc3339(&self.last_seen)
            .map_err(|e| AppError::Db(format!("invalid last_seen: {e}")))?
            .with_timezone(&Utc);
        let cameras: BTreeSet<String> = serde_json::from_str(&self.cameras)
            .map_err(|e| AppError::Db(format!("invalid cameras: {e}")))?;
        let capabilities: Vec<String> = serde_json::from_str(&self.capabilities)
            .map_err(|e| AppError::Db(format!("invalid capabilities: {e}")))?;

        Ok(Device {
            device_id: self.device_id,
            ip: self.ip,
            last_seen,
            status,
            version: self.version,
            cameras,
            capabilities,
        })
    }
}

fn parse_status(s: &str) -> Result<DeviceStatus> {
    match s {
        "online" => Ok(DeviceStatus::Online),
        other => Err(AppError::Db(format!("invalid device status: {other}"))),
    }
}

impl DeviceRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert or wholesale replace the record for `device.device_id`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the write fails.
    pub async fn upsert(&self, device: &Device) -> Result<Device> {
        let cameras = serde_json::to_string(&device.cameras)?;
        let capabilities = serde_json::to_string(&device.capabilities)?;

        sqlx::query(
            "INSERT INTO device (device_id, ip, last_seen, status, version, cameras, capabilities)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(device_id) DO UPDATE SET
                ip = excluded.ip,
                last_seen = excluded.last_seen,
                status = excluded.status,
                version = excluded.version,
                cameras = excluded.cameras,
                capabilities = excluded.capabilities",
        )
        .bind(&device.device_id)
        .bind(&device.ip)
        .bind(device.last_seen.to_rfc3339())
        .bind(device.status.as_str())
        .bind(&device.version)
        .bind(&cameras)
        .bind(&capabilities)
        .execute(self.db.as_ref())
        .await?;

        Ok(device.clone())
    }

    /// Retrieve a device by identifier.
    ///
    /// # Errors
    ///
    /// Returns `AppError::DeviceNotFound` if the device never registered,
    /// or `AppError::Db` if the query fails.
    pub async fn get(&self, device_id: &str) -> Result<Device> {
        let row: Option<DeviceRow> = sqlx::query_as(
            "SELECT device_id, ip, last_seen, status, version, cameras, capabilities
             FROM device WHERE device_id = ?1",
        )
        .bind(device_id)
        .fetch_optional(self.db.as_ref())
        .await?;

        row.ok_or_else(|| AppError::DeviceNotFound(device_id.to_owned()))?
            .into_device()
    }

    /// List all devices ordered by identifier.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list(&self) -> Result<Vec<Device>> {
        let rows: Vec<DeviceRow> = sqlx::query_as(
            "SELECT device_id, ip, last_seen, status, version, cameras, capabilities
             FROM device ORDER BY device_id ASC",
        )
        .fetch_all(self.db.as_ref())
        .await?;

        rows.into_iter().map(DeviceRow::into_device).collect()
    }
}
