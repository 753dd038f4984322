//! Endpoint handlers.
//!
//! | Endpoint          | Auth   | Purpose                              |
//! |-------------------|--------|--------------------------------------|
//! | `POST /register`  | none   | upsert a device record               |
//! | `POST /command`   | bearer | queue a command for a device         |
//! | `POST /check-commands` | bearer | drain a device's mailbox        |
//! | `POST /upload`    | bearer | store a finished recording           |
//! | `GET /status`     | none   | registry overview                    |

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::multipart::MultipartRejection;
use axum::extract::{Multipart, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, info_span, warn, Instrument};

use crate::models::command::{CommandAction, QueuedCommand, DEFAULT_CAMERA_ID};
use crate::models::device::{Device, DeviceSummary};
use crate::models::is_path_safe;
use crate::storage::{PendingUpload, StoredUpload};
use crate::{AppError, Result};

use super::auth::authorize;
use super::handler::{AppState, ClientIp};

/// Version recorded when a registration does not state one.
const DEFAULT_DEVICE_VERSION: &str = "1.0";

/// Device id used when a command names none; it never matches a real device.
const UNKNOWN_DEVICE_ID: &str = "unknown";

/// Session id recorded when an upload names none.
const UNKNOWN_SESSION_ID: &str = "unknown";

/// Parse a JSON body leniently: an empty body is the default value and no
/// particular content type is required.
fn parse_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    Ok(serde_json::from_slice(body)?)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

#[derive(Debug, Default, Deserialize)]
struct RegisterRequest {
    device_id: Option<String>,
    version: Option<String>,
    #[serde(default)]
    cameras: Vec<String>,
    #[serde(default)]
    capabilities: Vec<String>,
}

/// `POST /register`: upsert the full device record.
pub async fn register(
    State(state): State<Arc<AppState>>,
    ClientIp(ip): ClientIp,
    body: Bytes,
) -> Result<Json<Value>> {
    let request: RegisterRequest = parse_body(&body)?;
    let device_id =
        non_empty(request.device_id).ok_or_else(|| AppError::MissingField("device_id".into()))?;

    let device = Device::new(
        device_id,
        ip,
        non_empty(request.version).unwrap_or_else(|| DEFAULT_DEVICE_VERSION.into()),
        request.cameras,
        request.capabilities,
    );
    let saved = state.devices().upsert(&device).await?;

    info!(
        device_id = %saved.device_id,
        cameras = saved.cameras.len(),
        ip = saved.ip.as_deref().unwrap_or("-"),
        "device registered"
    );
    Ok(Json(json!({ "status": "success" })))
}

#[derive(Debug, Default, Deserialize)]
struct CommandRequest {
    device_id: Option<String>,
    camera_id: Option<String>,
    action: Option<String>,
    session_id: Option<String>,
    duration: Option<u64>,
}

/// `POST /command`: queue a command in the target device's mailbox.
pub async fn command(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>> {
    if let Err(err) = authorize(&headers, &state.config.auth_token) {
        warn!("unauthorized command attempt");
        return Err(err);
    }

    let request: CommandRequest = parse_body(&body)?;
    let device_id = non_empty(request.device_id).unwrap_or_else(|| UNKNOWN_DEVICE_ID.into());
    let camera_id = non_empty(request.camera_id).unwrap_or_else(|| DEFAULT_CAMERA_ID.into());
    let action_name = request.action.unwrap_or_default();
    let action = CommandAction::parse(&action_name)
        .ok_or_else(|| AppError::InvalidCommand(format!("unsupported action '{action_name}'")))?;
    let session_id = non_empty(request.session_id);
    if session_id.as_deref().is_some_and(|id| !is_path_safe(id)) {
        return Err(AppError::InvalidCommand("invalid session_id".into()));
    }

    info!(%device_id, %camera_id, action = action.as_str(), "command received");

    let command = QueuedCommand::new(device_id, action, camera_id, session_id, request.duration);
    let queued = state.mailbox().enqueue(&command).await?;

    info!(command_id = %queued.command_id, "command queued");
    Ok(Json(json!({ "status": "queued", "command_id": queued.command_id })))
}

#[derive(Debug, Default, Deserialize)]
struct CheckCommandsRequest {
    device_id: Option<String>,
}

/// `POST /check-commands`: hand over and remove every pending command.
pub async fn check_commands(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>> {
    authorize(&headers, &state.config.auth_token)?;

    let request: CheckCommandsRequest = parse_body(&body)?;
    let device_id =
        non_empty(request.device_id).ok_or_else(|| AppError::MissingField("device_id".into()))?;

    let commands = state
        .mailbox()
        .drain(&device_id)
        .instrument(info_span!("drain_mailbox", %device_id))
        .await?;

    for command in &commands {
        info!(command_id = %command.command_id, "command dispatched");
    }
    info!(%device_id, count = commands.len(), "commands sent");
    Ok(Json(json!({ "commands": commands })))
}

/// Text fields collected from the multipart form ahead of the file.
#[derive(Debug, Default)]
struct UploadFields {
    device_id: Option<String>,
    camera_id: Option<String>,
    session_id: Option<String>,
}

/// `POST /upload`: persist a multipart `video` field.
///
/// The `device_id`, `camera_id` and `session_id` text fields must precede
/// the `video` field so the file can be streamed straight to its directory.
pub async fn upload(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    multipart: std::result::Result<Multipart, MultipartRejection>,
) -> Result<Json<Value>> {
    authorize(&headers, &state.config.auth_token)?;

    let mut multipart =
        multipart.map_err(|err| AppError::InvalidUpload(format!("expected multipart form: {err}")))?;
    let mut fields = UploadFields::default();
    let mut stored: Option<StoredUpload> = None;

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|err| AppError::InvalidUpload(err.body_text()))?
    {
        let name = field.name().unwrap_or_default().to_owned();
        match name.as_str() {
            "device_id" | "camera_id" | "session_id" => {
                let value = field
                    .text()
                    .await
                    .map_err(|err| AppError::InvalidUpload(err.body_text()))?;
                let slot = match name.as_str() {
                    "device_id" => &mut fields.device_id,
                    "camera_id" => &mut fields.camera_id,
                    _ => &mut fields.session_id,
                };
                *slot = non_empty(Some(value));
            }
            "video" if stored.is_none() => {
                let device_id = fields
                    .device_id
                    .clone()
                    .ok_or_else(|| AppError::InvalidUpload("missing device_id".into()))?;
                let camera_id = fields
                    .camera_id
                    .clone()
                    .unwrap_or_else(|| DEFAULT_CAMERA_ID.into());
                let session_id = fields
                    .session_id
                    .clone()
                    .unwrap_or_else(|| UNKNOWN_SESSION_ID.into());
                info!(%device_id, %camera_id, %session_id, "upload started");

                let mut pending: PendingUpload = state
                    .uploads
                    .begin(&device_id, &camera_id, &session_id, field.file_name())
                    .await?;
                while let Some(chunk) = field
                    .chunk()
                    .await
                    .map_err(|err| AppError::InvalidUpload(err.body_text()))?
                {
                    pending.write_chunk(&chunk).await?;
                }
                stored = Some(pending.commit().await?);
            }
            _ => {
                // Unknown fields are drained and ignored.
            }
        }
    }

    let stored = stored.ok_or_else(|| AppError::InvalidUpload("no file".into()))?;
    #[allow(clippy::cast_precision_loss)]
    let megabytes = stored.bytes as f64 / 1024.0 / 1024.0;
    info!(
        path = %stored.relative_path,
        size_mb = format!("{megabytes:.2}"),
        "upload stored"
    );
    Ok(Json(json!({ "status": "success", "path": stored.relative_path })))
}

/// `GET /status`: coordinator and registry overview.
pub async fn status(State(state): State<Arc<AppState>>) -> Result<Json<Value>> {
    let devices = state.devices().list().await?;
    let ids: Vec<&str> = devices.iter().map(|d| d.device_id.as_str()).collect();
    let info: BTreeMap<&str, DeviceSummary> = devices
        .iter()
        .map(|d| (d.device_id.as_str(), d.summary()))
        .collect();

    Ok(Json(json!({
        "status": "running",
        "devices": ids,
        "devices_info": info,
        "time": Utc::now().to_rfc3339(),
    })))
}

/// Fallback for unknown routes and unsupported methods.
pub async fn not_found() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "error": "Not found",
            "endpoints": {
                "POST /register": "Device registration",
                "POST /command": "Send command to device",
                "POST /check-commands": "Check pending commands",
                "POST /upload": "Upload video file",
                "GET /status": "Server status",
            }
        })),
    )
}
