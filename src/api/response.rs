//! Mapping of application errors onto HTTP responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::{error, warn};

use crate::AppError;

impl AppError {
    /// HTTP status an error is reported with.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::MissingField(_)
            | Self::InvalidCommand(_)
            | Self::InvalidUpload(_)
            | Self::Serialization(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::DeviceNotFound(_) | Self::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short client-facing message; server-side details stay in the log.
    #[must_use]
    pub fn public_message(&self) -> String {
        match self {
            Self::MissingField(field) => format!("Missing {field}"),
            Self::Unauthorized(_) => "Unauthorized".into(),
            Self::DeviceNotFound(_) => "Device not found".into(),
            Self::NotFound(_) => "Not found".into(),
            Self::InvalidCommand(msg) => format!("Invalid command: {msg}"),
            Self::InvalidUpload(msg) => format!("Invalid file upload: {msg}"),
            Self::Serialization(_) => "Invalid request body".into(),
            Self::WriteFailed(_) => "File store failed".into(),
            Self::EnqueueFailed(_) => "Command queue failed".into(),
            _ => "Internal server error".into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(err = %self, "request failed");
        } else {
            warn!(err = %self, status = status.as_u16(), "request rejected");
        }
        (status, Json(json!({ "error": self.public_message() }))).into_response()
    }
}
