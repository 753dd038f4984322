//! Error types shared across the coordinator and the agent.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Persistence failure when interacting with `SQLite`.
    Db(String),
    /// File-system or I/O operation failure.
    Io(String),
    /// A required request field was absent (registration and command checks).
    MissingField(String),
    /// Caller did not present a valid bearer token.
    Unauthorized(String),
    /// Command body carried an unsupported action or malformed field.
    InvalidCommand(String),
    /// Target device has never registered with the coordinator.
    DeviceNotFound(String),
    /// A command could not be written to the mailbox.
    EnqueueFailed(String),
    /// The capture process could not be started.
    SpawnFailure(String),
    /// The termination signal could not be delivered.
    SignalFailure(String),
    /// The recording to upload does not exist on local storage.
    FileMissing(String),
    /// Network or non-2xx failure talking to the coordinator.
    Transport {
        /// HTTP status, when a response was received at all.
        status: Option<u16>,
        /// Short description of the failure.
        detail: String,
    },
    /// Uploaded payload was absent or failed validation.
    InvalidUpload(String),
    /// Uploaded payload could not be persisted.
    WriteFailed(String),
    /// Requested entity does not exist.
    NotFound(String),
    /// Camera identifier is not configured on this agent.
    UnknownCamera(String),
    /// A session with the same identifier is already tracked.
    SessionExists(String),
    /// JSON encoding or decoding failure.
    Serialization(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Db(msg) => write!(f, "db: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
            Self::MissingField(msg) => write!(f, "missing field: {msg}"),
            Self::Unauthorized(msg) => write!(f, "unauthorized: {msg}"),
            Self::InvalidCommand(msg) => write!(f, "invalid command: {msg}"),
            Self::DeviceNotFound(msg) => write!(f, "device not found: {msg}"),
            Self::EnqueueFailed(msg) => write!(f, "enqueue failed: {msg}"),
            Self::SpawnFailure(msg) => write!(f, "spawn failure: {msg}"),
            Self::SignalFailure(msg) => write!(f, "signal failure: {msg}"),
            Self::FileMissing(msg) => write!(f, "file missing: {msg}"),
            Self::Transport {
                status: Some(code),
                detail,
            } => write!(f, "transport: HTTP {code}: {detail}"),
            Self::Transport {
                status: None,
                detail,
            } => write!(f, "transport: {detail}"),
            Self::InvalidUpload(msg) => write!(f, "invalid upload: {msg}"),
            Self::WriteFailed(msg) => write!(f, "write failed: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::UnknownCamera(msg) => write!(f, "unknown camera: {msg}"),
            Self::SessionExists(msg) => write!(f, "session exists: {msg}"),
            Self::Serialization(msg) => write!(f, "serialization: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        Self::Db(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport {
            status: err.status().map(|s| s.as_u16()),
            detail: err.to_string(),
        }
    }
}
