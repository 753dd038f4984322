//! Recording session status and its persisted journal record.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a recording session on the agent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Capture process running.
    Active,
    /// Capture process exited on its own (or was already gone when stopped).
    Completed,
    /// Capture process was signalled to stop.
    Stopped,
    /// Upload in flight.
    Uploading,
    /// Recording delivered to the coordinator.
    Uploaded,
    /// Output file was missing when the upload was due.
    Failed,
}

impl SessionStatus {
    /// Determine whether a lifecycle transition is permitted.
    ///
    /// `Uploading` may fall back to either settled status; the store
    /// additionally checks that it falls back to the one it came from.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Active, Self::Completed | Self::Stopped)
                | (
                    Self::Completed | Self::Stopped,
                    Self::Uploading | Self::Failed
                )
                | (
                    Self::Uploading,
                    Self::Uploaded | Self::Completed | Self::Stopped
                )
        )
    }

    /// Recording finished and waiting for upload.
    #[must_use]
    pub fn is_upload_pending(self) -> bool {
        matches!(self, Self::Completed | Self::Stopped)
    }

    /// No automatic transition other than garbage collection follows.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Stopped | Self::Uploaded | Self::Failed
        )
    }

    /// Persisted string form.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Stopped => "stopped",
            Self::Uploading => "uploading",
            Self::Uploaded => "uploaded",
            Self::Failed => "failed",
        }
    }

    /// Parse the persisted string form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "completed" => Some(Self::Completed),
            "stopped" => Some(Self::Stopped),
            "uploading" => Some(Self::Uploading),
            "uploaded" => Some(Self::Uploaded),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Durable snapshot of a recording session, without the live process handle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecordingRecord {
    /// Session identifier.
    pub session_id: String,
    /// Camera the recording reads from.
    pub camera_id: String,
    /// Local file the capture process writes.
    pub output_path: PathBuf,
    /// When the capture process was started.
    pub start_time: DateTime<Utc>,
    /// Requested length in seconds.
    pub requested_duration: u64,
    /// Current status.
    pub status: SessionStatus,
    /// OS process id while the session is `Active`.
    pub pid: Option<u32>,
    /// A stop command was received for this session.
    pub stop_requested: bool,
    /// Upload attempts made so far.
    pub upload_attempts: u32,
    /// Most recent upload or processing error.
    pub last_error: Option<String>,
}
