//! Recording commands exchanged through the per-device mailbox.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Camera assumed when a command names none.
pub const DEFAULT_CAMERA_ID: &str = "default";

/// Action carried by a command.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CommandAction {
    /// Start a new recording session.
    StartRecording,
    /// Stop a running recording session.
    StopRecording,
    /// Anything this build does not understand; skipped by agents.
    #[default]
    #[serde(other)]
    Unknown,
}

impl CommandAction {
    /// Parse a wire action name, returning `None` for unsupported values.
    #[must_use]
    pub fn parse(action: &str) -> Option<Self> {
        match action {
            "start_recording" => Some(Self::StartRecording),
            "stop_recording" => Some(Self::StopRecording),
            _ => None,
        }
    }

    /// Wire and persisted string form.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StartRecording => "start_recording",
            Self::StopRecording => "stop_recording",
            Self::Unknown => "unknown",
        }
    }
}

fn default_camera_id() -> String {
    DEFAULT_CAMERA_ID.into()
}

/// A command waiting in, or just drained from, a device mailbox.
///
/// Every field except `action` tolerates absence on the wire so that an
/// agent can still act on partially specified commands.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueuedCommand {
    /// Mailbox entry name, `<device_id>_<token>`.
    #[serde(default)]
    pub command_id: String,
    /// Target device.
    #[serde(default)]
    pub device_id: String,
    /// Requested action.
    #[serde(default)]
    pub action: CommandAction,
    /// Target camera on the device.
    #[serde(default = "default_camera_id")]
    pub camera_id: String,
    /// Recording session the command refers to.
    #[serde(default)]
    pub session_id: Option<String>,
    /// Requested recording length in seconds.
    #[serde(default)]
    pub duration: Option<u64>,
    /// When the command entered the mailbox.
    #[serde(default)]
    pub enqueued_at: Option<DateTime<Utc>>,
}

impl QueuedCommand {
    /// Build a command for `device_id`; the mailbox assigns `command_id`.
    #[must_use]
    pub fn new(
        device_id: String,
        action: CommandAction,
        camera_id: String,
        session_id: Option<String>,
        duration: Option<u64>,
    ) -> Self {
        Self {
            command_id: String::new(),
            device_id,
            action,
            camera_id,
            session_id,
            duration,
            enqueued_at: None,
        }
    }
}
