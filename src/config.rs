//! Configuration parsing, validation, and credential loading for both
//! the coordinator and the recording agent.

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::models::is_path_safe;
use crate::{AppError, Result};

/// Keyring service name under which the shared bearer token is stored.
pub const KEYRING_SERVICE: &str = "camfleet";

/// Environment variable consulted when the keychain has no token.
pub const TOKEN_ENV_VAR: &str = "CAMFLEET_AUTH_TOKEN";

fn default_bind_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_http_port() -> u16 {
    8000
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("storage")
}

fn default_db_path() -> PathBuf {
    PathBuf::from("camfleet.db")
}

fn default_max_upload_bytes() -> u64 {
    2 * 1024 * 1024 * 1024
}

/// Coordinator configuration parsed from `server.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ServerConfig {
    /// Interface the HTTP listener binds to.
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,
    /// HTTP port; `0` lets the OS pick one.
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// Root directory for uploaded recordings.
    #[serde(default = "default_storage_path")]
    pub storage_path: PathBuf,
    /// `SQLite` file holding the device registry and command mailbox.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Upper bound on a single `/upload` request body.
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: u64,
    /// Shared bearer token (populated at runtime).
    #[serde(skip)]
    pub auth_token: String,
}

impl ServerConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load the bearer token from OS keychain with env-var fallback.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if neither source provides a token.
    pub async fn load_credentials(&mut self) -> Result<()> {
        self.auth_token = load_credential("auth_token", TOKEN_ENV_VAR).await?;
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.max_upload_bytes == 0 {
            return Err(AppError::Config(
                "max_upload_bytes must be greater than zero".into(),
            ));
        }
        if self.storage_path.as_os_str().is_empty() {
            return Err(AppError::Config("storage_path must not be empty".into()));
        }
        Ok(())
    }
}

/// External capture command template.
///
/// The placeholders `{url}`, `{duration}` and `{output}` are substituted
/// in every argument before the process is spawned.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct CaptureConfig {
    /// Capture binary.
    #[serde(default = "default_capture_program")]
    pub program: String,
    /// Argument template.
    #[serde(default = "default_capture_args")]
    pub args: Vec<String>,
}

fn default_capture_program() -> String {
    "ffmpeg".into()
}

fn default_capture_args() -> Vec<String> {
    [
        "-rtsp_transport",
        "tcp",
        "-i",
        "{url}",
        "-t",
        "{duration}",
        "-c:v",
        "copy",
        "{output}",
    ]
    .into_iter()
    .map(str::to_owned)
    .collect()
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            program: default_capture_program(),
            args: default_capture_args(),
        }
    }
}

impl CaptureConfig {
    /// Substitute the placeholders into the argument template.
    #[must_use]
    pub fn render_args(&self, url: &str, duration_seconds: u64, output: &Path) -> Vec<String> {
        let duration = duration_seconds.to_string();
        let output = output.to_string_lossy();
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{url}", url)
                    .replace("{duration}", &duration)
                    .replace("{output}", &output)
            })
            .collect()
    }
}

fn default_device_id() -> String {
    device_id_for_host(&local_hostname())
}

fn default_version() -> String {
    env!("CARGO_PKG_VERSION").into()
}

fn default_capabilities() -> Vec<String> {
    vec!["video_recording".into(), "camera_control".into()]
}

fn default_check_interval() -> u64 {
    5
}

fn default_error_backoff() -> u64 {
    10
}

fn default_retention_seconds() -> u64 {
    3600
}

fn default_duration_seconds() -> u64 {
    300
}

fn default_control_timeout() -> u64 {
    10
}

fn default_upload_timeout() -> u64 {
    300
}

/// Agent configuration parsed from `agent.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct AgentConfig {
    /// Identifier reported to the coordinator.
    #[serde(default = "default_device_id")]
    pub device_id: String,
    /// Base URL of the coordinator, e.g. `http://10.8.0.1:8000`.
    pub central_server: String,
    /// Agent software version reported on registration.
    #[serde(default = "default_version")]
    pub version: String,
    /// Camera identifier to stream URL.
    pub cameras: BTreeMap<String, String>,
    /// Capabilities advertised on registration.
    #[serde(default = "default_capabilities")]
    pub capabilities: Vec<String>,
    /// Directory for in-progress recordings and the session journal.
    pub temp_dir: PathBuf,
    /// Pause between cycles.
    #[serde(default = "default_check_interval")]
    pub check_interval_seconds: u64,
    /// Pause after a failed cycle.
    #[serde(default = "default_error_backoff")]
    pub error_backoff_seconds: u64,
    /// Age after which terminal sessions are dropped from the store.
    #[serde(default = "default_retention_seconds")]
    pub retention_seconds: u64,
    /// Recording length used when a command carries no duration.
    #[serde(default = "default_duration_seconds")]
    pub default_duration_seconds: u64,
    /// Timeout for register and command-poll calls.
    #[serde(default = "default_control_timeout")]
    pub control_timeout_seconds: u64,
    /// Timeout for a single upload.
    #[serde(default = "default_upload_timeout")]
    pub upload_timeout_seconds: u64,
    /// Capture process template.
    #[serde(default)]
    pub capture: CaptureConfig,
    /// Shared bearer token (populated at runtime).
    #[serde(skip)]
    pub auth_token: String,
}

impl AgentConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load the bearer token from OS keychain with env-var fallback.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if neither source provides a token.
    pub async fn load_credentials(&mut self) -> Result<()> {
        self.auth_token = load_credential("auth_token", TOKEN_ENV_VAR).await?;
        Ok(())
    }

    /// Stream URL for a configured camera.
    #[must_use]
    pub fn camera_url(&self, camera_id: &str) -> Option<&str> {
        self.cameras.get(camera_id).map(String::as_str)
    }

    /// Local output file for a recording session.
    #[must_use]
    pub fn output_path(&self, session_id: &str) -> PathBuf {
        self.temp_dir.join(format!("{session_id}.mp4"))
    }

    /// Session journal database file.
    #[must_use]
    pub fn journal_path(&self) -> PathBuf {
        self.temp_dir.join("agent.db")
    }

    /// Pause between successful cycles.
    #[must_use]
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_seconds)
    }

    /// Pause after a failed cycle.
    #[must_use]
    pub fn error_backoff(&self) -> Duration {
        Duration::from_secs(self.error_backoff_seconds)
    }

    /// Timeout for control-plane requests.
    #[must_use]
    pub fn control_timeout(&self) -> Duration {
        Duration::from_secs(self.control_timeout_seconds)
    }

    /// Timeout for uploads.
    #[must_use]
    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_timeout_seconds)
    }

    /// Check field constraints and normalise `central_server`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` describing the first invalid field.
    pub fn validate(&mut self) -> Result<()> {
        if self.cameras.is_empty() {
            return Err(AppError::Config("cameras must not be empty".into()));
        }
        if !is_path_safe(&self.device_id) {
            return Err(AppError::Config(format!(
                "device_id '{}' must be a non-empty name of letters, digits, '-', '_' or '.'",
                self.device_id
            )));
        }
        if let Some(camera_id) = self.cameras.keys().find(|id| !is_path_safe(id)) {
            return Err(AppError::Config(format!("invalid camera id '{camera_id}'")));
        }
        if self.check_interval_seconds == 0 {
            return Err(AppError::Config(
                "check_interval_seconds must be greater than zero".into(),
            ));
        }

        let url = reqwest::Url::parse(&self.central_server)
            .map_err(|err| AppError::Config(format!("central_server invalid: {err}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(AppError::Config(
                "central_server must be an http or https url".into(),
            ));
        }
        // Endpoint paths are appended verbatim.
        self.central_server = self.central_server.trim_end_matches('/').to_owned();

        if self.capture.program.trim().is_empty() {
            return Err(AppError::Config("capture.program must not be empty".into()));
        }

        Ok(())
    }
}

/// Derive the default agent identifier from a host name.
///
/// Produces `AGENT-` followed by the first eight hex digits of the
/// SHA-256 digest of `hostname`.
#[must_use]
pub fn device_id_for_host(hostname: &str) -> String {
    let digest = Sha256::digest(hostname.as_bytes());
    let prefix: String = digest
        .iter()
        .take(4)
        .map(|byte| format!("{byte:02x}"))
        .collect();
    format!("AGENT-{prefix}")
}

#[cfg(unix)]
fn local_hostname() -> String {
    nix::unistd::gethostname().map_or_else(
        |_| "localhost".to_owned(),
        |name| name.to_string_lossy().into_owned(),
    )
}

#[cfg(not(unix))]
fn local_hostname() -> String {
    env::var("COMPUTERNAME").unwrap_or_else(|_| "localhost".to_owned())
}

/// Load a single credential from OS keychain with env-var fallback.
async fn load_credential(keyring_key: &str, env_key: &str) -> Result<String> {
    let key = keyring_key.to_owned();

    // keyring is synchronous I/O.
    let keychain_result = tokio::task::spawn_blocking(move || {
        keyring::Entry::new(KEYRING_SERVICE, &key).and_then(|entry| entry.get_password())
    })
    .await
    .map_err(|err| AppError::Config(format!("keychain task panicked: {err}")))?;

    match keychain_result {
        Ok(value) if !value.is_empty() => return Ok(value),
        Ok(_) => {
            warn!(key = keyring_key, "keychain entry is empty, trying env var");
        }
        Err(err) => {
            warn!(
                key = keyring_key,
                ?err,
                "keychain lookup failed, trying env var"
            );
        }
    }

    match env::var(env_key) {
        Ok(value) if !value.is_empty() => Ok(value),
        _ => Err(AppError::Config(format!(
            "credential {keyring_key} not found in keychain or {env_key} env var"
        ))),
    }
}
