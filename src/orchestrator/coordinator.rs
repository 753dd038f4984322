//! HTTP client for the coordinator, used by the agent.
//!
//! Control calls (`/register`, `/check-commands`) use the short control
//! timeout; uploads use the long upload timeout.

use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::time::Duration;

use reqwest::multipart::{Form, Part};
use reqwest::{Body, Client, RequestBuilder, Response};
use serde::Deserialize;
use serde_json::json;
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

use crate::config::AgentConfig;
use crate::models::command::QueuedCommand;
use crate::{AppError, Result};

use super::uploader::UploadTransport;

/// Longest response body excerpt carried in a transport error.
const MAX_DETAIL_LEN: usize = 200;

#[derive(Debug, Deserialize)]
struct CommandsResponse {
    #[serde(default)]
    commands: Vec<QueuedCommand>,
}

/// Agent-side client for one coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorClient {
    http: Client,
    base_url: String,
    device_id: String,
    auth_token: String,
    control_timeout: Duration,
    upload_timeout: Duration,
}

impl CoordinatorClient {
    /// Build a client from agent configuration.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the HTTP client cannot be built.
    pub fn new(config: &AgentConfig) -> Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("camfleet-agent/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| AppError::Config(format!("failed to build http client: {err}")))?;

        Ok(Self {
            http,
            base_url: config.central_server.clone(),
            device_id: config.device_id.clone(),
            auth_token: config.auth_token.clone(),
            control_timeout: config.control_timeout(),
            upload_timeout: config.upload_timeout(),
        })
    }

    fn post(&self, path: &str, timeout: Duration) -> RequestBuilder {
        self.http
            .post(format!("{}{path}", self.base_url))
            .bearer_auth(&self.auth_token)
            .timeout(timeout)
    }

    /// Register this device with its cameras and capabilities.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Transport` if the coordinator is unreachable or
    /// rejects the registration.
    pub async fn register(&self, config: &AgentConfig) -> Result<()> {
        let cameras: Vec<&str> = config.cameras.keys().map(String::as_str).collect();
        let body = json!({
            "device_id": self.device_id,
            "version": config.version,
            "cameras": cameras,
            "capabilities": config.capabilities,
        });

        let response = self
            .post("/register", self.control_timeout)
            .json(&body)
            .send()
            .await?;
        ensure_success(response).await?;

        info!(device_id = %self.device_id, cameras = cameras.len(), "registered with coordinator");
        Ok(())
    }

    /// Fetch and thereby drain this device's pending commands.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Transport` on connection failure, a non-2xx
    /// response, or a body that is not the expected JSON shape.
    pub async fn check_commands(&self) -> Result<Vec<QueuedCommand>> {
        let response = self
            .post("/check-commands", self.control_timeout)
            .json(&json!({ "device_id": self.device_id }))
            .send()
            .await?;
        let response = ensure_success(response).await?;
        let body: CommandsResponse = response.json().await?;

        debug!(count = body.commands.len(), "commands fetched");
        Ok(body.commands)
    }

    async fn send_recording(&self, path: &Path, session_id: &str, camera_id: &str) -> Result<()> {
        let file = tokio::fs::File::open(path).await?;
        let length = file.metadata().await?.len();
        let video = Part::stream_with_length(Body::wrap_stream(ReaderStream::new(file)), length)
            .file_name("recording.mp4")
            .mime_str("video/mp4")?;

        // Text fields precede the file so the coordinator can stream it.
        let form = Form::new()
            .text("device_id", self.device_id.clone())
            .text("session_id", session_id.to_owned())
            .text("camera_id", camera_id.to_owned())
            .part("video", video);

        let response = self
            .post("/upload", self.upload_timeout)
            .multipart(form)
            .send()
            .await?;
        ensure_success(response).await?;

        info!(session_id, bytes = length, "recording uploaded");
        Ok(())
    }
}

impl UploadTransport for CoordinatorClient {
    fn send(
        &self,
        path: &Path,
        session_id: &str,
        camera_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let path = path.to_path_buf();
        let session_id = session_id.to_owned();
        let camera_id = camera_id.to_owned();
        Box::pin(async move { self.send_recording(&path, &session_id, &camera_id).await })
    }
}

/// Turn a non-2xx response into `AppError::Transport`.
async fn ensure_success(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let mut detail = response.text().await.unwrap_or_default();
    if detail.len() > MAX_DETAIL_LEN {
        let cut = (0..=MAX_DETAIL_LEN)
            .rev()
            .find(|i| detail.is_char_boundary(*i))
            .unwrap_or(0);
        detail.truncate(cut);
    }
    if detail.is_empty() {
        detail = status.canonical_reason().unwrap_or("request failed").to_owned();
    }

    Err(AppError::Transport {
        status: Some(status.as_u16()),
        detail,
    })
}
