//! Upload pipeline: deliver a finished recording and reclaim local space.
//!
//! The pipeline makes one attempt per call. Retrying is the caller's
//! job; the session manager simply calls again on its next cycle.

use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;

use tracing::{info, info_span, warn, Instrument};

use crate::{AppError, Result};

/// Moves recording bytes to the coordinator.
pub trait UploadTransport: Send + Sync {
    /// Send the file at `path` for `session_id` / `camera_id`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Transport` on connection failure or a non-2xx
    /// response, or `AppError::Io` if the file cannot be read.
    fn send(
        &self,
        path: &Path,
        session_id: &str,
        camera_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

/// Single-attempt upload with delete-on-success.
#[derive(Clone)]
pub struct UploadPipeline {
    transport: Arc<dyn UploadTransport>,
}

impl UploadPipeline {
    /// Create a pipeline over `transport`.
    #[must_use]
    pub fn new(transport: Arc<dyn UploadTransport>) -> Self {
        Self { transport }
    }

    /// Upload `path`, deleting it once the coordinator has accepted it.
    ///
    /// The local file is never removed when the transfer fails. A failed
    /// delete after a successful transfer is only logged.
    ///
    /// # Errors
    ///
    /// Returns `AppError::FileMissing` if `path` does not exist, or the
    /// transport error otherwise.
    pub async fn upload(&self, path: &Path, session_id: &str, camera_id: &str) -> Result<()> {
        let span = info_span!("upload", session_id, camera_id);
        async {
            if !tokio::fs::try_exists(path).await.unwrap_or(false) {
                return Err(AppError::FileMissing(path.display().to_string()));
            }

            self.transport.send(path, session_id, camera_id).await?;
            info!(path = %path.display(), "upload accepted");

            if let Err(err) = tokio::fs::remove_file(path).await {
                warn!(%err, path = %path.display(), "failed to delete uploaded recording");
            }
            Ok(())
        }
        .instrument(span)
        .await
    }
}
