//! Upload receiver storage.
//!
//! Recordings land under `<root>/<device_id>/<camera_id>/` with a name
//! built from the receive time and the session id. Bytes are streamed
//! into a hidden temporary file in the target directory and only become
//! visible through a no-clobber rename once the payload is complete, so
//! a stored artifact is never partial and never overwritten.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::models::is_path_safe;
use crate::{AppError, Result};

/// Extension used when the uploaded filename carries none.
pub const DEFAULT_EXTENSION: &str = "mp4";

/// Name attempts made before giving up on a free file name.
const MAX_NAME_ATTEMPTS: u32 = 8;

/// Result of a successfully stored upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredUpload {
    /// Path relative to the storage root, `<device>/<camera>/<file>`.
    pub relative_path: String,
    /// Absolute location on disk.
    pub absolute_path: PathBuf,
    /// Payload size.
    pub bytes: u64,
}

/// Filesystem-backed store for uploaded recordings.
#[derive(Debug, Clone)]
pub struct UploadStore {
    root: PathBuf,
}

impl UploadStore {
    /// Create a store rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Storage root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Store a complete in-memory payload.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidUpload` for unsafe identifiers or an empty
    /// payload, and `AppError::WriteFailed` if the file cannot be written.
    pub async fn accept(
        &self,
        device_id: &str,
        camera_id: &str,
        session_id: &str,
        file_name: Option<&str>,
        bytes: &[u8],
    ) -> Result<StoredUpload> {
        let mut pending = self
            .begin(device_id, camera_id, session_id, file_name)
            .await?;
        pending.write_chunk(bytes).await?;
        pending.commit().await
    }

    /// Open a streaming upload into the scoped directory.
    ///
    /// The directory is created on demand. Nothing becomes visible until
    /// [`PendingUpload::commit`] succeeds; dropping the pending upload
    /// discards it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidUpload` for identifiers that are not a
    /// single safe path segment, and `AppError::WriteFailed` if the
    /// directory or temporary file cannot be created.
    pub async fn begin(
        &self,
        device_id: &str,
        camera_id: &str,
        session_id: &str,
        file_name: Option<&str>,
    ) -> Result<PendingUpload> {
        for (field, value) in [
            ("device_id", device_id),
            ("camera_id", camera_id),
            ("session_id", session_id),
        ] {
            if !is_path_safe(value) {
                return Err(AppError::InvalidUpload(format!("invalid {field}")));
            }
        }

        let dir = self.root.join(device_id).join(camera_id);
        if !tokio::fs::try_exists(&dir).await.unwrap_or(false) {
            tokio::fs::create_dir_all(&dir).await.map_err(|err| {
                AppError::WriteFailed(format!("cannot create {}: {err}", dir.display()))
            })?;
            info!(dir = %dir.display(), "created storage directory");
        }

        let temp = tempfile::Builder::new()
            .prefix(".upload-")
            .suffix(".part")
            .tempfile_in(&dir)
            .map_err(|err| AppError::WriteFailed(format!("cannot create temp file: {err}")))?;
        let handle = temp
            .reopen()
            .map_err(|err| AppError::WriteFailed(format!("cannot open temp file: {err}")))?;

        Ok(PendingUpload {
            temp,
            file: tokio::fs::File::from_std(handle),
            dir,
            prefix: format!("{device_id}/{camera_id}"),
            session_id: session_id.to_owned(),
            extension: extension_of(file_name),
            written: 0,
        })
    }
}

/// An upload being streamed to disk.
#[derive(Debug)]
pub struct PendingUpload {
    temp: NamedTempFile,
    file: tokio::fs::File,
    dir: PathBuf,
    prefix: String,
    session_id: String,
    extension: String,
    written: u64,
}

impl PendingUpload {
    /// Append a chunk of payload.
    ///
    /// # Errors
    ///
    /// Returns `AppError::WriteFailed` if the write fails.
    pub async fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        self.file
            .write_all(chunk)
            .await
            .map_err(|err| AppError::WriteFailed(format!("write failed: {err}")))?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    /// Bytes written so far.
    #[must_use]
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Flush and publish the upload under its final name.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidUpload` if no bytes were written, or
    /// `AppError::WriteFailed` if flushing or renaming fails.
    pub async fn commit(mut self) -> Result<StoredUpload> {
        if self.written == 0 {
            return Err(AppError::InvalidUpload("empty file".into()));
        }

        self.file
            .flush()
            .await
            .map_err(|err| AppError::WriteFailed(format!("flush failed: {err}")))?;
        self.file
            .sync_all()
            .await
            .map_err(|err| AppError::WriteFailed(format!("sync failed: {err}")))?;

        let Self {
            mut temp,
            file,
            dir,
            prefix,
            session_id,
            extension,
            written,
        } = self;
        drop(file);

        let stamp = Utc::now().format("%Y%m%d-%H%M%S-%3f").to_string();
        for attempt in 0..MAX_NAME_ATTEMPTS {
            let file_name = if attempt == 0 {
                format!("{stamp}_{session_id}.{extension}")
            } else {
                format!("{stamp}_{session_id}-{attempt}.{extension}")
            };
            let target = dir.join(&file_name);

            match temp.persist_noclobber(&target) {
                Ok(_) => {
                    return Ok(StoredUpload {
                        relative_path: format!("{prefix}/{file_name}"),
                        absolute_path: target,
                        bytes: written,
                    });
                }
                Err(err) if err.error.kind() == ErrorKind::AlreadyExists => {
                    warn!(target = %target.display(), "upload name taken, retrying");
                    temp = err.file;
                }
                Err(err) => {
                    return Err(AppError::WriteFailed(format!(
                        "cannot move upload into place: {}",
                        err.error
                    )));
                }
            }
        }

        Err(AppError::WriteFailed("no free file name".into()))
    }
}

/// Lowercased extension of `file_name`, or [`DEFAULT_EXTENSION`].
fn extension_of(file_name: Option<&str>) -> String {
    file_name
        .and_then(|name| Path::new(name).extension())
        .and_then(|ext| ext.to_str())
        .filter(|ext| {
            !ext.is_empty() && ext.len() <= 8 && ext.chars().all(|c| c.is_ascii_alphanumeric())
        })
        .map_or_else(|| DEFAULT_EXTENSION.to_owned(), str::to_ascii_lowercase)
}
