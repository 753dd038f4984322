//! Shared coordinator state and request extractors.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, FromRequestParts};
use axum::http::request::Parts;

use crate::config::ServerConfig;
use crate::persistence::db::Database;
use crate::persistence::device_repo::DeviceRepo;
use crate::persistence::mailbox_repo::MailboxRepo;
use crate::storage::UploadStore;

/// Shared application state handed to every request handler.
///
/// Handlers hold no state of their own; all coordination lives in the
/// database behind `db` and the upload directory behind `uploads`.
pub struct AppState {
    /// Coordinator configuration.
    pub config: Arc<ServerConfig>,
    /// Registry and mailbox database.
    pub db: Arc<Database>,
    /// Upload receiver storage.
    pub uploads: UploadStore,
}

impl AppState {
    /// Build state from configuration and an open database.
    #[must_use]
    pub fn new(config: Arc<ServerConfig>, db: Arc<Database>) -> Self {
        let uploads = UploadStore::new(config.storage_path.clone());
        Self {
            config,
            db,
            uploads,
        }
    }

    /// Device registry view over the shared database.
    #[must_use]
    pub fn devices(&self) -> DeviceRepo {
        DeviceRepo::new(Arc::clone(&self.db))
    }

    /// Command mailbox view over the shared database.
    #[must_use]
    pub fn mailbox(&self) -> MailboxRepo {
        MailboxRepo::new(Arc::clone(&self.db))
    }
}

/// Best-effort client address: first `X-Forwarded-For` hop, else the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIp(pub Option<String>);

impl<S> FromRequestParts<S> for ClientIp
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let forwarded = parts
            .headers
            .get("x-forwarded-for")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .map(str::trim)
            .filter(|hop| !hop.is_empty())
            .map(str::to_owned);

        let ip = forwarded.or_else(|| {
            parts
                .extensions
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip().to_string())
        });

        Ok(Self(ip))
    }
}
