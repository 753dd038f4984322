//! HTTP listener for the coordinator.
//!
//! Builds the axum router over [`AppState`], binds the configured
//! address, and serves until the cancellation token fires.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{DefaultBodyLimit, Request};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::ServerConfig;
use crate::{AppError, Result};

use super::handler::AppState;
use super::routes;

/// Build the coordinator router.
///
/// Unknown paths and unsupported methods share the same 404 body.
#[must_use]
pub fn router(state: Arc<AppState>) -> Router {
    let body_limit = usize::try_from(state.config.max_upload_bytes).unwrap_or(usize::MAX);

    Router::new()
        .route("/register", post(routes::register))
        .route("/command", post(routes::command))
        .route("/check-commands", post(routes::check_commands))
        .route("/upload", post(routes::upload))
        .route("/status", get(routes::status))
        .method_not_allowed_fallback(routes::not_found)
        .fallback(routes::not_found)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(middleware::from_fn(log_request))
        .with_state(state)
}

async fn log_request(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let started = Instant::now();

    let response = next.run(request).await;

    info!(
        %method,
        %path,
        status = response.status().as_u16(),
        elapsed_ms = started.elapsed().as_millis(),
        "request handled"
    );
    response
}

/// Bind the configured address.
///
/// # Errors
///
/// Returns `AppError::Config` if the address cannot be bound.
pub async fn bind(config: &ServerConfig) -> Result<TcpListener> {
    let addr = SocketAddr::new(config.bind_address, config.http_port);
    TcpListener::bind(addr)
        .await
        .map_err(|err| AppError::Config(format!("failed to bind {addr}: {err}")))
}

/// Serve requests on `listener` until `ct` is cancelled.
///
/// # Errors
///
/// Returns `AppError::Io` if the server loop fails.
pub async fn serve(
    state: Arc<AppState>,
    listener: TcpListener,
    ct: CancellationToken,
) -> Result<()> {
    let local = listener.local_addr()?;
    info!(addr = %local, storage = %state.uploads.root().display(), "coordinator listening");

    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { ct.cancelled().await })
    .await?;

    info!("coordinator shut down");
    Ok(())
}
