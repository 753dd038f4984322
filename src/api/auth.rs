//! Static bearer-token authorization.

use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use sha2::{Digest, Sha256};

use crate::{AppError, Result};

/// Check that `headers` carry `Authorization: Bearer <expected>`.
///
/// Tokens are compared through their SHA-256 digests so the comparison
/// time does not depend on where the first differing byte is. An empty
/// `expected` token rejects everything.
///
/// # Errors
///
/// Returns `AppError::Unauthorized` if the header is missing, malformed,
/// or carries the wrong token.
pub fn authorize(headers: &HeaderMap, expected: &str) -> Result<()> {
    if expected.is_empty() {
        return Err(AppError::Unauthorized("no token configured".into()));
    }

    let provided = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or_else(|| AppError::Unauthorized("missing bearer token".into()))?;

    if Sha256::digest(provided.as_bytes()) == Sha256::digest(expected.as_bytes()) {
        Ok(())
    } else {
        Err(AppError::Unauthorized("invalid bearer token".into()))
    }
}
