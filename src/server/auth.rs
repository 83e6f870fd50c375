//! Caller secret check.

use super::error::ApiError;
use super::AppState;
use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

/// Reject requests without `Authorization: Bearer <caller secret>`
pub async fn require_caller_secret(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let runtime = state.runtime();
    match check_bearer(request.headers(), &runtime.config.server.caller_secret) {
        Ok(()) => next.run(request).await,
        Err(e) => {
            tracing::debug!(path = %request.uri().path(), "rejected unauthenticated request");
            e.into_response()
        }
    }
}

fn check_bearer(headers: &HeaderMap, secret: &str) -> Result<(), ApiError> {
    let Some(value) = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) else {
        return Err(ApiError::Unauthorized("Missing API key"));
    };

    let Some(token) = value.strip_prefix("Bearer ") else {
        return Err(ApiError::Unauthorized("Authorization header must use the Bearer scheme"));
    };

    if secret.is_empty() || !constant_time_eq(token.trim().as_bytes(), secret.as_bytes()) {
        return Err(ApiError::Unauthorized("Invalid API key"));
    }

    Ok(())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
