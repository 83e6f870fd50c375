//! OpenAI-style error bodies.

use crate::client::ErrorKind;
use crate::error::RelayError;
use crate::router::FailureSummary;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

/// `{"error": {...}}`
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

/// Error detail within an error response.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorDetail {
    pub message: String,
    pub r#type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>, error_type: impl Into<String>) -> Self {
        Self {
            error: ErrorDetail {
                message: message.into(),
                r#type: error_type.into(),
                code: None,
            },
        }
    }

    pub fn with_code(
        message: impl Into<String>,
        error_type: impl Into<String>,
        code: impl Into<String>,
    ) -> Self {
        Self {
            error: ErrorDetail {
                message: message.into(),
                r#type: error_type.into(),
                code: Some(code.into()),
            },
        }
    }
}

/// An error the gateway returns to its caller
#[derive(Debug)]
pub enum ApiError {
    Unauthorized(&'static str),
    BadRequest(String),
    Upstream(FailureSummary),
    Internal(String),
}

impl From<RelayError> for ApiError {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::InvalidRequest(msg) => ApiError::BadRequest(msg),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Unauthorized(msg) => (
                StatusCode::UNAUTHORIZED,
                Json(ErrorResponse::with_code(
                    msg,
                    "invalid_request_error",
                    "invalid_api_key",
                )),
            )
                .into_response(),
            ApiError::BadRequest(msg) => (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse::new(msg, "invalid_request_error")),
            )
                .into_response(),
            ApiError::Internal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse::new(msg, "server_error")),
            )
                .into_response(),
            ApiError::Upstream(summary) => upstream_failure(summary),
        }
    }
}

fn upstream_failure(summary: FailureSummary) -> Response {
    // A rejected request is the caller's problem: pass the upstream answer through
    if let (Some(ErrorKind::Rejected), Some(status), Some(body)) =
        (summary.kind, summary.status, summary.upstream_body.as_ref())
    {
        let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_REQUEST);
        if serde_json::from_str::<serde_json::Value>(body).is_ok() {
            let mut response = (status, body.clone()).into_response();
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            );
            return response;
        }
        return (
            status,
            Json(ErrorResponse::with_code(body.clone(), "invalid_request_error", "rejected")),
        )
            .into_response();
    }

    let (status, error_type) = match summary.kind {
        Some(ErrorKind::RateLimited) => (StatusCode::TOO_MANY_REQUESTS, "rate_limit_error"),
        Some(ErrorKind::Timeout) => (StatusCode::GATEWAY_TIMEOUT, "timeout_error"),
        Some(ErrorKind::ServerUnavailable) | None => {
            (StatusCode::SERVICE_UNAVAILABLE, "service_unavailable")
        }
        Some(_) => (StatusCode::BAD_GATEWAY, "upstream_error"),
    };

    let code = summary
        .kind
        .map(|k| k.as_str())
        .unwrap_or("no_available_keys");

    (
        status,
        Json(ErrorResponse::with_code(summary.message, error_type, code)),
    )
        .into_response()
}
