use super::error::ApiError;
use super::AppState;
use crate::api::ChatRequest;
use crate::router::Completion;
use axum::body::{Body, Bytes};
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

/// Error records returned by the logs endpoint
const RECENT_ERRORS_LIMIT: usize = 20;

/// `POST /v1/chat/completions`
pub async fn chat_completions(State(state): State<AppState>, body: Bytes) -> Response {
    let request: ChatRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            return ApiError::BadRequest(format!("Invalid request body: {}", e)).into_response()
        }
    };
    if let Err(e) = request.validate() {
        return ApiError::from(e).into_response();
    }

    tracing::info!(
        model = %request.model,
        stream = request.stream,
        messages = request.messages.len(),
        "chat completion request"
    );

    let runtime = state.runtime();
    match runtime.coordinator.complete(&request).await {
        Completion::Json(value) => Json(value).into_response(),
        Completion::Stream(stream) => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/event-stream")
            .header(header::CACHE_CONTROL, "no-cache")
            .header("x-accel-buffering", "no")
            .body(Body::from_stream(stream))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()),
        Completion::Failed(summary) => {
            tracing::warn!(attempts = summary.attempts, "{}", summary.message);
            ApiError::Upstream(summary).into_response()
        }
    }
}

/// `GET /api`
pub async fn status() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "message": "keyrelay is running"
    }))
}

/// `GET /api/stats`
pub async fn stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({ "stats": state.stats().snapshot() }))
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    #[serde(default = "default_logs_limit")]
    limit: usize,
}

fn default_logs_limit() -> usize {
    100
}

/// `GET /api/stats/logs?limit=N`
pub async fn logs(State(state): State<AppState>, Query(query): Query<LogsQuery>) -> impl IntoResponse {
    let snapshot = state
        .stats()
        .snapshot_with_recent(query.limit, RECENT_ERRORS_LIMIT);
    Json(json!({
        "logs": snapshot.recent_logs,
        "errors": snapshot.recent_errors,
    }))
}

/// `POST /api/stats/reset`
pub async fn reset_stats(State(state): State<AppState>) -> impl IntoResponse {
    state.stats().reset();
    tracing::info!("statistics reset");
    Json(json!({
        "status": "success",
        "message": "Statistics reset"
    }))
}

/// `GET /api/keys`
pub async fn keys(State(state): State<AppState>) -> impl IntoResponse {
    let runtime = state.runtime();
    let pool = runtime.coordinator.pool();
    let groups = pool.health();
    let available: usize = groups.iter().map(|g| g.available_keys).sum();

    Json(json!({
        "total_keys": pool.len(),
        "available_keys": available,
        "groups": groups,
    }))
}

/// `POST /api/config/reload`
pub async fn reload_config(State(state): State<AppState>) -> Response {
    match state.reload() {
        Ok(runtime) => Json(json!({
            "status": "success",
            "message": "Configuration reloaded",
            "total_keys": runtime.coordinator.pool().len(),
        }))
        .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "configuration reload failed");
            ApiError::Internal(e.to_string()).into_response()
        }
    }
}
