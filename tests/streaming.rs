//! Streaming relay and buffered streaming.

mod common;

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use common::*;
use futures::StreamExt;
use keyrelay::config::StreamMode;
use keyrelay::router::Completion;
use serde_json::json;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

async fn collect(completion: Completion) -> Vec<io::Result<Bytes>> {
    match completion {
        Completion::Stream(stream) => stream.collect().await,
        other => panic!("expected a stream, got {:?}", other),
    }
}

fn text_of(items: &[io::Result<Bytes>]) -> String {
    items
        .iter()
        .filter_map(|item| item.as_ref().ok())
        .map(|bytes| String::from_utf8_lossy(bytes).to_string())
        .collect()
}

#[tokio::test]
async fn relays_upstream_sse_and_records_once() {
    let body = format!(
        "{}{}{}data: [DONE]\n\n",
        sse_chunk("Once upon ", None),
        sse_chunk("a time", None),
        sse_chunk("", Some("stop"))
    );

    let mut server = mockito::Server::new_async().await;
    let upstream = server
        .mock("POST", CHAT_PATH)
        .match_body(mockito::Matcher::PartialJson(json!({"stream": true})))
        .with_status(200)
        .with_header("content-type", "text/event-stream")
        .with_body(body.clone())
        .expect(1)
        .create_async()
        .await;

    let config = config(&server.url(), &[KEY_A, KEY_B]);
    let (coordinator, stats) = coordinator(&config);

    let items = collect(coordinator.complete(&chat_request(true)).await).await;
    upstream.assert_async().await;

    assert!(items.iter().all(|item| item.is_ok()));
    assert_eq!(text_of(&items), body);

    let snap = stats.snapshot();
    assert_eq!(snap.counters.total_requests, 1);
    assert_eq!(snap.counters.successful_requests, 1);
    assert_eq!(snap.counters.streamed_requests, 1);
    assert_eq!(snap.counters.truncated_responses, 0);
}

#[tokio::test]
async fn short_relayed_stream_is_recorded_not_retried() {
    let body = format!("{}data: [DONE]\n\n", sse_chunk("tiny", Some("stop")));

    let mut server = mockito::Server::new_async().await;
    let upstream = server
        .mock("POST", CHAT_PATH)
        .with_status(200)
        .with_header("content-type", "text/event-stream")
        .with_body(body)
        .expect(1)
        .create_async()
        .await;

    let mut config = config(&server.url(), &[KEY_A, KEY_B]);
    config.retry.min_response_length = 300;
    let (coordinator, stats) = coordinator(&config);

    let items = collect(coordinator.complete(&chat_request(true)).await).await;
    upstream.assert_async().await;
    assert!(items.iter().all(|item| item.is_ok()));

    let snap = stats.snapshot();
    assert_eq!(snap.counters.successful_requests, 1);
    assert_eq!(snap.counters.truncated_responses, 1);
}

#[derive(Clone, Default)]
struct Hits(Arc<AtomicUsize>);

async fn breaks_mid_stream(State(hits): State<Hits>) -> Response {
    hits.0.fetch_add(1, Ordering::SeqCst);

    let stream = async_stream::stream! {
        yield Ok::<_, io::Error>(Bytes::from(sse_chunk("Once upon", None)));
        tokio::time::sleep(Duration::from_millis(100)).await;
        yield Err(io::Error::new(io::ErrorKind::ConnectionReset, "upstream went away"));
    };

    Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .body(Body::from_stream(stream))
        .unwrap()
}

#[tokio::test]
async fn upstream_disconnect_mid_stream_fails_without_retry() {
    let hits = Hits::default();
    let upstream = Router::new()
        .route(CHAT_PATH, post(breaks_mid_stream))
        .with_state(hits.clone());
    let base_url = spawn_upstream(upstream).await;

    let config = config(&base_url, &[KEY_A, KEY_B]);
    let (coordinator, stats) = coordinator(&config);

    let items = collect(coordinator.complete(&chat_request(true)).await).await;

    // The caller sees the stream end in an error
    assert!(items.last().is_some_and(|item| item.is_err()));
    assert_eq!(hits.0.load(Ordering::SeqCst), 1);

    let snap = stats.snapshot();
    assert_eq!(snap.counters.total_requests, 1);
    assert_eq!(snap.counters.failed_requests, 1);
    assert_eq!(snap.counters.successful_requests, 0);
    assert_eq!(stats.snapshot_with_recent(0, 20).recent_errors.len(), 1);
}

async fn limited_then_streaming(State(hits): State<Hits>, headers: HeaderMap) -> Response {
    hits.0.fetch_add(1, Ordering::SeqCst);

    let auth = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if auth.ends_with(KEY_A) {
        return (StatusCode::TOO_MANY_REQUESTS, "quota exceeded").into_response();
    }

    let body = format!("{}data: [DONE]\n\n", sse_chunk("hello", Some("stop")));
    ([(header::CONTENT_TYPE, "text/event-stream")], body).into_response()
}

#[tokio::test]
async fn failure_before_first_byte_is_retried() {
    let hits = Hits::default();
    let upstream = Router::new()
        .route(CHAT_PATH, post(limited_then_streaming))
        .with_state(hits.clone());
    let base_url = spawn_upstream(upstream).await;

    let config = config(&base_url, &[KEY_A, KEY_B]);
    let (coordinator, stats) = coordinator(&config);

    let items = collect(coordinator.complete(&chat_request(true)).await).await;
    assert!(text_of(&items).contains("hello"));
    assert_eq!(hits.0.load(Ordering::SeqCst), 2);

    let snap = stats.snapshot();
    assert_eq!(snap.counters.successful_requests, 1);
    assert_eq!(snap.counters.rate_limited_requests, 0);
    assert_eq!(snap.status_codes.get(&429), Some(&1));
    assert!(coordinator.pool().health()[0].keys[0].cooldown_remaining_secs.is_some());
}

#[tokio::test]
async fn buffered_mode_retries_then_reemits_as_sse() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", CHAT_PATH)
        .match_header("authorization", bearer(KEY_A))
        .with_status(200)
        .with_body(completion_body("cut", "length"))
        .create_async()
        .await;
    server
        .mock("POST", CHAT_PATH)
        .match_header("authorization", bearer(KEY_B))
        .with_status(200)
        .with_body(completion_body(&"z".repeat(100), "stop"))
        .create_async()
        .await;

    let mut config = config(&server.url(), &[KEY_A, KEY_B]);
    config.streaming.mode = StreamMode::Buffered;
    let (coordinator, stats) = coordinator(&config);

    let items = collect(coordinator.complete(&chat_request(true)).await).await;
    let text = text_of(&items);

    // 100 characters in 50 chunks, a stop chunk and [DONE]
    assert_eq!(items.len(), 52);
    assert!(text.contains("\"finish_reason\":\"stop\""));
    assert!(text.ends_with("data: [DONE]\n\n"));

    let snap = stats.snapshot();
    assert_eq!(snap.counters.successful_requests, 1);
    assert_eq!(snap.counters.streamed_requests, 0);
    assert_eq!(snap.counters.total_attempts, 2);
}
