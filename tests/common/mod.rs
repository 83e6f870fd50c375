//! Shared helpers for the integration tests.
#![allow(dead_code)]

use keyrelay::api::{ChatRequest, Message};
use keyrelay::config::{GatewayConfig, KeyGroupConfig};
use keyrelay::router::RetryCoordinator;
use keyrelay::stats::StatsCollector;
use std::sync::Arc;

pub const CALLER_SECRET: &str = "test-caller-secret";
pub const KEY_A: &str = "AIzaSyTestKeyA00001";
pub const KEY_B: &str = "AIzaSyTestKeyB00002";
pub const KEY_C: &str = "AIzaSyTestKeyC00003";
pub const KEY_D: &str = "AIzaSyTestKeyD00004";

pub const CHAT_PATH: &str = "/chat/completions";

/// Config pointing at a test upstream, one group with the given keys,
/// no backoff and no length check.
pub fn config(base_url: &str, keys: &[&str]) -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.server.caller_secret = CALLER_SECRET.to_string();
    config.upstream.base_url = base_url.to_string();
    config.upstream.chat_path = CHAT_PATH.to_string();
    config.retry.backoff_initial_ms = 0;
    config.retry.min_response_length = 0;
    config.key_groups = vec![KeyGroupConfig {
        name: "group1".to_string(),
        keys: keys.iter().map(|k| k.to_string()).collect(),
        keys_env: vec![],
    }];
    config
}

pub fn coordinator(config: &GatewayConfig) -> (RetryCoordinator, Arc<StatsCollector>) {
    let stats = Arc::new(StatsCollector::new(&config.stats));
    let coordinator = RetryCoordinator::from_config(config, stats.clone()).unwrap();
    (coordinator, stats)
}

pub fn bearer(key: &str) -> mockito::Matcher {
    mockito::Matcher::Exact(format!("Bearer {}", key))
}

pub fn chat_request(stream: bool) -> ChatRequest {
    ChatRequest::new(
        "gemini-2.5-flash",
        vec![Message::text("user", "Tell me a story")],
    )
    .with_stream(stream)
}

pub fn completion_body(content: &str, finish_reason: &str) -> String {
    serde_json::json!({
        "id": "chatcmpl-test",
        "object": "chat.completion",
        "created": 1700000000,
        "model": "gemini-2.5-flash",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": content},
            "finish_reason": finish_reason
        }],
        "usage": {"prompt_tokens": 5, "completion_tokens": 10, "total_tokens": 15}
    })
    .to_string()
}

pub fn sse_chunk(content: &str, finish_reason: Option<&str>) -> String {
    format!(
        "data: {}\n\n",
        serde_json::json!({
            "id": "chatcmpl-stream",
            "object": "chat.completion.chunk",
            "created": 1700000000,
            "model": "gemini-2.5-flash",
            "choices": [{
                "index": 0,
                "delta": {"content": content},
                "finish_reason": finish_reason
            }]
        })
    )
}

/// Serve a router on an ephemeral port and return its base URL
pub async fn spawn_upstream(router: axum::Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}", addr)
}
