//! Retry Coordination
//!
//! Runs one client request as a sequence of attempts over the key pool.
//! The loop is an explicit state machine:
//!
//! ```text
//! Selecting -> Dispatching -> Evaluating -> Selecting | Succeeded | Exhausted
//! ```
//!
//! Every request is recorded in the statistics exactly once.

use crate::api::{ChatRequest, StreamChunk};
use crate::client::{
    Attempt, AttemptOutcome, Delivery, Dispatch, ErrorKind, ForwardingEngine, RelayFinalizer,
    RelayStream,
};
use crate::config::{GatewayConfig, RetryConfig, StreamMode, StreamingConfig};
use crate::error::Result;
use crate::router::key_pool::{Credential, KeyPool};
use crate::stats::{CompletionOutcome, LogLevel, RequestRecorder, StatsCollector};
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use bytes::Bytes;
use futures::Stream;
use serde_json::Value;
use std::collections::HashSet;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// SSE body handed to the gateway
pub type SseBody = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// Terminal result of a request as seen by the gateway
pub enum Completion {
    /// Complete JSON body
    Json(Value),

    /// `text/event-stream` body
    Stream(SseBody),

    /// No usable answer
    Failed(FailureSummary),
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Completion::Json(value) => f.debug_tuple("Json").field(value).finish(),
            Completion::Stream(_) => f.write_str("Stream(..)"),
            Completion::Failed(summary) => f.debug_tuple("Failed").field(summary).finish(),
        }
    }
}

/// Why a request failed, safe to show to the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureSummary {
    /// Error of the final attempt; `None` when no attempt could be made
    pub kind: Option<ErrorKind>,

    /// Upstream status of the final attempt
    pub status: Option<u16>,

    pub message: String,
    pub attempts: usize,

    /// Upstream error body, kept verbatim for rejected requests
    pub upstream_body: Option<String>,
}

impl FailureSummary {
    /// `next_available` is only used when no attempt could be made
    fn from_attempts(attempts: &[Attempt], next_available: Option<Duration>) -> Self {
        let Some(last) = attempts.last() else {
            let message = match next_available {
                Some(wait) => format!(
                    "No API key available: every key is cooling down, next one free in {}s",
                    wait.as_secs().max(1)
                ),
                None => "No API key available: every key is cooling down".to_string(),
            };
            return Self {
                kind: None,
                status: None,
                message,
                attempts: 0,
                upstream_body: None,
            };
        };

        let kind = last.error_kind();
        let upstream_body = match &last.outcome {
            AttemptOutcome::Failed {
                kind: ErrorKind::Rejected,
                message,
                ..
            } => Some(message.clone()),
            _ => None,
        };

        Self {
            kind,
            status: last.status,
            message: format!(
                "All {} attempt(s) failed. Last error: {}",
                attempts.len(),
                last.describe()
            ),
            attempts: attempts.len(),
            upstream_body,
        }
    }
}

/// States of the retry loop
enum State {
    Selecting,
    Dispatching(Credential),
    Evaluating(Credential, Dispatch),
    Succeeded(Credential, Delivery),
    Exhausted,
}

/// Drives attempts for one request at a time; shared by all requests
#[derive(Debug)]
pub struct RetryCoordinator {
    engine: ForwardingEngine,
    pool: Arc<KeyPool>,
    stats: Arc<StatsCollector>,
    retry: RetryConfig,
    streaming: StreamingConfig,
}

impl RetryCoordinator {
    pub fn new(
        engine: ForwardingEngine,
        pool: Arc<KeyPool>,
        stats: Arc<StatsCollector>,
        retry: RetryConfig,
        streaming: StreamingConfig,
    ) -> Self {
        Self {
            engine,
            pool,
            stats,
            retry,
            streaming,
        }
    }

    /// Build engine and pool from configuration, sharing the given statistics
    pub fn from_config(config: &GatewayConfig, stats: Arc<StatsCollector>) -> Result<Self> {
        Ok(Self::new(
            ForwardingEngine::new(config)?,
            Arc::new(KeyPool::from_config(config)?),
            stats,
            config.retry.clone(),
            config.streaming.clone(),
        ))
    }

    pub fn pool(&self) -> &Arc<KeyPool> {
        &self.pool
    }

    fn backoff(&self) -> Option<ExponentialBackoff> {
        if self.retry.backoff_initial_ms == 0 {
            return None;
        }

        let initial = Duration::from_millis(self.retry.backoff_initial_ms);
        let mut backoff = ExponentialBackoff {
            initial_interval: initial,
            current_interval: initial,
            max_interval: Duration::from_millis(self.retry.backoff_max_ms.max(self.retry.backoff_initial_ms)),
            randomization_factor: 0.0,
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        };
        backoff.reset();
        Some(backoff)
    }

    /// Run a request to completion.
    ///
    /// Dropping the returned future (client disconnect) aborts the upstream
    /// call in flight and records the request as failed.
    pub async fn complete(&self, request: &ChatRequest) -> Completion {
        let relay = request.stream && self.streaming.mode == StreamMode::Relay;
        let timeout = self.retry.attempt_timeout();
        let max_attempts = self.retry.max_attempts.max(1) as usize;

        let mut recorder = RequestRecorder::new(self.stats.clone());
        let mut tried = HashSet::new();
        let mut backoff = self.backoff();
        let mut state = State::Selecting;

        tracing::debug!(
            model = %request.model,
            stream = request.stream,
            relay,
            "handling chat completion"
        );

        loop {
            state = match state {
                State::Selecting => {
                    let done = recorder.attempts().len();
                    if done >= max_attempts {
                        tracing::warn!(attempts = done, "attempt limit reached");
                        State::Exhausted
                    } else {
                        match self.pool.select_credential(&tried) {
                            Some(credential) => {
                                // Back off only when there is something left to try
                                if done > 0 {
                                    if let Some(delay) =
                                        backoff.as_mut().and_then(|b| b.next_backoff())
                                    {
                                        tokio::time::sleep(delay).await;
                                    }
                                }
                                State::Dispatching(credential)
                            }
                            None => State::Exhausted,
                        }
                    }
                }

                State::Dispatching(credential) => {
                    tried.insert(credential.id());
                    let dispatch = self
                        .engine
                        .dispatch(request, &credential, timeout, relay)
                        .await;
                    State::Evaluating(credential, dispatch)
                }

                State::Evaluating(credential, Dispatch { attempt, delivery }) => {
                    self.pool.mark_outcome(&credential, attempt.key_outcome());

                    let fatal = attempt.error_kind().is_some_and(|k| !k.is_retryable());
                    if !attempt.is_success() {
                        self.stats.add_log(
                            LogLevel::Warn,
                            format!(
                                "attempt {} with key {} failed: {}",
                                recorder.attempts().len() + 1,
                                attempt.key,
                                attempt.describe()
                            ),
                        );
                    }
                    recorder.push(attempt);

                    match delivery {
                        Some(delivery) => State::Succeeded(credential, delivery),
                        None if fatal => State::Exhausted,
                        None => State::Selecting,
                    }
                }

                State::Succeeded(credential, delivery) => {
                    return self.deliver(request, recorder, credential, delivery);
                }

                State::Exhausted => {
                    let next_available = if recorder.attempts().is_empty() {
                        self.pool.min_wait_time()
                    } else {
                        None
                    };
                    let summary =
                        FailureSummary::from_attempts(recorder.attempts(), next_available);
                    recorder.finish(CompletionOutcome::failed(
                        summary.kind,
                        summary.message.clone(),
                    ));
                    return Completion::Failed(summary);
                }
            };
        }
    }

    fn deliver(
        &self,
        request: &ChatRequest,
        recorder: RequestRecorder,
        credential: Credential,
        delivery: Delivery,
    ) -> Completion {
        match delivery {
            Delivery::Stream(live) => {
                let relay = RelayStream::new(
                    live,
                    RelayFinalizer {
                        recorder,
                        pool: self.pool.clone(),
                        credential,
                        min_response_length: self.engine.min_response_length(),
                    },
                );
                Completion::Stream(Box::pin(relay))
            }
            Delivery::Buffered(body) => {
                recorder.finish(CompletionOutcome::Success);
                if request.stream {
                    Completion::Stream(buffered_sse(body, self.streaming.buffered_chunks))
                } else {
                    Completion::Json(body)
                }
            }
        }
    }
}

/// Re-emit a complete answer as an SSE stream
pub fn buffered_sse(body: Value, chunks: usize) -> SseBody {
    let id = body["id"]
        .as_str()
        .map(str::to_string)
        .unwrap_or_else(|| format!("chatcmpl-{}", chrono::Utc::now().timestamp()));
    let created = body["created"]
        .as_u64()
        .unwrap_or_else(|| chrono::Utc::now().timestamp().max(0) as u64);
    let model = body["model"].as_str().unwrap_or_default().to_string();
    let content: Vec<char> = body["choices"][0]["message"]["content"]
        .as_str()
        .unwrap_or_default()
        .chars()
        .collect();

    let chunk_size = (content.len() / chunks.max(1)).max(1);

    let stream = async_stream::stream! {
        for piece in content.chunks(chunk_size) {
            let text: String = piece.iter().collect();
            yield StreamChunk::content(&id, created, &model, &text)
                .to_sse()
                .map(Bytes::from)
                .map_err(io::Error::other);
        }
        yield StreamChunk::finish(&id, created, &model, "stop")
            .to_sse()
            .map(Bytes::from)
            .map_err(io::Error::other);
        yield Ok(Bytes::from_static(b"data: [DONE]\n\n"));
    };

    Box::pin(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{parse_sse_line, SseEvent};
    use futures::StreamExt;
    use serde_json::json;

    #[tokio::test]
    async fn test_buffered_sse_chunks() {
        let body = json!({
            "id": "chatcmpl-7",
            "created": 42,
            "model": "gemini-2.5-flash",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "a".repeat(120)}}]
        });

        let events: Vec<Bytes> = buffered_sse(body, 50)
            .map(|r| r.unwrap())
            .collect()
            .await;

        // 120 / 50 = 2 characters per chunk
        assert_eq!(events.len(), 60 + 2);

        let text = String::from_utf8(events.concat()).unwrap();
        let mut content = String::new();
        let mut finish = None;
        for line in text.lines() {
            if let SseEvent::Chunk(chunk) = parse_sse_line(line).unwrap() {
                assert_eq!(chunk.id, "chatcmpl-7");
                if let Some(c) = &chunk.choices[0].delta.content {
                    content.push_str(c);
                }
                if let Some(r) = &chunk.choices[0].finish_reason {
                    finish = Some(r.clone());
                }
            }
        }
        assert_eq!(content, "a".repeat(120));
        assert_eq!(finish.as_deref(), Some("stop"));
        assert!(text.ends_with("data: [DONE]\n\n"));
    }

    #[tokio::test]
    async fn test_buffered_sse_short_content() {
        let body = json!({"choices": [{"message": {"content": "hi"}}]});
        let events: Vec<Bytes> = buffered_sse(body, 50)
            .map(|r| r.unwrap())
            .collect()
            .await;

        // one chunk per character, then stop and [DONE]
        assert_eq!(events.len(), 4);
    }

    #[test]
    fn test_failure_summary_without_attempts() {
        let summary = FailureSummary::from_attempts(&[], None);
        assert_eq!(summary.kind, None);
        assert_eq!(summary.attempts, 0);
        assert!(summary.message.contains("cooling"));

        let summary = FailureSummary::from_attempts(&[], Some(Duration::from_secs(42)));
        assert!(summary.message.ends_with("next one free in 42s"));
    }
}
