//! Forwarding Engine
//!
//! Makes one upstream chat completion call per attempt, bounded by a hard
//! wall-clock deadline, and turns whatever happened into an [`Attempt`].
//! Upstream failures are never returned as errors.

use crate::api::{aggregate_sse_body, looks_like_sse, ChatRequest, CompletionSummary};
use crate::client::attempt::{
    classify_status, is_truncated, Attempt, AttemptBuilder, ErrorKind, MAX_ERROR_BODY_CHARS,
};
use crate::client::rate_limit::retry_after;
use crate::config::GatewayConfig;
use crate::error::{RelayError, Result};
use crate::router::key_pool::Credential;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Response};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use tokio::time::{timeout_at, Instant};

/// Result of one dispatch
#[derive(Debug)]
pub struct Dispatch {
    pub attempt: Attempt,

    /// Present only when the attempt succeeded
    pub delivery: Option<Delivery>,
}

impl Dispatch {
    fn failed(attempt: Attempt) -> Self {
        Self {
            attempt,
            delivery: None,
        }
    }
}

/// What a successful attempt hands over
pub enum Delivery {
    /// Complete upstream JSON body
    Buffered(Value),

    /// Upstream SSE body still arriving
    Stream(LiveStream),
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Delivery::Buffered(_) => f.write_str("Delivery::Buffered"),
            Delivery::Stream(_) => f.write_str("Delivery::Stream"),
        }
    }
}

/// Upstream body of a streaming attempt together with the attempt deadline
pub struct LiveStream {
    pub body: BoxStream<'static, reqwest::Result<Bytes>>,
    pub deadline: Instant,
}

/// Sends chat completions upstream
#[derive(Debug, Clone)]
pub struct ForwardingEngine {
    client: Client,
    chat_url: String,
    forward_params: Vec<String>,
    min_response_length: usize,
}

impl ForwardingEngine {
    /// Build the engine and its HTTP client from configuration
    pub fn new(config: &GatewayConfig) -> Result<Self> {
        // No overall timeout here; every attempt carries its own deadline.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.upstream.connect_timeout_secs))
            .pool_max_idle_per_host(10)
            .build()
            .map_err(|e| RelayError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            chat_url: config.upstream.chat_url(),
            forward_params: config.upstream.forward_params.clone(),
            min_response_length: config.retry.min_response_length,
        })
    }

    pub fn min_response_length(&self) -> usize {
        self.min_response_length
    }

    /// Run one attempt with the given credential.
    ///
    /// With `stream` set the upstream is asked for SSE and a successful
    /// attempt hands over the live body; otherwise the whole body is read,
    /// checked for truncation and handed over as JSON.
    pub async fn dispatch(
        &self,
        request: &ChatRequest,
        credential: &Credential,
        timeout: Duration,
        stream: bool,
    ) -> Dispatch {
        let deadline = Instant::now() + timeout;
        let mut attempt = Attempt::begin(credential);

        let headers = match build_headers(credential, stream) {
            Ok(headers) => headers,
            Err(e) => return Dispatch::failed(attempt.fail(ErrorKind::Rejected, e.to_string())),
        };

        let body = match request.to_upstream_body(&self.forward_params, stream) {
            Ok(body) => body,
            Err(e) => return Dispatch::failed(attempt.fail(ErrorKind::Rejected, e.to_string())),
        };

        tracing::debug!(
            url = %self.chat_url,
            key = %credential.masked(),
            stream,
            "dispatching upstream request"
        );

        let send = self
            .client
            .post(&self.chat_url)
            .headers(headers)
            .json(&body)
            .send();

        let response = match timeout_at(deadline, send).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Dispatch::failed(transport_failure(attempt, &e)),
            Err(_) => return Dispatch::failed(timed_out(attempt, timeout)),
        };

        let status = response.status();
        attempt.status(status.as_u16());

        if !status.is_success() {
            let retry_after = retry_after(response.headers());
            let text = match timeout_at(deadline, response.text()).await {
                Ok(Ok(text)) => text,
                Ok(Err(_)) => String::new(),
                Err(_) => return Dispatch::failed(timed_out(attempt, timeout)),
            };

            let kind = classify_status(status.as_u16(), &text);
            // A rejected body goes back to the caller verbatim
            let message = if kind == ErrorKind::Rejected {
                text
            } else {
                text.chars().take(MAX_ERROR_BODY_CHARS).collect()
            };
            return Dispatch::failed(attempt.fail_with_retry_after(kind, message, retry_after));
        }

        if stream {
            let live = LiveStream {
                body: response.bytes_stream().boxed(),
                deadline,
            };
            return Dispatch {
                attempt: attempt.succeed(),
                delivery: Some(Delivery::Stream(live)),
            };
        }

        self.read_buffered(response, attempt, deadline, timeout)
            .await
    }

    async fn read_buffered(
        &self,
        response: Response,
        mut attempt: AttemptBuilder,
        deadline: Instant,
        timeout: Duration,
    ) -> Dispatch {
        let text = match timeout_at(deadline, response.text()).await {
            Ok(Ok(text)) => text,
            Ok(Err(e)) => return Dispatch::failed(transport_failure(attempt, &e)),
            Err(_) => return Dispatch::failed(timed_out(attempt, timeout)),
        };

        // Some upstreams answer with SSE framing even without `stream`
        let body = if looks_like_sse(&text) {
            match aggregate_sse_body(&text).and_then(|c| serde_json::to_value(c).ok()) {
                Some(body) => body,
                None => {
                    return Dispatch::failed(
                        attempt.fail(ErrorKind::MalformedResponse, "SSE body without content"),
                    )
                }
            }
        } else {
            match serde_json::from_str::<Value>(&text) {
                Ok(body) => body,
                Err(e) => {
                    return Dispatch::failed(attempt.fail(
                        ErrorKind::MalformedResponse,
                        format!("Failed to parse response: {}", e),
                    ))
                }
            }
        };

        let Some(summary) = CompletionSummary::from_value(&body) else {
            return Dispatch::failed(
                attempt.fail(ErrorKind::MalformedResponse, "response has no choices"),
            );
        };

        let length = summary.content_length();
        attempt.content_length(length);

        if is_truncated(
            length,
            summary.finish_reason.as_deref(),
            self.min_response_length,
        ) {
            let message = format!(
                "{} characters, finish_reason {}",
                length,
                summary.finish_reason.as_deref().unwrap_or("none")
            );
            return Dispatch::failed(attempt.fail(ErrorKind::Truncated, message));
        }

        Dispatch {
            attempt: attempt.succeed(),
            delivery: Some(Delivery::Buffered(body)),
        }
    }
}

fn build_headers(credential: &Credential, stream: bool) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {}", credential.secret())).map_err(|_| {
            RelayError::Config(format!(
                "API key {} is not a valid header value",
                credential.masked()
            ))
        })?,
    );
    if stream {
        headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
    }
    Ok(headers)
}

fn transport_failure(attempt: AttemptBuilder, error: &reqwest::Error) -> Attempt {
    // reqwest reports its own connect timeout as a timeout
    let kind = if error.is_timeout() && !error.is_connect() {
        ErrorKind::Timeout
    } else {
        ErrorKind::Transport
    };
    attempt.fail(kind, error.to_string())
}

fn timed_out(attempt: AttemptBuilder, timeout: Duration) -> Attempt {
    attempt.fail(
        ErrorKind::Timeout,
        format!("no complete response within {}s", timeout.as_secs_f64()),
    )
}
