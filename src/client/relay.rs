//! Streaming Relay
//!
//! Passes upstream SSE bytes to the caller as they arrive while keeping a
//! running character count and the last finish reason. The request is
//! recorded once: at the end of the stream, on an upstream error, on the
//! attempt deadline, or when the caller drops the body.

use crate::api::{SseLineBuffer, StreamAccumulator};
use crate::client::attempt::{is_truncated, ErrorKind};
use crate::client::http::LiveStream;
use crate::router::key_pool::{Credential, KeyPool};
use crate::stats::{CompletionOutcome, RequestRecorder};
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::Stream;
use pin_project_lite::pin_project;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::time::Sleep;

/// Everything needed to close out a relayed request
pub struct RelayFinalizer {
    pub recorder: RequestRecorder,
    pub pool: Arc<KeyPool>,
    pub credential: Credential,
    pub min_response_length: usize,
}

impl RelayFinalizer {
    fn complete(self, acc: &StreamAccumulator) {
        let truncated = is_truncated(
            acc.content_chars,
            acc.finish_reason.as_deref(),
            self.min_response_length,
        );
        if truncated {
            tracing::warn!(
                key = %self.credential.masked(),
                chars = acc.content_chars,
                finish_reason = ?acc.finish_reason,
                "relayed stream looks truncated"
            );
        }
        self.recorder
            .finish(CompletionOutcome::SuccessStreamed { truncated });
    }

    fn fail(self, kind: ErrorKind, reason: String) {
        tracing::warn!(key = %self.credential.masked(), %reason, "relayed stream failed");
        self.pool
            .mark_outcome(&self.credential, kind.key_outcome(None));
        self.recorder
            .finish(CompletionOutcome::failed(Some(kind), reason));
    }
}

pin_project! {
    /// Caller-facing body of a relayed streaming response
    pub struct RelayStream {
        upstream: BoxStream<'static, reqwest::Result<Bytes>>,
        #[pin]
        deadline: Sleep,
        lines: SseLineBuffer,
        acc: StreamAccumulator,
        finalizer: Option<RelayFinalizer>,
    }
}

impl RelayStream {
    pub fn new(live: LiveStream, finalizer: RelayFinalizer) -> Self {
        Self {
            upstream: live.body,
            deadline: tokio::time::sleep_until(live.deadline),
            lines: SseLineBuffer::new(),
            acc: StreamAccumulator::counting(),
            finalizer: Some(finalizer),
        }
    }
}

impl Stream for RelayStream {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();

        // Already finalized: nothing more to give
        if this.finalizer.is_none() {
            return Poll::Ready(None);
        }

        match this.upstream.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                for line in this.lines.push(&chunk) {
                    this.acc.process_line(&line);
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                let reason = format!("upstream stream error: {}", e);
                if let Some(finalizer) = this.finalizer.take() {
                    finalizer.fail(ErrorKind::Transport, reason.clone());
                }
                Poll::Ready(Some(Err(io::Error::new(io::ErrorKind::BrokenPipe, reason))))
            }
            Poll::Ready(None) => {
                if let Some(line) = this.lines.finish() {
                    this.acc.process_line(&line);
                }
                if let Some(finalizer) = this.finalizer.take() {
                    finalizer.complete(this.acc);
                }
                Poll::Ready(None)
            }
            Poll::Pending => {
                if this.deadline.poll(cx).is_ready() {
                    let reason = "stream exceeded the attempt deadline".to_string();
                    if let Some(finalizer) = this.finalizer.take() {
                        finalizer.fail(ErrorKind::Timeout, reason.clone());
                    }
                    return Poll::Ready(Some(Err(io::Error::new(io::ErrorKind::TimedOut, reason))));
                }
                Poll::Pending
            }
        }
    }
}
