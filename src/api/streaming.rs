//! Streaming Support
//!
//! Server-Sent Events parsing for chat completion chunks, a line splitter for
//! raw byte streams, and the accumulator that tracks content length and
//! finish reason while a stream is relayed.

use crate::api::completion::{unix_now, Choice, CompletionResponse, Message, Usage};
use crate::error::{RelayError, Result};
use serde::{Deserialize, Serialize};

/// A streaming chunk from the API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamChunk {
    /// Chunk ID
    #[serde(default)]
    pub id: String,

    /// Object type
    #[serde(default)]
    pub object: String,

    /// Creation timestamp
    #[serde(default)]
    pub created: u64,

    /// Model name
    #[serde(default)]
    pub model: String,

    /// Choices with deltas
    #[serde(default)]
    pub choices: Vec<StreamChoice>,

    /// Usage info (only in final chunk for some providers)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl StreamChunk {
    /// A single-choice content chunk
    pub fn content(id: &str, created: u64, model: &str, text: &str) -> Self {
        Self {
            id: id.to_string(),
            object: "chat.completion.chunk".to_string(),
            created,
            model: model.to_string(),
            choices: vec![StreamChoice {
                index: 0,
                delta: StreamDelta {
                    role: None,
                    content: Some(text.to_string()),
                },
                finish_reason: None,
            }],
            usage: None,
        }
    }

    /// The closing chunk carrying only a finish reason
    pub fn finish(id: &str, created: u64, model: &str, reason: &str) -> Self {
        Self {
            id: id.to_string(),
            object: "chat.completion.chunk".to_string(),
            created,
            model: model.to_string(),
            choices: vec![StreamChoice {
                index: 0,
                delta: StreamDelta::default(),
                finish_reason: Some(reason.to_string()),
            }],
            usage: None,
        }
    }

    /// Render as one SSE event
    pub fn to_sse(&self) -> Result<String> {
        Ok(format!("data: {}\n\n", serde_json::to_string(self)?))
    }
}

/// A choice in a streaming chunk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamChoice {
    /// Choice index
    #[serde(default)]
    pub index: u32,

    /// The delta (partial message)
    #[serde(default)]
    pub delta: StreamDelta,

    /// Finish reason (set in final chunk)
    pub finish_reason: Option<String>,
}

/// Delta content in a streaming chunk
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamDelta {
    /// Role (usually only in first chunk)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,

    /// Content delta
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// Accumulator for streaming chunks
#[derive(Debug, Default)]
pub struct StreamAccumulator {
    /// Accumulated content (empty when only counting)
    pub content: String,

    /// Characters of content seen so far
    pub content_chars: usize,

    /// Finish reason from last chunk that carried one
    pub finish_reason: Option<String>,

    /// Response ID
    pub id: Option<String>,

    /// Model name
    pub model: Option<String>,

    /// Created timestamp
    pub created: Option<u64>,

    /// Usage from final chunk (only when keeping the text)
    pub usage: Option<Usage>,

    keep_content: bool,
}

impl StreamAccumulator {
    /// Accumulator that keeps the full text
    pub fn new() -> Self {
        Self {
            keep_content: true,
            ..Default::default()
        }
    }

    /// Accumulator that only counts characters, for relayed streams
    pub fn counting() -> Self {
        Self::default()
    }

    /// Process a streaming chunk
    pub fn process_chunk(&mut self, chunk: &StreamChunk) {
        // Store metadata from first chunk
        if self.id.is_none() && !chunk.id.is_empty() {
            self.id = Some(chunk.id.clone());
            self.model = Some(chunk.model.clone());
            self.created = Some(chunk.created);
        }

        if self.keep_content && chunk.usage.is_some() {
            self.usage = chunk.usage.clone();
        }

        for choice in chunk.choices.iter().filter(|c| c.index == 0) {
            if let Some(content) = &choice.delta.content {
                self.content_chars += content.chars().count();
                if self.keep_content {
                    self.content.push_str(content);
                }
            }

            if let Some(reason) = &choice.finish_reason {
                self.finish_reason = Some(reason.clone());
            }
        }
    }

    /// Feed one SSE line. Malformed data lines are skipped.
    pub fn process_line(&mut self, line: &str) {
        match parse_sse_line(line) {
            Ok(SseEvent::Chunk(chunk)) => self.process_chunk(&chunk),
            Ok(SseEvent::Done) | Ok(SseEvent::Ignored) => {}
            Err(e) => tracing::debug!(error = %e, "skipping unparsable SSE line"),
        }
    }

    /// Convert into a non-streaming completion body
    pub fn into_completion(self) -> CompletionResponse {
        let created = self.created.unwrap_or_else(unix_now);
        CompletionResponse {
            id: self
                .id
                .unwrap_or_else(|| format!("chatcmpl-{}", unix_now())),
            object: "chat.completion".to_string(),
            created,
            model: self.model.unwrap_or_default(),
            choices: vec![Choice {
                index: 0,
                message: Message::text("assistant", self.content),
                finish_reason: Some(self.finish_reason.unwrap_or_else(|| "stop".to_string())),
            }],
            usage: Some(self.usage.unwrap_or_default()),
        }
    }
}

/// One parsed SSE line
#[derive(Debug)]
pub enum SseEvent {
    Chunk(StreamChunk),
    Done,
    Ignored,
}

/// Parse SSE data line into a StreamChunk
pub fn parse_sse_line(line: &str) -> Result<SseEvent> {
    // Skip empty lines and comments
    let line = line.trim();
    if line.is_empty() || line.starts_with(':') {
        return Ok(SseEvent::Ignored);
    }

    if let Some(data) = line.strip_prefix("data:") {
        let data = data.trim();

        if data == "[DONE]" {
            return Ok(SseEvent::Done);
        }

        let chunk: StreamChunk = serde_json::from_str(data).map_err(|e| {
            RelayError::InvalidRequest(format!("Failed to parse SSE chunk: {}. Data: {}", e, data))
        })?;

        return Ok(SseEvent::Chunk(chunk));
    }

    // Ignore other event types (event:, id:, retry:)
    Ok(SseEvent::Ignored)
}

/// Whether a response body looks like SSE framing rather than plain JSON
pub fn looks_like_sse(body: &str) -> bool {
    body.trim_start().starts_with("data:")
}

/// Aggregate a complete SSE body into one completion. `None` when it held no content.
pub fn aggregate_sse_body(body: &str) -> Option<CompletionResponse> {
    let mut acc = StreamAccumulator::new();
    for line in body.lines() {
        acc.process_line(line);
    }

    if acc.content.is_empty() {
        None
    } else {
        Some(acc.into_completion())
    }
}

/// Splits a byte stream into complete lines across chunk boundaries
#[derive(Debug, Default)]
pub struct SseLineBuffer {
    pending: Vec<u8>,
}

impl SseLineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes and return every line completed by them
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);

        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line[..line.len() - 1]);
            lines.push(text.trim_end_matches('\r').to_string());
        }
        lines
    }

    /// Whatever is left after the stream ended
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = String::from_utf8_lossy(&self.pending).to_string();
        self.pending.clear();
        Some(rest)
    }
}
