//! API Module
//!
//! Chat completion API types and streaming support.

pub mod completion;
pub mod streaming;

pub use completion::{
    ChatRequest, Choice, CompletionResponse, CompletionSummary, ContentPart, ImageUrl, Message,
    MessageContent, StopSequences, Usage,
};
pub use streaming::{
    aggregate_sse_body, looks_like_sse, parse_sse_line, SseEvent, SseLineBuffer,
    StreamAccumulator, StreamChoice, StreamChunk, StreamDelta,
};
