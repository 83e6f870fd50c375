//! Chat Completion API
//!
//! Inbound request types, their translation to the upstream body, and the
//! response shapes the gateway synthesizes or inspects.

use crate::error::{RelayError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A message in a chat conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Role: "system", "user", "assistant", or "tool"
    pub role: String,

    /// Message content (string, array of content parts, or absent)
    #[serde(default)]
    pub content: Option<MessageContent>,

    /// Optional name for the message author
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Everything else (tool calls, tool_call_id, ...), passed through untouched
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Message {
    /// Plain text message
    pub fn text(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: Some(MessageContent::Text(content.into())),
            name: None,
            extra: Map::new(),
        }
    }
}

/// Message content - can be a simple string or array of parts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    /// Simple string content
    Text(String),

    /// Array of content parts (for multimodal)
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// Convert to string (concatenating text parts if needed)
    pub fn to_string_content(&self) -> String {
        match self {
            MessageContent::Text(s) => s.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join(""),
        }
    }
}

/// A content part in a message (for multimodal content)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentPart {
    /// Text content
    #[serde(rename = "text")]
    Text { text: String },

    /// Image content
    #[serde(rename = "image_url")]
    ImageUrl { image_url: ImageUrl },

    /// Audio, files and any part type added later, forwarded as received
    #[serde(untagged)]
    Other(Value),
}

/// Image URL content
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageUrl {
    /// URL or base64 data URL
    pub url: String,

    /// Optional detail level
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Stop sequences: a single string or a list
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StopSequences {
    One(String),
    Many(Vec<String>),
}

/// Inbound chat completion request. Immutable once accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    /// Model identifier, forwarded as-is
    pub model: String,

    /// Messages in the conversation
    pub messages: Vec<Message>,

    /// Stream the answer as SSE
    #[serde(default)]
    pub stream: bool,

    /// Sampling temperature
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,

    /// Maximum tokens to generate
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Top-p sampling
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,

    /// Top-k sampling
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,

    /// Stop sequences
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<StopSequences>,

    /// Additional caller options
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ChatRequest {
    /// Create a new request
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            stream: false,
            temperature: None,
            max_tokens: None,
            top_p: None,
            top_k: None,
            stop: None,
            extra: Map::new(),
        }
    }

    /// Enable streaming
    pub fn with_stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    /// Reject requests that cannot be forwarded
    pub fn validate(&self) -> Result<()> {
        if self.model.trim().is_empty() {
            return Err(RelayError::InvalidRequest("model must not be empty".to_string()));
        }
        if self.messages.is_empty() {
            return Err(RelayError::InvalidRequest(
                "messages must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Translate into the upstream body.
    ///
    /// Only fields named in `forward_params` survive; `stream` is added when
    /// an upstream stream is wanted.
    pub fn to_upstream_body(&self, forward_params: &[String], stream: bool) -> Result<Value> {
        let mut body = serde_json::to_value(self)?;

        if let Some(obj) = body.as_object_mut() {
            obj.retain(|key, _| forward_params.iter().any(|p| p == key));
            if stream {
                obj.insert("stream".to_string(), Value::Bool(true));
            } else {
                obj.remove("stream");
            }
        }

        Ok(body)
    }
}

/// Chat completion response, used when the gateway builds one itself
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    /// Response ID
    pub id: String,

    /// Object type
    pub object: String,

    /// Creation timestamp
    pub created: u64,

    /// Model used
    pub model: String,

    /// Response choices
    pub choices: Vec<Choice>,

    /// Token usage
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

/// A choice in the completion response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    /// Choice index
    pub index: u32,

    /// The message
    pub message: Message,

    /// Finish reason
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

/// Token usage information
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,

    #[serde(default)]
    pub completion_tokens: u32,

    #[serde(default)]
    pub total_tokens: u32,
}

/// What the truncation check needs from a completion body
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompletionSummary {
    /// Text of the first choice
    pub content: String,

    /// Finish reason of the first choice
    pub finish_reason: Option<String>,
}

impl CompletionSummary {
    /// Inspect an upstream JSON body. Returns `None` when there is no choice.
    pub fn from_value(body: &Value) -> Option<Self> {
        let choice = body.get("choices")?.as_array()?.first()?;

        let content = match choice.get("message").and_then(|m| m.get("content")) {
            Some(Value::String(s)) => s.clone(),
            Some(parts @ Value::Array(_)) => serde_json::from_value::<MessageContent>(parts.clone())
                .map(|c| c.to_string_content())
                .unwrap_or_default(),
            _ => String::new(),
        };

        let finish_reason = choice
            .get("finish_reason")
            .and_then(|r| r.as_str())
            .map(str::to_string);

        Some(Self {
            content,
            finish_reason,
        })
    }

    /// Rendered content length in characters
    pub fn content_length(&self) -> usize {
        self.content.chars().count()
    }
}

/// Current unix time in seconds
pub(crate) fn unix_now() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}
