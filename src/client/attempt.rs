//! Attempt Records
//!
//! One upstream call and what came of it. Attempts are built once by the
//! forwarding engine and never changed afterwards.

use crate::client::rate_limit::is_rate_limit_error;
use crate::router::key_pool::{Credential, CredentialId, KeyOutcome};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Longest upstream error text kept in logs and error records
pub(crate) const MAX_ERROR_BODY_CHARS: usize = 2000;

/// Finish reasons that mean the model stopped on its own
const NATURAL_FINISH_REASONS: &[&str] = &["stop", "tool_calls", "function_call", "end_turn"];

/// Why an attempt did not produce a usable answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Connection refused, reset, DNS, body read failure
    Transport,

    /// 429, or 400/403 whose body talks about rate limits or quota
    RateLimited,

    /// 5xx
    ServerUnavailable,

    /// Any other 4xx; the request itself is bad and retrying will not help
    Rejected,

    /// The attempt ran past its wall-clock limit
    Timeout,

    /// 2xx whose content is too short or stopped for a non-natural reason
    Truncated,

    /// 2xx whose body could not be understood
    MalformedResponse,
}

impl ErrorKind {
    /// Whether another credential may be tried
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ErrorKind::Rejected)
    }

    /// What this failure means for the credential that produced it
    pub fn key_outcome(&self, retry_after: Option<Duration>) -> KeyOutcome {
        match self {
            ErrorKind::RateLimited => KeyOutcome::RateLimited { retry_after },
            ErrorKind::ServerUnavailable => KeyOutcome::Unavailable { retry_after },
            ErrorKind::Timeout => KeyOutcome::TimedOut,
            ErrorKind::Rejected => KeyOutcome::Rejected,
            ErrorKind::Transport | ErrorKind::Truncated | ErrorKind::MalformedResponse => {
                KeyOutcome::Soft
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Transport => "transport_error",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::ServerUnavailable => "server_unavailable",
            ErrorKind::Rejected => "rejected",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Truncated => "truncated",
            ErrorKind::MalformedResponse => "malformed_response",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify a non-2xx upstream status
pub fn classify_status(status: u16, body: &str) -> ErrorKind {
    if is_rate_limit_error(status, body) {
        ErrorKind::RateLimited
    } else if status >= 500 {
        ErrorKind::ServerUnavailable
    } else {
        ErrorKind::Rejected
    }
}

/// Truncation heuristic.
///
/// Truncated when the content is shorter than `min_length` characters
/// (0 disables the length check) or when a finish reason is present and is
/// not one of the natural ones.
pub fn is_truncated(content_length: usize, finish_reason: Option<&str>, min_length: usize) -> bool {
    if min_length > 0 && content_length < min_length {
        return true;
    }

    match finish_reason {
        Some(reason) => !NATURAL_FINISH_REASONS
            .iter()
            .any(|natural| reason.eq_ignore_ascii_case(natural)),
        None => false,
    }
}

/// Result of one attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// Usable answer
    Success,

    /// Unusable answer or failed call
    Failed {
        kind: ErrorKind,
        message: String,
        retry_after: Option<Duration>,
    },
}

/// One upstream call
#[derive(Debug, Clone)]
pub struct Attempt {
    pub credential: CredentialId,
    pub key: String,
    pub group: String,
    pub started_at: DateTime<Utc>,
    /// Upstream HTTP status; `None` when no response arrived
    pub status: Option<u16>,
    pub elapsed: Duration,
    pub content_length: Option<usize>,
    pub outcome: AttemptOutcome,
}

impl Attempt {
    /// Start an attempt record for the given credential
    pub fn begin(credential: &Credential) -> AttemptBuilder {
        AttemptBuilder {
            credential: credential.id(),
            key: credential.masked(),
            group: credential.group_name().to_string(),
            started_at: Utc::now(),
            started: std::time::Instant::now(),
            status: None,
            content_length: None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, AttemptOutcome::Success)
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match &self.outcome {
            AttemptOutcome::Success => None,
            AttemptOutcome::Failed { kind, .. } => Some(*kind),
        }
    }

    /// Health verdict to feed back into the key pool
    pub fn key_outcome(&self) -> KeyOutcome {
        match &self.outcome {
            AttemptOutcome::Success => KeyOutcome::Success,
            AttemptOutcome::Failed {
                kind, retry_after, ..
            } => kind.key_outcome(*retry_after),
        }
    }

    /// Short human description for logs and error records
    pub fn describe(&self) -> String {
        match &self.outcome {
            AttemptOutcome::Success => "ok".to_string(),
            AttemptOutcome::Failed { kind, message, .. } => {
                let message: String = message.chars().take(MAX_ERROR_BODY_CHARS).collect();
                match self.status {
                    Some(status) => format!("{} (HTTP {}): {}", kind, status, message),
                    None => format!("{}: {}", kind, message),
                }
            }
        }
    }
}

/// Collects what is known about an attempt while it runs
#[derive(Debug)]
pub struct AttemptBuilder {
    credential: CredentialId,
    key: String,
    group: String,
    started_at: DateTime<Utc>,
    started: std::time::Instant,
    status: Option<u16>,
    content_length: Option<usize>,
}

impl AttemptBuilder {
    pub fn status(&mut self, status: u16) -> &mut Self {
        self.status = Some(status);
        self
    }

    pub fn content_length(&mut self, length: usize) -> &mut Self {
        self.content_length = Some(length);
        self
    }

    fn finish(self, outcome: AttemptOutcome) -> Attempt {
        Attempt {
            credential: self.credential,
            key: self.key,
            group: self.group,
            started_at: self.started_at,
            status: self.status,
            elapsed: self.started.elapsed(),
            content_length: self.content_length,
            outcome,
        }
    }

    pub fn succeed(self) -> Attempt {
        self.finish(AttemptOutcome::Success)
    }

    pub fn fail(self, kind: ErrorKind, message: impl Into<String>) -> Attempt {
        self.fail_with_retry_after(kind, message, None)
    }

    pub fn fail_with_retry_after(
        self,
        kind: ErrorKind,
        message: impl Into<String>,
        retry_after: Option<Duration>,
    ) -> Attempt {
        self.finish(AttemptOutcome::Failed {
            kind,
            message: message.into(),
            retry_after,
        })
    }
}
