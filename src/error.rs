//! keyrelay Error Types
//!
//! Errors raised while loading configuration, building the engine or serving
//! the gateway. Upstream failures during forwarding are not errors at this
//! level: they are recorded as attempt outcomes (see [`crate::client::ErrorKind`]).

use thiserror::Error;

/// Main error type for keyrelay operations
#[derive(Debug, Error)]
pub enum RelayError {
    /// Configuration errors (invalid JSON, missing fields, failed validation)
    #[error("Configuration error: {0}")]
    Config(String),

    /// No usable upstream credentials after filtering placeholders
    #[error("No usable API keys configured. Add keys to at least one group in the config file")]
    NoCredentials,

    /// Inbound request rejected before any upstream call
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// HTTP client construction or transport failure outside an attempt
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON (de)serialization failure
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Filesystem / socket failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for keyrelay operations
pub type Result<T> = std::result::Result<T, RelayError>;
