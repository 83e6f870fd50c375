//! keyrelay - OpenAI-compatible forwarding gateway
//!
//! Sits in front of a generative-language API and spreads outbound calls
//! across groups of upstream API keys. Keys that hit rate limits cool down,
//! short or cut-off answers are retried on another key, and every request is
//! counted for the monitoring endpoints.
//!
//! ```no_run
//! use keyrelay::config::ConfigLoader;
//! use keyrelay::server::{serve, AppState};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let state = AppState::new(ConfigLoader::new()?)?;
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:5000").await?;
//! serve(listener, state, CancellationToken::new()).await?;
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod client;
pub mod config;
pub mod error;
pub mod router;
pub mod server;
pub mod stats;

pub use api::{ChatRequest, Message};
pub use client::{Attempt, ErrorKind, ForwardingEngine};
pub use config::{ConfigLoader, GatewayConfig};
pub use error::{RelayError, Result};
pub use router::{Completion, FailureSummary, KeyPool, RetryCoordinator};
pub use server::AppState;
pub use stats::{CompletionOutcome, StatsCollector, StatsSnapshot};
