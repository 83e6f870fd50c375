//! Client Module
//!
//! Upstream forwarding: one call per attempt, rate limit detection and the
//! streaming relay.

pub mod attempt;
pub mod http;
pub mod rate_limit;
pub mod relay;

pub use attempt::{classify_status, is_truncated, Attempt, AttemptOutcome, ErrorKind};
pub use http::{Delivery, Dispatch, ForwardingEngine, LiveStream};
pub use relay::{RelayFinalizer, RelayStream};
