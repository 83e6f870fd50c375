//! Router Module
//!
//! Credential pool management and the retry loop that walks it.

pub mod key_pool;
pub mod retry;

pub use key_pool::{
    mask_key, Credential, CredentialId, GroupHealth, KeyOutcome, KeyPool, KeyStatus,
};
pub use retry::{Completion, FailureSummary, RetryCoordinator, SseBody};
