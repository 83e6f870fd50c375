//! Configuration Module
//!
//! Handles gateway configuration loading and validation.

pub mod loader;
pub mod settings;

pub use loader::ConfigLoader;
pub use settings::{
    is_usable_key, CooldownConfig, CooldownPolicy, GatewayConfig, KeyGroupConfig, RetryConfig,
    ServerConfig, StatsConfig, StreamMode, StreamingConfig, UpstreamConfig,
};
