//! Gateway Configuration
//!
//! Defines the configuration schema for the gateway. Every field has a
//! documented default so a config file only needs the keys and the caller
//! secret.

use crate::error::{RelayError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Listener and caller authentication
    #[serde(default)]
    pub server: ServerConfig,

    /// Upstream API location and request translation
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Credential groups, tried in the order listed
    #[serde(default)]
    pub key_groups: Vec<KeyGroupConfig>,

    /// Retry policy across credentials
    #[serde(default)]
    pub retry: RetryConfig,

    /// Credential cooldown after rate limits / unavailability
    #[serde(default)]
    pub cooldown: CooldownConfig,

    /// Streaming behaviour
    #[serde(default)]
    pub streaming: StreamingConfig,

    /// Monitoring buffers
    #[serde(default)]
    pub stats: StatsConfig,
}

/// Listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address (default: "127.0.0.1")
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port (default: 5000)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Shared secret callers must send as `Authorization: Bearer <secret>`
    #[serde(default)]
    pub caller_secret: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            caller_secret: String::new(),
        }
    }
}

/// Upstream API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Base URL (default: Gemini v1beta)
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Chat completion path appended to the base URL
    #[serde(default = "default_chat_path")]
    pub chat_path: String,

    /// Request fields forwarded upstream; everything else is dropped
    #[serde(default = "default_forward_params")]
    pub forward_params: Vec<String>,

    /// TCP connect timeout in seconds (default: 10)
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            chat_path: default_chat_path(),
            forward_params: default_forward_params(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl UpstreamConfig {
    /// Full chat completion URL
    pub fn chat_url(&self) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            self.chat_path.trim_start_matches('/')
        )
    }
}

/// A named group of upstream credentials
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyGroupConfig {
    /// Group name, used in logs and the key health view
    pub name: String,

    /// Raw API keys
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keys: Vec<String>,

    /// Environment variable names containing API keys
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keys_env: Vec<String>,
}

impl KeyGroupConfig {
    /// Resolve all usable keys of this group, raw keys first then env vars.
    ///
    /// Duplicates and placeholder values are skipped.
    pub fn resolve_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = Vec::new();

        let from_env = self.keys_env.iter().filter_map(|env| std::env::var(env).ok());

        for key in self.keys.iter().cloned().chain(from_env) {
            let key = key.trim().to_string();
            if is_usable_key(&key) && !keys.contains(&key) {
                keys.push(key);
            }
        }

        keys
    }
}

/// Returns false for empty keys, `YOUR_...` placeholders and values too short
/// to be real credentials.
pub fn is_usable_key(key: &str) -> bool {
    !key.is_empty() && !key.starts_with("YOUR_") && key.len() > 10
}

/// Retry policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum upstream attempts per request across all groups (default: 8)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Hard wall-clock limit per attempt in seconds (default: 180)
    #[serde(default = "default_attempt_timeout_secs")]
    pub attempt_timeout_secs: u64,

    /// Responses shorter than this many characters are truncated (default: 400, 0 disables)
    #[serde(default = "default_min_response_length")]
    pub min_response_length: usize,

    /// First delay before re-selecting after a failed attempt, ms (default: 200, 0 disables)
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,

    /// Upper bound for the inter-attempt delay, ms (default: 2000)
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            attempt_timeout_secs: default_attempt_timeout_secs(),
            min_response_length: default_min_response_length(),
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

impl RetryConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }
}

/// How long a credential stays out of rotation after a cooling failure
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CooldownPolicy {
    /// Always `base_secs`
    Fixed,

    /// `base_secs * 2^(consecutive_failures - 1)`, capped at `max_secs`
    #[default]
    Exponential,
}

/// Cooldown configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CooldownConfig {
    /// Backoff policy (default: exponential)
    #[serde(default)]
    pub policy: CooldownPolicy,

    /// Base cooldown in seconds (default: 60)
    #[serde(default = "default_cooldown_base_secs")]
    pub base_secs: u64,

    /// Cooldown cap in seconds, also caps upstream Retry-After (default: 600)
    #[serde(default = "default_cooldown_max_secs")]
    pub max_secs: u64,
}

impl Default for CooldownConfig {
    fn default() -> Self {
        Self {
            policy: CooldownPolicy::default(),
            base_secs: default_cooldown_base_secs(),
            max_secs: default_cooldown_max_secs(),
        }
    }
}

impl CooldownConfig {
    /// Cooldown for the given consecutive failure count (1-based)
    pub fn duration_for(&self, consecutive_failures: u32) -> Duration {
        let base = Duration::from_secs(self.base_secs);
        let max = Duration::from_secs(self.max_secs.max(self.base_secs));

        match self.policy {
            CooldownPolicy::Fixed => base,
            CooldownPolicy::Exponential => {
                let exponent = consecutive_failures.saturating_sub(1).min(16);
                base.saturating_mul(1u32 << exponent).min(max)
            }
        }
    }

    pub fn max(&self) -> Duration {
        Duration::from_secs(self.max_secs.max(self.base_secs))
    }
}

/// What to do with `stream: true` requests
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StreamMode {
    /// Relay upstream SSE bytes as they arrive; truncation is only recorded
    #[default]
    Relay,

    /// Fetch a complete response with full retries, then re-emit it as SSE
    Buffered,
}

/// Streaming configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingConfig {
    /// Streaming mode (default: relay)
    #[serde(default)]
    pub mode: StreamMode,

    /// Number of SSE chunks a buffered response is split into (default: 50)
    #[serde(default = "default_buffered_chunks")]
    pub buffered_chunks: usize,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            mode: StreamMode::default(),
            buffered_chunks: default_buffered_chunks(),
        }
    }
}

/// Monitoring buffer sizes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsConfig {
    /// Recent log lines kept (default: 1000)
    #[serde(default = "default_log_capacity")]
    pub log_capacity: usize,

    /// Recent error records kept (default: 100)
    #[serde(default = "default_error_capacity")]
    pub error_capacity: usize,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            log_capacity: default_log_capacity(),
            error_capacity: default_error_capacity(),
        }
    }
}

impl GatewayConfig {
    /// Check the configuration once at load/reload time.
    pub fn validate(&self) -> Result<()> {
        if self.server.caller_secret.trim().is_empty() {
            return Err(RelayError::Config(
                "server.caller_secret must be set (or KEYRELAY_CALLER_SECRET)".to_string(),
            ));
        }

        let base = self.upstream.base_url.trim();
        if !(base.starts_with("http://") || base.starts_with("https://")) {
            return Err(RelayError::Config(format!(
                "upstream.base_url must be an http(s) URL, got '{}'",
                base
            )));
        }

        if self.retry.max_attempts == 0 {
            return Err(RelayError::Config(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }

        if self.retry.attempt_timeout_secs == 0 {
            return Err(RelayError::Config(
                "retry.attempt_timeout_secs must be at least 1".to_string(),
            ));
        }

        if self.stats.log_capacity == 0 || self.stats.error_capacity == 0 {
            return Err(RelayError::Config(
                "stats capacities must be at least 1".to_string(),
            ));
        }

        let mut names = std::collections::HashSet::new();
        for group in &self.key_groups {
            if !names.insert(group.name.as_str()) {
                return Err(RelayError::Config(format!(
                    "duplicate key group name '{}'",
                    group.name
                )));
            }
        }

        if self.key_groups.iter().all(|g| g.resolve_keys().is_empty()) {
            return Err(RelayError::NoCredentials);
        }

        Ok(())
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    5000
}

fn default_base_url() -> String {
    "https://generativelanguage.googleapis.com/v1beta".to_string()
}

fn default_chat_path() -> String {
    "/openai/chat/completions".to_string()
}

fn default_forward_params() -> Vec<String> {
    [
        "model",
        "messages",
        "temperature",
        "max_tokens",
        "top_p",
        "top_k",
        "stop",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_max_attempts() -> u32 {
    8
}

fn default_attempt_timeout_secs() -> u64 {
    180
}

fn default_min_response_length() -> usize {
    400
}

fn default_backoff_initial_ms() -> u64 {
    200
}

fn default_backoff_max_ms() -> u64 {
    2000
}

fn default_cooldown_base_secs() -> u64 {
    60
}

fn default_cooldown_max_secs() -> u64 {
    600
}

fn default_buffered_chunks() -> usize {
    50
}

fn default_log_capacity() -> usize {
    1000
}

fn default_error_capacity() -> usize {
    100
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(name: &str, keys: &[&str]) -> KeyGroupConfig {
        KeyGroupConfig {
            name: name.to_string(),
            keys: keys.iter().map(|k| k.to_string()).collect(),
            keys_env: vec![],
        }
    }

    #[test]
    fn test_deserialize_minimal_config() {
        let json = r#"{
            "server": { "caller_secret": "sekret" },
            "key_groups": [
                { "name": "group1", "keys": ["AIzaSy-first-key-0001"] }
            ]
        }"#;

        let config: GatewayConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.server.port, 5000);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.retry.min_response_length, 400);
        assert_eq!(config.cooldown.policy, CooldownPolicy::Exponential);
        assert_eq!(config.streaming.mode, StreamMode::Relay);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_chat_url_joins_slashes() {
        let upstream = UpstreamConfig {
            base_url: "http://localhost:9000/v1beta/".to_string(),
            ..Default::default()
        };
        assert_eq!(
            upstream.chat_url(),
            "http://localhost:9000/v1beta/openai/chat/completions"
        );
    }

    #[test]
    fn test_resolve_keys_filters_placeholders() {
        let g = group(
            "group1",
            &["", "YOUR_API_KEY_HERE", "short", "AIzaSy-real-key-0001", "AIzaSy-real-key-0001"],
        );
        assert_eq!(g.resolve_keys(), vec!["AIzaSy-real-key-0001".to_string()]);
    }

    #[test]
    fn test_validate_rejects_missing_secret() {
        let config = GatewayConfig {
            key_groups: vec![group("group1", &["AIzaSy-real-key-0001"])],
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(RelayError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_no_usable_keys() {
        let mut config = GatewayConfig {
            key_groups: vec![group("group1", &["YOUR_KEY"])],
            ..Default::default()
        };
        config.server.caller_secret = "sekret".to_string();
        assert!(matches!(config.validate(), Err(RelayError::NoCredentials)));
    }

    #[test]
    fn test_validate_rejects_duplicate_groups() {
        let mut config = GatewayConfig {
            key_groups: vec![
                group("group1", &["AIzaSy-real-key-0001"]),
                group("group1", &["AIzaSy-real-key-0002"]),
            ],
            ..Default::default()
        };
        config.server.caller_secret = "sekret".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_cooldown_durations() {
        let fixed = CooldownConfig {
            policy: CooldownPolicy::Fixed,
            base_secs: 30,
            max_secs: 600,
        };
        assert_eq!(fixed.duration_for(1), Duration::from_secs(30));
        assert_eq!(fixed.duration_for(5), Duration::from_secs(30));

        let exp = CooldownConfig {
            policy: CooldownPolicy::Exponential,
            base_secs: 30,
            max_secs: 100,
        };
        assert_eq!(exp.duration_for(1), Duration::from_secs(30));
        assert_eq!(exp.duration_for(2), Duration::from_secs(60));
        assert_eq!(exp.duration_for(3), Duration::from_secs(100));
        assert_eq!(exp.duration_for(40), Duration::from_secs(100));
    }
}
