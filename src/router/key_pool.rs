//! API Key Pool Management
//!
//! Holds the upstream credentials in prioritized groups, rotates through each
//! group round-robin and keeps per-credential cooldown state.

use crate::config::{CooldownConfig, GatewayConfig};
use crate::error::{RelayError, Result};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Position of a credential inside a [`KeyPool`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CredentialId {
    pub group: usize,
    pub index: usize,
}

/// A selected credential. Cheap to clone; never prints the secret.
#[derive(Clone)]
pub struct Credential {
    id: CredentialId,
    secret: Arc<str>,
    group_name: Arc<str>,
}

impl Credential {
    pub fn id(&self) -> CredentialId {
        self.id
    }

    /// The raw secret, only for building the upstream Authorization header
    pub fn secret(&self) -> &str {
        &self.secret
    }

    pub fn group_name(&self) -> &str {
        &self.group_name
    }

    /// Masked form safe for logs and monitoring output
    pub fn masked(&self) -> String {
        mask_key(&self.secret)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("group", &self.group_name)
            .field("index", &self.id.index)
            .field("key", &self.masked())
            .finish()
    }
}

/// First 8 characters followed by `...`
pub fn mask_key(key: &str) -> String {
    let prefix: String = key.chars().take(8).collect();
    format!("{}...", prefix)
}

/// What an attempt means for the health of the credential that made it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyOutcome {
    /// Upstream accepted the call; clears cooldown and failure streak
    Success,

    /// 429 or quota exhaustion
    RateLimited { retry_after: Option<Duration> },

    /// 5xx from upstream
    Unavailable { retry_after: Option<Duration> },

    /// The attempt hit its wall-clock limit
    TimedOut,

    /// Failure not caused by the credential (truncation, transport, bad body)
    Soft,

    /// Upstream refused the request (fatal 4xx)
    Rejected,
}

impl KeyOutcome {
    fn cools(&self) -> bool {
        matches!(
            self,
            KeyOutcome::RateLimited { .. } | KeyOutcome::Unavailable { .. } | KeyOutcome::TimedOut
        )
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            KeyOutcome::RateLimited { retry_after } | KeyOutcome::Unavailable { retry_after } => {
                *retry_after
            }
            _ => None,
        }
    }
}

/// Mutable health of one credential
#[derive(Debug, Default, Clone)]
struct KeyHealth {
    cooling_until: Option<Instant>,
    consecutive_failures: u32,
    requests: u64,
    failures: u64,
}

impl KeyHealth {
    fn cooldown_remaining(&self, now: Instant) -> Option<Duration> {
        self.cooling_until
            .filter(|until| *until > now)
            .map(|until| until - now)
    }

    fn is_cooling(&self, now: Instant) -> bool {
        self.cooldown_remaining(now).is_some()
    }
}

#[derive(Debug)]
struct GroupState {
    cursor: usize,
    health: Vec<KeyHealth>,
}

/// A named, ordered group of credentials with its own rotation cursor
#[derive(Debug)]
struct KeyGroup {
    name: Arc<str>,
    secrets: Vec<Arc<str>>,
    state: Mutex<GroupState>,
}

impl KeyGroup {
    fn new(name: String, keys: Vec<String>) -> Self {
        let health = vec![KeyHealth::default(); keys.len()];
        Self {
            name: name.into(),
            secrets: keys.into_iter().map(Arc::from).collect(),
            state: Mutex::new(GroupState { cursor: 0, health }),
        }
    }
}

/// Pool of API keys with rotation support
#[derive(Debug)]
pub struct KeyPool {
    groups: Vec<KeyGroup>,
    cooldown: CooldownConfig,
}

impl KeyPool {
    /// Create a pool from `(group name, keys)` pairs in priority order.
    /// Groups without keys are dropped.
    pub fn new(groups: Vec<(String, Vec<String>)>, cooldown: CooldownConfig) -> Self {
        Self {
            groups: groups
                .into_iter()
                .filter(|(_, keys)| !keys.is_empty())
                .map(|(name, keys)| KeyGroup::new(name, keys))
                .collect(),
            cooldown,
        }
    }

    /// Build the pool from a loaded configuration
    pub fn from_config(config: &GatewayConfig) -> Result<Self> {
        let groups: Vec<(String, Vec<String>)> = config
            .key_groups
            .iter()
            .map(|g| (g.name.clone(), g.resolve_keys()))
            .collect();

        let pool = Self::new(groups, config.cooldown.clone());
        if pool.is_empty() {
            return Err(RelayError::NoCredentials);
        }

        tracing::info!(
            groups = pool.groups.len(),
            keys = pool.len(),
            "key pool built"
        );
        Ok(pool)
    }

    /// Check if the pool is empty
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Total number of credentials across all groups
    pub fn len(&self) -> usize {
        self.groups.iter().map(|g| g.secrets.len()).sum()
    }

    /// Select the next credential.
    ///
    /// Groups are walked in priority order. Inside a group the scan starts at
    /// the rotation cursor and wraps once; the first credential that is neither
    /// excluded nor cooling wins and the cursor moves past it. `None` means
    /// every credential is excluded or cooling.
    pub fn select_credential(&self, excluding: &HashSet<CredentialId>) -> Option<Credential> {
        let now = Instant::now();

        for (group_idx, group) in self.groups.iter().enumerate() {
            let len = group.secrets.len();
            let mut state = group.state.lock();

            for offset in 0..len {
                let idx = (state.cursor + offset) % len;
                let id = CredentialId {
                    group: group_idx,
                    index: idx,
                };

                if excluding.contains(&id) || state.health[idx].is_cooling(now) {
                    continue;
                }

                state.cursor = (idx + 1) % len;
                state.health[idx].requests += 1;

                return Some(Credential {
                    id,
                    secret: group.secrets[idx].clone(),
                    group_name: group.name.clone(),
                });
            }
        }

        None
    }

    /// Update the health of a credential after an attempt
    pub fn mark_outcome(&self, credential: &Credential, outcome: KeyOutcome) {
        let Some(group) = self.groups.get(credential.id.group) else {
            return;
        };
        let mut state = group.state.lock();
        let Some(health) = state.health.get_mut(credential.id.index) else {
            return;
        };

        match outcome {
            KeyOutcome::Success => {
                health.cooling_until = None;
                health.consecutive_failures = 0;
            }
            _ if outcome.cools() => {
                health.consecutive_failures = health.consecutive_failures.saturating_add(1);
                health.failures += 1;

                let mut duration = self.cooldown.duration_for(health.consecutive_failures);
                if let Some(retry_after) = outcome.retry_after() {
                    duration = duration.max(retry_after.min(self.cooldown.max()));
                }
                health.cooling_until = Some(Instant::now() + duration);

                tracing::warn!(
                    group = %credential.group_name,
                    key = %credential.masked(),
                    failures = health.consecutive_failures,
                    cooldown_secs = duration.as_secs_f64(),
                    "credential cooling down"
                );
            }
            _ => {
                health.failures += 1;
            }
        }
    }

    /// Check if every credential is currently cooling
    pub fn all_cooling(&self) -> bool {
        let now = Instant::now();
        self.groups
            .iter()
            .all(|g| g.state.lock().health.iter().all(|h| h.is_cooling(now)))
    }

    /// Get the minimum wait time until a cooling key is available again
    pub fn min_wait_time(&self) -> Option<Duration> {
        let now = Instant::now();
        self.groups
            .iter()
            .flat_map(|g| {
                let state = g.state.lock();
                state
                    .health
                    .iter()
                    .filter_map(|h| h.cooldown_remaining(now))
                    .collect::<Vec<_>>()
            })
            .min()
    }

    /// Masked per-credential health for the monitoring surface
    pub fn health(&self) -> Vec<GroupHealth> {
        let now = Instant::now();

        self.groups
            .iter()
            .map(|group| {
                let state = group.state.lock();
                let keys: Vec<KeyStatus> = group
                    .secrets
                    .iter()
                    .zip(state.health.iter())
                    .map(|(secret, health)| {
                        let remaining = health.cooldown_remaining(now);
                        KeyStatus {
                            key: mask_key(secret),
                            available: remaining.is_none(),
                            cooldown_remaining_secs: remaining.map(|d| d.as_secs()),
                            consecutive_failures: health.consecutive_failures,
                            requests: health.requests,
                            failures: health.failures,
                        }
                    })
                    .collect();

                let cooling = keys.iter().filter(|k| !k.available).count();
                GroupHealth {
                    name: group.name.to_string(),
                    total_keys: keys.len(),
                    available_keys: keys.len() - cooling,
                    cooling_keys: cooling,
                    keys,
                }
            })
            .collect()
    }
}

/// Health of one key group
#[derive(Debug, Clone, Serialize)]
pub struct GroupHealth {
    pub name: String,
    pub total_keys: usize,
    pub available_keys: usize,
    pub cooling_keys: usize,
    pub keys: Vec<KeyStatus>,
}

/// Health of one credential, secret masked
#[derive(Debug, Clone, Serialize)]
pub struct KeyStatus {
    pub key: String,
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cooldown_remaining_secs: Option<u64>,
    pub consecutive_failures: u32,
    pub requests: u64,
    pub failures: u64,
}
