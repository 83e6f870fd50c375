//! Request Statistics
//!
//! In-memory counters, bounded recent-event buffers and derived metrics for
//! the monitoring endpoints. Every mutation happens under one short lock.

mod recorder;

pub use recorder::RequestRecorder;

use crate::client::{Attempt, ErrorKind};
use crate::config::StatsConfig;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

/// Requests considered for the average response time
const RESPONSE_TIME_WINDOW: usize = 100;

/// Longest error message kept in an error record
const MAX_ERROR_MESSAGE_CHARS: usize = 500;

/// Terminal result of one client request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionOutcome {
    /// Buffered answer delivered
    Success,

    /// Relayed stream finished; `truncated` is the verdict on what was relayed
    SuccessStreamed { truncated: bool },

    /// No usable answer. `kind` is the error of the final attempt, if any.
    Failed {
        kind: Option<ErrorKind>,
        reason: String,
    },
}

impl CompletionOutcome {
    pub fn failed(kind: Option<ErrorKind>, reason: impl Into<String>) -> Self {
        CompletionOutcome::Failed {
            kind,
            reason: reason.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        !matches!(self, CompletionOutcome::Failed { .. })
    }

    fn final_kind(&self) -> Option<ErrorKind> {
        match self {
            CompletionOutcome::Success => None,
            CompletionOutcome::SuccessStreamed { truncated } => {
                truncated.then_some(ErrorKind::Truncated)
            }
            CompletionOutcome::Failed { kind, .. } => *kind,
        }
    }
}

/// Log level of a recent-event line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// One recent-event line
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

/// One failed request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorEntry {
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    pub attempts: usize,
}

/// Usage of one credential, keyed by `group/position` in the snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct KeyUsage {
    /// Masked key
    pub key: String,
    pub requests: u64,
    pub failures: u64,
}

/// Cumulative request counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Counters {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub truncated_responses: u64,
    pub rate_limited_requests: u64,
    pub timeout_requests: u64,
    pub streamed_requests: u64,
    pub total_attempts: u64,
}

/// Point-in-time copy of the statistics
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    #[serde(flatten)]
    pub counters: Counters,

    /// Percent of successful requests, two decimals
    pub success_rate: f64,

    /// Mean over the most recent requests, milliseconds
    pub average_response_time_ms: f64,

    pub status_codes: BTreeMap<u16, u64>,
    pub key_usage: BTreeMap<String, KeyUsage>,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: i64,

    /// Newest log lines, oldest first
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub recent_logs: Vec<LogEntry>,

    /// Newest error records, oldest first
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub recent_errors: Vec<ErrorEntry>,
}

#[derive(Debug)]
struct StatsState {
    counters: Counters,
    status_codes: BTreeMap<u16, u64>,
    key_usage: BTreeMap<String, KeyUsage>,
    response_times: VecDeque<Duration>,
    logs: VecDeque<LogEntry>,
    errors: VecDeque<ErrorEntry>,
}

impl StatsState {
    fn new() -> Self {
        Self {
            counters: Counters::default(),
            status_codes: BTreeMap::new(),
            key_usage: BTreeMap::new(),
            response_times: VecDeque::with_capacity(RESPONSE_TIME_WINDOW),
            logs: VecDeque::new(),
            errors: VecDeque::new(),
        }
    }
}

/// Thread-safe statistics shared by every request
#[derive(Debug)]
pub struct StatsCollector {
    state: Mutex<StatsState>,
    started_at: DateTime<Utc>,
    log_capacity: usize,
    error_capacity: usize,
}

impl Default for StatsCollector {
    fn default() -> Self {
        Self::new(&StatsConfig::default())
    }
}

impl StatsCollector {
    pub fn new(config: &StatsConfig) -> Self {
        Self {
            state: Mutex::new(StatsState::new()),
            started_at: Utc::now(),
            log_capacity: config.log_capacity.max(1),
            error_capacity: config.error_capacity.max(1),
        }
    }

    /// Record one finished request with its attempt log.
    ///
    /// Classification counters follow the outcome (the final attempt); the
    /// status histogram and key usage count every attempt.
    pub fn record(&self, outcome: &CompletionOutcome, attempts: &[Attempt], elapsed: Duration) {
        let now = Utc::now();
        let mut state = self.state.lock();

        let counters = &mut state.counters;
        counters.total_requests += 1;
        counters.total_attempts += attempts.len() as u64;

        match outcome {
            CompletionOutcome::Success => counters.successful_requests += 1,
            CompletionOutcome::SuccessStreamed { .. } => {
                counters.successful_requests += 1;
                counters.streamed_requests += 1;
            }
            CompletionOutcome::Failed { .. } => counters.failed_requests += 1,
        }

        match outcome.final_kind() {
            Some(ErrorKind::Truncated) => counters.truncated_responses += 1,
            Some(ErrorKind::RateLimited) => counters.rate_limited_requests += 1,
            Some(ErrorKind::Timeout) => counters.timeout_requests += 1,
            _ => {}
        }

        let last = attempts.len().saturating_sub(1);
        for (i, attempt) in attempts.iter().enumerate() {
            if let Some(status) = attempt.status {
                *state.status_codes.entry(status).or_default() += 1;
            }

            // Masks share the vendor prefix; the position tells keys apart
            let slot = format!("{}/{}", attempt.group, attempt.credential.index + 1);
            let usage = state.key_usage.entry(slot).or_default();
            usage.key.clone_from(&attempt.key);
            usage.requests += 1;
            if !attempt.is_success() || (i == last && !outcome.is_success()) {
                usage.failures += 1;
            }
        }

        if state.response_times.len() == RESPONSE_TIME_WINDOW {
            state.response_times.pop_front();
        }
        state.response_times.push_back(elapsed);

        let final_attempt = attempts.last();
        let key = final_attempt.map(|a| a.key.as_str()).unwrap_or("-");
        let (level, message) = match outcome {
            CompletionOutcome::Success => (
                LogLevel::Info,
                format!(
                    "request succeeded with key {} after {} attempt(s) in {} ms",
                    key,
                    attempts.len(),
                    elapsed.as_millis()
                ),
            ),
            CompletionOutcome::SuccessStreamed { truncated } => (
                if *truncated {
                    LogLevel::Warn
                } else {
                    LogLevel::Info
                },
                format!(
                    "stream finished with key {}{} in {} ms",
                    key,
                    if *truncated { " (truncated)" } else { "" },
                    elapsed.as_millis()
                ),
            ),
            CompletionOutcome::Failed { reason, .. } => (
                LogLevel::Error,
                format!(
                    "request failed after {} attempt(s): {}",
                    attempts.len(),
                    reason
                ),
            ),
        };
        push_bounded(
            &mut state.logs,
            LogEntry {
                timestamp: now,
                level,
                message,
            },
            self.log_capacity,
        );

        if let CompletionOutcome::Failed { kind, reason } = outcome {
            let entry = ErrorEntry {
                timestamp: now,
                status: final_attempt.and_then(|a| a.status),
                kind: *kind,
                message: reason.chars().take(MAX_ERROR_MESSAGE_CHARS).collect(),
                key: final_attempt.map(|a| a.key.clone()),
                attempts: attempts.len(),
            };
            push_bounded(&mut state.errors, entry, self.error_capacity);
        }
    }

    /// Append an engine event to the recent log and mirror it to tracing
    pub fn add_log(&self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            LogLevel::Debug => tracing::debug!("{}", message),
            LogLevel::Info => tracing::info!("{}", message),
            LogLevel::Warn => tracing::warn!("{}", message),
            LogLevel::Error => tracing::error!("{}", message),
        }

        let entry = LogEntry {
            timestamp: Utc::now(),
            level,
            message,
        };
        push_bounded(&mut self.state.lock().logs, entry, self.log_capacity);
    }

    /// Consistent copy of counters and derived metrics
    pub fn snapshot(&self) -> StatsSnapshot {
        self.snapshot_with_recent(0, 0)
    }

    /// Like [`StatsCollector::snapshot`], plus the newest `log_limit` log
    /// lines and `error_limit` error records, all taken under one lock
    pub fn snapshot_with_recent(&self, log_limit: usize, error_limit: usize) -> StatsSnapshot {
        let state = self.state.lock();
        let counters = state.counters.clone();

        let success_rate = if counters.total_requests == 0 {
            0.0
        } else {
            let rate = counters.successful_requests as f64 / counters.total_requests as f64 * 100.0;
            (rate * 100.0).round() / 100.0
        };

        let average_response_time_ms = if state.response_times.is_empty() {
            0.0
        } else {
            let total: Duration = state.response_times.iter().sum();
            let avg = total.as_secs_f64() * 1000.0 / state.response_times.len() as f64;
            (avg * 100.0).round() / 100.0
        };

        StatsSnapshot {
            counters,
            success_rate,
            average_response_time_ms,
            status_codes: state.status_codes.clone(),
            key_usage: state.key_usage.clone(),
            started_at: self.started_at,
            uptime_secs: (Utc::now() - self.started_at).num_seconds(),
            recent_logs: tail(&state.logs, log_limit),
            recent_errors: tail(&state.errors, error_limit),
        }
    }

    /// Zero every counter and clear the buffers. Uptime is kept.
    pub fn reset(&self) {
        *self.state.lock() = StatsState::new();
    }
}

fn tail<T: Clone>(buffer: &VecDeque<T>, limit: usize) -> Vec<T> {
    let skip = buffer.len().saturating_sub(limit);
    buffer.iter().skip(skip).cloned().collect()
}

fn push_bounded<T>(buffer: &mut VecDeque<T>, item: T, capacity: usize) {
    while buffer.len() >= capacity {
        buffer.pop_front();
    }
    buffer.push_back(item);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CooldownConfig;
    use crate::router::KeyPool;
    use std::collections::HashSet;

    fn attempts(statuses: &[(u16, Option<ErrorKind>)]) -> Vec<Attempt> {
        let pool = KeyPool::new(
            vec![(
                "group1".to_string(),
                vec!["AIzaSyFirstKey000".to_string(), "AIzaSySecondKey00".to_string()],
            )],
            CooldownConfig::default(),
        );

        statuses
            .iter()
            .map(|(status, kind)| {
                let credential = pool.select_credential(&HashSet::new()).unwrap();
                let mut builder = Attempt::begin(&credential);
                builder.status(*status);
                match kind {
                    Some(kind) => builder.fail(*kind, "boom"),
                    None => builder.succeed(),
                }
            })
            .collect()
    }

    #[test]
    fn test_counts_follow_final_attempt() {
        let stats = StatsCollector::default();
        let log = attempts(&[(200, Some(ErrorKind::Truncated)), (200, None)]);

        stats.record(&CompletionOutcome::Success, &log, Duration::from_millis(40));

        let snap = stats.snapshot();
        assert_eq!(snap.counters.total_requests, 1);
        assert_eq!(snap.counters.successful_requests, 1);
        assert_eq!(snap.counters.truncated_responses, 0);
        assert_eq!(snap.counters.total_attempts, 2);
        assert_eq!(snap.status_codes.get(&200), Some(&2));
        assert_eq!(snap.key_usage["group1/1"].failures, 1);
        assert_eq!(snap.key_usage["group1/1"].key, "AIzaSyFi...");
        assert_eq!(snap.key_usage["group1/2"].failures, 0);
        assert_eq!(snap.success_rate, 100.0);
    }

    #[test]
    fn test_key_usage_separates_keys_with_same_mask() {
        let pool = KeyPool::new(
            vec![(
                "group1".to_string(),
                vec!["AIzaSyTestKeyA00001".to_string(), "AIzaSyTestKeyB00002".to_string()],
            )],
            CooldownConfig::default(),
        );
        let log: Vec<Attempt> = (0..2)
            .map(|_| {
                let credential = pool.select_credential(&HashSet::new()).unwrap();
                Attempt::begin(&credential).fail(ErrorKind::ServerUnavailable, "down")
            })
            .collect();
        assert_eq!(log[0].key, log[1].key);

        let stats = StatsCollector::default();
        stats.record(
            &CompletionOutcome::failed(Some(ErrorKind::ServerUnavailable), "down"),
            &log,
            Duration::from_millis(10),
        );

        let usage = stats.snapshot().key_usage;
        assert_eq!(usage.len(), 2);
        assert_eq!(usage["group1/1"].requests, 1);
        assert_eq!(usage["group1/2"].requests, 1);
    }

    #[test]
    fn test_snapshot_with_recent_buffers() {
        let stats = StatsCollector::default();
        let log = attempts(&[(503, Some(ErrorKind::ServerUnavailable))]);
        stats.record(
            &CompletionOutcome::failed(Some(ErrorKind::ServerUnavailable), "down"),
            &log,
            Duration::from_millis(5),
        );

        let snap = stats.snapshot_with_recent(10, 10);
        assert_eq!(snap.counters.failed_requests, 1);
        assert_eq!(snap.recent_errors.len(), 1);
        assert_eq!(snap.recent_logs.len(), 1);

        // Plain snapshots leave the buffers out of the JSON
        let value = serde_json::to_value(stats.snapshot()).unwrap();
        assert!(value.get("recent_logs").is_none());
        assert!(value.get("recent_errors").is_none());
        assert_eq!(value["failed_requests"], 1);
    }

    #[test]
    fn test_failed_request_classification() {
        let stats = StatsCollector::default();
        let log = attempts(&[
            (429, Some(ErrorKind::RateLimited)),
            (429, Some(ErrorKind::RateLimited)),
        ]);

        stats.record(
            &CompletionOutcome::failed(Some(ErrorKind::RateLimited), "rate limited"),
            &log,
            Duration::from_millis(10),
        );

        let snap = stats.snapshot();
        assert_eq!(snap.counters.failed_requests, 1);
        assert_eq!(snap.counters.rate_limited_requests, 1);
        assert_eq!(snap.status_codes.get(&429), Some(&2));

        let errors = stats.snapshot_with_recent(0, 20).recent_errors;
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].status, Some(429));
        assert_eq!(errors[0].attempts, 2);
        assert_eq!(errors[0].key.as_deref(), Some("AIzaSySe..."));
    }

    #[test]
    fn test_streamed_truncation_counts() {
        let stats = StatsCollector::default();
        let log = attempts(&[(200, None)]);

        stats.record(
            &CompletionOutcome::SuccessStreamed { truncated: true },
            &log,
            Duration::from_millis(10),
        );

        let snap = stats.snapshot();
        assert_eq!(snap.counters.successful_requests, 1);
        assert_eq!(snap.counters.streamed_requests, 1);
        assert_eq!(snap.counters.truncated_responses, 1);
        assert_eq!(stats.snapshot_with_recent(1, 0).recent_logs[0].level, LogLevel::Warn);
    }

    #[test]
    fn test_success_rate_rounding() {
        let stats = StatsCollector::default();
        let ok = attempts(&[(200, None)]);
        let failed = attempts(&[(500, Some(ErrorKind::ServerUnavailable))]);

        stats.record(&CompletionOutcome::Success, &ok, Duration::from_millis(10));
        stats.record(
            &CompletionOutcome::failed(Some(ErrorKind::ServerUnavailable), "down"),
            &failed,
            Duration::from_millis(30),
        );
        stats.record(
            &CompletionOutcome::failed(Some(ErrorKind::ServerUnavailable), "down"),
            &failed,
            Duration::from_millis(20),
        );

        let snap = stats.snapshot();
        assert_eq!(snap.success_rate, 33.33);
        assert_eq!(snap.average_response_time_ms, 20.0);
    }

    #[test]
    fn test_bounded_buffers() {
        let stats = StatsCollector::new(&StatsConfig {
            log_capacity: 3,
            error_capacity: 2,
        });

        for i in 0..5 {
            stats.add_log(LogLevel::Info, format!("event {}", i));
            stats.record(
                &CompletionOutcome::failed(None, format!("failure {}", i)),
                &[],
                Duration::ZERO,
            );
        }

        let logs = stats.snapshot_with_recent(100, 0).recent_logs;
        assert_eq!(logs.len(), 3);
        assert!(logs[2].message.contains("failure 4"));

        let errors = stats.snapshot_with_recent(0, 100).recent_errors;
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].message, "failure 3");
        assert_eq!(stats.snapshot_with_recent(0, 1).recent_errors[0].message, "failure 4");
    }

    #[test]
    fn test_reset_is_idempotent() {
        let stats = StatsCollector::default();
        let log = attempts(&[(503, Some(ErrorKind::ServerUnavailable)), (200, None)]);
        stats.record(&CompletionOutcome::Success, &log, Duration::from_millis(5));
        stats.add_log(LogLevel::Warn, "something");

        stats.reset();
        let first = stats.snapshot();
        stats.reset();
        let second = stats.snapshot();

        assert_eq!(first.counters, Counters::default());
        assert_eq!(first.counters, second.counters);
        assert_eq!(first.status_codes, second.status_codes);
        assert_eq!(first.key_usage, second.key_usage);
        assert_eq!(first.started_at, second.started_at);
        assert!(stats.snapshot_with_recent(10, 0).recent_logs.is_empty());
        assert!(stats.snapshot_with_recent(0, 10).recent_errors.is_empty());
    }
}
