use super::{CompletionOutcome, StatsCollector};
use crate::client::Attempt;
use std::sync::Arc;
use std::time::Instant;

/// Owns the attempt log of one request and records it exactly once.
///
/// Dropped without [`RequestRecorder::finish`] means the caller went away
/// before the request completed; that is recorded as a failure.
#[derive(Debug)]
pub struct RequestRecorder {
    stats: Arc<StatsCollector>,
    attempts: Vec<Attempt>,
    started: Instant,
    armed: bool,
}

impl RequestRecorder {
    pub fn new(stats: Arc<StatsCollector>) -> Self {
        Self {
            stats,
            attempts: Vec::new(),
            started: Instant::now(),
            armed: true,
        }
    }

    pub fn push(&mut self, attempt: Attempt) {
        self.attempts.push(attempt);
    }

    pub fn attempts(&self) -> &[Attempt] {
        &self.attempts
    }

    /// Record the terminal outcome and disarm
    pub fn finish(mut self, outcome: CompletionOutcome) {
        self.armed = false;
        self.stats
            .record(&outcome, &self.attempts, self.started.elapsed());
    }
}

impl Drop for RequestRecorder {
    fn drop(&mut self) {
        if self.armed {
            tracing::info!(
                attempts = self.attempts.len(),
                "client disconnected before the request completed"
            );
            self.stats.record(
                &CompletionOutcome::failed(None, "client disconnected"),
                &self.attempts,
                self.started.elapsed(),
            );
        }
    }
}
