//! Outcome classification and the run-wide abort ceiling.
//!
//! ```text
//! Success      --> Pass
//! RateLimited  --> Throttle  (the gate closes, the key is retried after passage)
//! Failure      --> Pass      while the fatal tally is within the ceiling
//!              --> Abort     once the tally exceeds it (latched)
//! ```
//!
//! Per-key failures are absorbed here: they are logged and tallied, and the
//! key simply stays out of this run's output. Only the ceiling breach stops
//! the run.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::models::{FailureReason, FetchOutcome, FetchResult};

/// Longest response body echoed into a log line.
const MAX_LOGGED_BODY: usize = 1024;

/// What the pipeline should do with an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Keep going; successes continue to the sink, everything else is dropped.
    Pass,
    /// Report the rate limit to the throttle and retry the key.
    Throttle,
    /// Stop scheduling work and wind the run down.
    Abort,
}

/// Classifies outcomes and trips once too many fatal failures were seen.
///
/// Counters are atomic so concurrent fetches can share one policy by
/// reference.
#[derive(Debug)]
pub struct ErrorPolicy {
    ceiling: u64,
    fatal: AtomicU64,
    failed: AtomicU64,
    rate_limited: AtomicU64,
    aborted: AtomicBool,
}

impl ErrorPolicy {
    /// `ceiling` fatal failures are tolerated; the next one aborts.
    pub fn new(ceiling: u64) -> Self {
        Self {
            ceiling,
            fatal: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            rate_limited: AtomicU64::new(0),
            aborted: AtomicBool::new(false),
        }
    }

    pub fn classify(&self, outcome: &FetchOutcome) -> Verdict {
        match &outcome.result {
            FetchResult::Success(_) => Verdict::Pass,
            FetchResult::RateLimited => {
                self.rate_limited.fetch_add(1, Ordering::Relaxed);
                tracing::info!(key = %outcome.key, "Rate limited");
                Verdict::Throttle
            }
            FetchResult::Failure(reason) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                log_failure(outcome, reason);

                if !reason.is_fatal() {
                    return Verdict::Pass;
                }
                let tally = self.fatal.fetch_add(1, Ordering::SeqCst) + 1;
                if tally <= self.ceiling {
                    return Verdict::Pass;
                }
                if !self.aborted.swap(true, Ordering::SeqCst) {
                    tracing::error!(
                        failures = tally,
                        ceiling = self.ceiling,
                        "aborting: too many failures"
                    );
                }
                Verdict::Abort
            }
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Failures that counted toward the ceiling.
    pub fn fatal_failures(&self) -> u64 {
        self.fatal.load(Ordering::SeqCst)
    }

    /// All failures, fatal or not.
    pub fn failures(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn rate_limits(&self) -> u64 {
        self.rate_limited.load(Ordering::Relaxed)
    }
}

fn log_failure(outcome: &FetchOutcome, reason: &FailureReason) {
    match reason {
        FailureReason::Status { status, body } => {
            let body: String = body.chars().take(MAX_LOGGED_BODY).collect();
            tracing::warn!(key = %outcome.key, %status, %body, "Non 200 response");
        }
        other => {
            tracing::warn!(key = %outcome.key, reason = %other, "Fetch failed");
        }
    }
}
