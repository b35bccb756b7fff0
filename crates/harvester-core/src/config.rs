use std::time::Duration;

use crate::error::AppError;
use crate::fetcher::FetcherConfig;
use crate::throttle::ThrottleConfig;

/// Configuration for one harvest run.
///
/// Constructed once at startup and passed by reference to the components
/// that need it.
#[derive(Debug, Clone)]
pub struct HarvestConfig {
    /// Maximum number of keys in flight at once.
    pub concurrency: usize,
    /// How long the throttle stays closed after a rate-limit response.
    pub cool_down: Duration,
    /// Number of fatal failures tolerated; one more aborts the run.
    pub fatal_error_ceiling: u64,
    /// Emit a progress report every this many processed attempts.
    pub progress_interval: u64,
    /// Pending progress reports kept before the oldest is dropped.
    pub progress_buffer: usize,
    /// Timeout of a single external call.
    pub call_timeout: Duration,
    /// Longest a fetch may wait for passage at the throttle.
    pub gate_ceiling: Duration,
    /// Stop scheduling new keys once this much time has passed.
    pub run_deadline: Option<Duration>,
    /// Process at most this many keys of the worklist.
    pub max_keys: Option<usize>,
    /// How often the same key is retried after a rate-limit response.
    pub max_rate_limit_retries: u32,
    /// Status the upstream API uses for "too many requests".
    pub rate_limit_status: u16,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            concurrency: 2,
            cool_down: Duration::from_secs(30 * 60),
            fatal_error_ceiling: 10,
            progress_interval: 100,
            progress_buffer: 16,
            call_timeout: Duration::from_secs(30),
            gate_ceiling: Duration::from_secs(2 * 60 * 60),
            run_deadline: None,
            max_keys: None,
            max_rate_limit_retries: 5,
            rate_limit_status: 429,
        }
    }
}

impl HarvestConfig {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_cool_down(mut self, cool_down: Duration) -> Self {
        self.cool_down = cool_down;
        self
    }

    pub fn with_fatal_error_ceiling(mut self, ceiling: u64) -> Self {
        self.fatal_error_ceiling = ceiling;
        self
    }

    pub fn with_progress_interval(mut self, interval: u64) -> Self {
        self.progress_interval = interval;
        self
    }

    pub fn with_progress_buffer(mut self, buffer: usize) -> Self {
        self.progress_buffer = buffer;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_gate_ceiling(mut self, ceiling: Duration) -> Self {
        self.gate_ceiling = ceiling;
        self
    }

    pub fn with_run_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.run_deadline = deadline;
        self
    }

    pub fn with_max_keys(mut self, max_keys: Option<usize>) -> Self {
        self.max_keys = max_keys;
        self
    }

    pub fn with_max_rate_limit_retries(mut self, retries: u32) -> Self {
        self.max_rate_limit_retries = retries;
        self
    }

    pub fn with_rate_limit_status(mut self, status: u16) -> Self {
        self.rate_limit_status = status;
        self
    }

    pub fn throttle_config(&self) -> ThrottleConfig {
        ThrottleConfig::new(self.cool_down).with_ceiling(self.gate_ceiling)
    }

    pub fn fetcher_config(&self) -> FetcherConfig {
        FetcherConfig {
            call_timeout: self.call_timeout,
            rate_limit_status: self.rate_limit_status,
            ..FetcherConfig::default()
        }
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.concurrency == 0 {
            return Err(AppError::ConfigError(
                "concurrency must be at least 1".into(),
            ));
        }
        if self.progress_interval == 0 {
            return Err(AppError::ConfigError(
                "progress interval must be at least 1".into(),
            ));
        }
        if self.progress_buffer == 0 {
            return Err(AppError::ConfigError(
                "progress buffer must be at least 1".into(),
            ));
        }
        if self.call_timeout.is_zero() {
            return Err(AppError::ConfigError(
                "call timeout must be greater than zero".into(),
            ));
        }
        if self.rate_limit_status == 200 {
            return Err(AppError::ConfigError(
                "rate-limit status cannot be the success status".into(),
            ));
        }
        if self.gate_ceiling < self.cool_down {
            return Err(AppError::ConfigError(format!(
                "gate ceiling ({}s) must not be shorter than the cool-down ({}s)",
                self.gate_ceiling.as_secs(),
                self.cool_down.as_secs()
            )));
        }
        Ok(())
    }
}
