use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Normalized identifier of one unit of work (e.g. a postal code).
///
/// Canonical form is uppercase with every non-alphanumeric character
/// stripped, so `"ec1a 1bb"` and `"EC1A-1BB"` are the same key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WorkKey(String);

impl WorkKey {
    /// Normalize a raw value. Returns `None` if nothing survives normalization.
    pub fn parse(raw: &str) -> Option<Self> {
        let normalized: String = raw
            .chars()
            .filter(|c| c.is_alphanumeric())
            .flat_map(char::to_uppercase)
            .collect();
        if normalized.is_empty() {
            None
        } else {
            Some(Self(normalized))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for WorkKey {
    type Error = String;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        WorkKey::parse(&raw).ok_or_else(|| format!("Not a valid key: {raw:?}"))
    }
}

impl From<WorkKey> for String {
    fn from(key: WorkKey) -> Self {
        key.0
    }
}

/// Why a single fetch attempt did not succeed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// The external call exceeded its per-call timeout.
    Timeout,
    /// Waiting for passage at the throttle exceeded the gate ceiling.
    GateTimeout,
    /// Non-success status other than the rate-limit status.
    Status { status: u16, body: String },
    /// Transport-level failure.
    Network(String),
    /// A success response whose body was not the expected JSON.
    Malformed(String),
    /// The record could not be serialized or written to the sink.
    Serialization(String),
}

impl FailureReason {
    /// Failures that count toward the abort ceiling.
    ///
    /// A gate timeout only means the throttle stayed closed for too long,
    /// it says nothing about the health of the upstream API.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, FailureReason::GateTimeout)
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Timeout => write!(f, "timeout"),
            FailureReason::GateTimeout => write!(f, "throttle wait ceiling elapsed"),
            FailureReason::Status { status, .. } => write!(f, "HTTP {status}"),
            FailureReason::Network(msg) => write!(f, "network: {msg}"),
            FailureReason::Malformed(msg) => write!(f, "malformed response: {msg}"),
            FailureReason::Serialization(msg) => write!(f, "serialization: {msg}"),
        }
    }
}

/// Result of one attempt, before it is paired with its key.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchResult {
    /// The entries of the response that belong to the queried key.
    Success(Vec<serde_json::Value>),
    RateLimited,
    Failure(FailureReason),
}

/// Outcome of one fetch attempt, always paired with the key that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchOutcome {
    pub key: WorkKey,
    pub result: FetchResult,
}

impl FetchOutcome {
    pub fn success(key: WorkKey, payload: Vec<serde_json::Value>) -> Self {
        Self {
            key,
            result: FetchResult::Success(payload),
        }
    }

    pub fn rate_limited(key: WorkKey) -> Self {
        Self {
            key,
            result: FetchResult::RateLimited,
        }
    }

    pub fn failure(key: WorkKey, reason: FailureReason) -> Self {
        Self {
            key,
            result: FetchResult::Failure(reason),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.result, FetchResult::Success(_))
    }
}

/// One durable line of the output file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub key: WorkKey,
    pub fetch_timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl Record {
    /// Build a record stamped with the current time.
    pub fn new(key: WorkKey, payload: Vec<serde_json::Value>) -> Self {
        Self {
            key,
            fetch_timestamp: Utc::now(),
            payload: serde_json::Value::Array(payload),
        }
    }
}

/// Raw answer of the external search API for one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: String,
}

impl ApiResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every key of the worklist was attempted.
    Completed,
    /// The run deadline elapsed before the worklist was exhausted.
    TimedOut,
    /// Stopped from outside (e.g. Ctrl-C).
    Cancelled,
    /// The fatal-error ceiling was exceeded.
    Aborted,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Completed => "completed",
            RunStatus::TimedOut => "timed_out",
            RunStatus::Cancelled => "cancelled",
            RunStatus::Aborted => "aborted",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final report of a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub status: RunStatus,
    /// Keys handed to the fetch stage.
    pub attempted: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Failures that counted toward the abort ceiling.
    pub fatal_failures: u64,
    /// Keys given up after repeated rate limits; left for the next run.
    pub deferred: u64,
    /// Rate-limit responses observed (a key may be rate limited more than once).
    pub rate_limited: u64,
    /// Keys never started because the run stopped early.
    pub not_started: u64,
}
