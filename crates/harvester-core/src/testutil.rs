//! Test utilities: mock implementations of the core traits.
//!
//! Handwritten mocks for dependency injection in unit and integration
//! tests. All mocks use `Arc<Mutex<_>>` for interior mutability, allowing
//! test assertions on recorded calls.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::error::AppError;
use crate::models::{ApiResponse, Record, RunStatus, RunSummary, WorkKey};
use crate::progress::{HarvestEvent, HarvestReporter};
use crate::traits::{RecordSink, SearchApi};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A success body in the upstream shape: one business per name, all
/// located in `key`.
pub fn business_body(key: &str, names: &[&str]) -> String {
    let businesses: Vec<serde_json::Value> = names
        .iter()
        .map(|name| serde_json::json!({"name": name, "location": {"zip_code": key}}))
        .collect();
    serde_json::json!({ "businesses": businesses }).to_string()
}

// ---------------------------------------------------------------------------
// MockSearchApi
// ---------------------------------------------------------------------------

/// Mock search API with scripted answers per key.
///
/// Each call pops the next scripted answer for its key. Keys without a
/// script (or whose script ran out) get a 200 with one business located in
/// the key.
#[derive(Clone, Default)]
pub struct MockSearchApi {
    scripts: Arc<Mutex<HashMap<String, VecDeque<Result<ApiResponse, AppError>>>>>,
    calls: Arc<Mutex<Vec<String>>>,
    delay: Option<Duration>,
}

impl MockSearchApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `response` for the next unanswered call for `key`.
    pub fn with_response(self, key: &str, response: ApiResponse) -> Self {
        self.push(key, Ok(response));
        self
    }

    pub fn with_error(self, key: &str, error: AppError) -> Self {
        self.push(key, Err(error));
        self
    }

    /// Delay every answer by `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn push(&self, key: &str, answer: Result<ApiResponse, AppError>) {
        lock(&self.scripts)
            .entry(key.to_string())
            .or_default()
            .push_back(answer);
    }

    /// Keys queried so far, in call order.
    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    pub fn call_count(&self, key: &str) -> usize {
        lock(&self.calls).iter().filter(|k| *k == key).count()
    }
}

impl SearchApi for MockSearchApi {
    async fn search(&self, key: &WorkKey) -> Result<ApiResponse, AppError> {
        lock(&self.calls).push(key.to_string());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = lock(&self.scripts)
            .get_mut(key.as_str())
            .and_then(VecDeque::pop_front);
        scripted.unwrap_or_else(|| {
            Ok(ApiResponse::new(
                200,
                business_body(key.as_str(), &[&format!("place in {key}")]),
            ))
        })
    }
}

// ---------------------------------------------------------------------------
// MemorySink
// ---------------------------------------------------------------------------

/// In-memory record sink. Appends for keys listed with
/// [`failing_for`](Self::failing_for) fail with an I/O error.
#[derive(Clone, Default)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<Record>>>,
    failing: Arc<Mutex<HashSet<String>>>,
    flushes: Arc<Mutex<usize>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_for(self, keys: &[&str]) -> Self {
        lock(&self.failing).extend(keys.iter().map(|k| k.to_string()));
        self
    }

    pub fn records(&self) -> Vec<Record> {
        lock(&self.records).clone()
    }

    /// Keys of the stored records, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = lock(&self.records)
            .iter()
            .map(|r| r.key.to_string())
            .collect();
        keys.sort();
        keys
    }

    pub fn flush_count(&self) -> usize {
        *lock(&self.flushes)
    }
}

impl RecordSink for MemorySink {
    async fn append(&self, record: &Record) -> Result<(), AppError> {
        if lock(&self.failing).contains(record.key.as_str()) {
            return Err(AppError::Io(std::io::Error::other("disk full")));
        }
        lock(&self.records).push(record.clone());
        Ok(())
    }

    async fn flush(&self) -> Result<(), AppError> {
        *lock(&self.flushes) += 1;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// RecordingReporter
// ---------------------------------------------------------------------------

/// Reporter that keeps what it was told.
#[derive(Default)]
pub struct RecordingReporter {
    progress: Mutex<Vec<u64>>,
    resolved: Mutex<Option<(usize, usize, usize)>>,
    finished: Mutex<Option<RunStatus>>,
}

impl RecordingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn progress(&self) -> Vec<u64> {
        lock(&self.progress).clone()
    }

    /// `(total, completed, remaining)` of the resolved worklist.
    pub fn resolved(&self) -> Option<(usize, usize, usize)> {
        *lock(&self.resolved)
    }

    pub fn finished(&self) -> Option<RunStatus> {
        *lock(&self.finished)
    }
}

impl HarvestReporter for RecordingReporter {
    fn report(&self, event: HarvestEvent<'_>) {
        match event {
            HarvestEvent::WorklistResolved {
                total,
                completed,
                remaining,
            } => *lock(&self.resolved) = Some((total, completed, remaining)),
            HarvestEvent::Progress { processed } => lock(&self.progress).push(processed),
            HarvestEvent::Finished { summary } => {
                let RunSummary { status, .. } = summary;
                *lock(&self.finished) = Some(*status);
            }
        }
    }
}
