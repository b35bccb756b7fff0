use std::future::Future;

use crate::error::AppError;
use crate::models::{ApiResponse, Record, WorkKey};

/// Issues the one external call made per key.
///
/// Implementations return whatever status the API answered with; only
/// transport problems (connection refused, timeout inside the client) are
/// errors. Interpreting the status is the fetcher's job.
pub trait SearchApi: Send + Sync + Clone {
    fn search(&self, key: &WorkKey) -> impl Future<Output = Result<ApiResponse, AppError>> + Send;
}

/// Supplies the raw text of the full catalog.
pub trait CatalogSource: Send + Sync {
    /// Human-readable origin, used in logs and error messages.
    fn describe(&self) -> String;

    fn load(&self) -> impl Future<Output = Result<String, AppError>> + Send;
}

/// Append-only durable storage for successful records.
pub trait RecordSink: Send + Sync {
    /// Append one record. Must be safe to call from concurrent fetches.
    fn append(&self, record: &Record) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Push everything written so far to durable storage.
    fn flush(&self) -> impl Future<Output = Result<(), AppError>> + Send;
}
