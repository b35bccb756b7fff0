use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::AppError;
use crate::models::{ApiResponse, FailureReason, FetchOutcome, WorkKey};
use crate::throttle::Throttle;
use crate::traits::SearchApi;

/// Where the per-key entries live in a success response.
#[derive(Debug, Clone)]
pub struct ResponseShape {
    /// JSON pointer to the array of entries.
    pub items_pointer: String,
    /// JSON pointer, relative to one entry, to that entry's own location key.
    pub key_pointer: String,
}

impl Default for ResponseShape {
    fn default() -> Self {
        Self {
            items_pointer: "/businesses".to_string(),
            key_pointer: "/location/zip_code".to_string(),
        }
    }
}

/// Configuration for [`KeyFetcher`].
#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub call_timeout: Duration,
    /// Status the API uses to say "slow down".
    pub rate_limit_status: u16,
    pub shape: ResponseShape,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
            rate_limit_status: 429,
            shape: ResponseShape::default(),
        }
    }
}

/// Turns one key into one [`FetchOutcome`]: waits for passage at the
/// throttle, issues the call, and interprets the answer.
///
/// Never returns an error; every problem becomes a `Failure` outcome for
/// the key so the pipeline can tally it.
pub struct KeyFetcher<A: SearchApi> {
    api: A,
    throttle: Throttle,
    config: FetcherConfig,
}

impl<A: SearchApi> KeyFetcher<A> {
    pub fn new(api: A, throttle: Throttle, config: FetcherConfig) -> Self {
        Self {
            api,
            throttle,
            config,
        }
    }

    pub fn throttle(&self) -> &Throttle {
        &self.throttle
    }

    pub async fn fetch(&self, key: &WorkKey) -> FetchOutcome {
        let passage = self.throttle.acquire().await;
        self.after_passage(key, passage).await
    }

    /// Like [`fetch`](Self::fetch), but gives up while still waiting at the
    /// throttle if `cancel` fires. Returns `None` when the API was never
    /// called. A call already under way is always allowed to finish.
    pub async fn fetch_unless_cancelled(
        &self,
        key: &WorkKey,
        cancel: &CancellationToken,
    ) -> Option<FetchOutcome> {
        let passage = tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            passage = self.throttle.acquire() => passage,
        };
        Some(self.after_passage(key, passage).await)
    }

    async fn after_passage(&self, key: &WorkKey, passage: Result<(), AppError>) -> FetchOutcome {
        if let Err(e) = passage {
            tracing::warn!(%key, error = %e, "No passage from throttle");
            return FetchOutcome::failure(key.clone(), FailureReason::GateTimeout);
        }

        let response =
            match tokio::time::timeout(self.config.call_timeout, self.api.search(key)).await {
                Ok(Ok(response)) => response,
                Ok(Err(AppError::Timeout(_))) | Err(_) => {
                    return FetchOutcome::failure(key.clone(), FailureReason::Timeout);
                }
                Ok(Err(e)) => {
                    return FetchOutcome::failure(
                        key.clone(),
                        FailureReason::Network(e.to_string()),
                    );
                }
            };

        self.interpret(key, response)
    }

    fn interpret(&self, key: &WorkKey, response: ApiResponse) -> FetchOutcome {
        match response.status {
            200 => match extract_entries(key, &response.body, &self.config.shape) {
                Ok(entries) => FetchOutcome::success(key.clone(), entries),
                Err(msg) => FetchOutcome::failure(key.clone(), FailureReason::Malformed(msg)),
            },
            status if status == self.config.rate_limit_status => {
                FetchOutcome::rate_limited(key.clone())
            }
            status => FetchOutcome::failure(
                key.clone(),
                FailureReason::Status {
                    status,
                    body: response.body,
                },
            ),
        }
    }
}

/// Pull the entries out of a success body, keeping only those whose own
/// location key matches the query key. Upstream search is fuzzy and
/// happily returns neighbours.
pub fn extract_entries(
    key: &WorkKey,
    body: &str,
    shape: &ResponseShape,
) -> Result<Vec<Value>, String> {
    let document: Value = serde_json::from_str(body).map_err(|e| e.to_string())?;
    let items = document
        .pointer(&shape.items_pointer)
        .and_then(Value::as_array)
        .ok_or_else(|| format!("no array at {}", shape.items_pointer))?;

    let entries: Vec<Value> = items
        .iter()
        .filter(|item| {
            item.pointer(&shape.key_pointer)
                .and_then(Value::as_str)
                .and_then(WorkKey::parse)
                .is_some_and(|own| &own == key)
        })
        .cloned()
        .collect();

    let dropped = items.len() - entries.len();
    if dropped > 0 {
        tracing::debug!(%key, dropped, "Discarded entries for other keys");
    }
    Ok(entries)
}
