//! Run orchestration.
//!
//! Streams the worklist through a bounded pool of concurrent fetches. Each
//! key is fetched, classified by the [`ErrorPolicy`], counted by the
//! [`ProgressMonitor`], and on success appended to the sink. A rate-limited
//! key closes the throttle and is retried once the gate reopens.
//!
//! The run stops scheduling new keys when the cancellation token fires: on
//! abort, when the run deadline passes, or from outside (Ctrl-C). The sink is
//! flushed and progress reporting drained on every exit path.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::{StreamExt, future, stream};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::config::HarvestConfig;
use crate::error::AppError;
use crate::fetcher::KeyFetcher;
use crate::models::{
    FailureReason, FetchOutcome, FetchResult, Record, RunStatus, RunSummary, WorkKey,
};
use crate::policy::{ErrorPolicy, Verdict};
use crate::progress::{HarvestEvent, HarvestReporter, ProgressMonitor};
use crate::throttle::Throttle;
use crate::traits::{RecordSink, SearchApi};
use crate::worklist::Worklist;

/// What happened to one key of the worklist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyOutcome {
    Written,
    Failed,
    /// Rate limited more often than allowed; left for the next run.
    RetriesExhausted,
    /// Cancelled before the API was ever called for it.
    NotStarted,
}

#[derive(Debug, Default)]
struct Tally {
    attempted: u64,
    written: u64,
    failed: u64,
    deferred: u64,
}

impl Tally {
    /// Every attempted key lands in exactly one of written, failed or deferred.
    fn add(mut self, outcome: KeyOutcome) -> Self {
        match outcome {
            KeyOutcome::Written => self.written += 1,
            KeyOutcome::Failed => self.failed += 1,
            KeyOutcome::RetriesExhausted => self.deferred += 1,
            KeyOutcome::NotStarted => return self,
        }
        self.attempted += 1;
        self
    }
}

/// Drives one harvest run over a resolved [`Worklist`].
pub struct HarvestPipeline<A: SearchApi, S: RecordSink, R: HarvestReporter> {
    config: HarvestConfig,
    fetcher: KeyFetcher<A>,
    sink: S,
    policy: ErrorPolicy,
    reporter: Arc<R>,
}

impl<A, S, R> HarvestPipeline<A, S, R>
where
    A: SearchApi,
    S: RecordSink,
    R: HarvestReporter + 'static,
{
    /// Validate `config` and start the throttle. Must be called from within
    /// a Tokio runtime.
    pub fn new(
        config: HarvestConfig,
        api: A,
        sink: S,
        reporter: Arc<R>,
    ) -> Result<Self, AppError> {
        config.validate()?;
        let throttle = Throttle::spawn(config.throttle_config());
        let fetcher = KeyFetcher::new(api, throttle, config.fetcher_config());
        Ok(Self::with_fetcher(config, fetcher, sink, reporter))
    }

    /// Build around an existing fetcher, e.g. one sharing its throttle with
    /// other pipelines.
    pub fn with_fetcher(
        config: HarvestConfig,
        fetcher: KeyFetcher<A>,
        sink: S,
        reporter: Arc<R>,
    ) -> Self {
        let policy = ErrorPolicy::new(config.fatal_error_ceiling);
        Self {
            config,
            fetcher,
            sink,
            policy,
            reporter,
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn throttle(&self) -> &Throttle {
        self.fetcher.throttle()
    }

    /// Process every key of `worklist` until it is exhausted or `cancel`
    /// fires.
    ///
    /// Per-key problems never surface here; they end up in the summary.
    /// The only error is failing to flush the sink at the end.
    pub async fn run(
        &self,
        worklist: &Worklist,
        cancel: CancellationToken,
    ) -> Result<RunSummary, AppError> {
        let run_id = Uuid::new_v4();
        self.run_inner(run_id, worklist, cancel)
            .instrument(tracing::info_span!("harvest", %run_id))
            .await
    }

    async fn run_inner(
        &self,
        run_id: Uuid,
        worklist: &Worklist,
        cancel: CancellationToken,
    ) -> Result<RunSummary, AppError> {
        self.reporter.report(HarvestEvent::WorklistResolved {
            total: worklist.total,
            completed: worklist.completed,
            remaining: worklist.remaining(),
        });

        // Child token: stopping the run internally never cancels the caller.
        let stop = cancel.child_token();
        let timed_out = Arc::new(AtomicBool::new(false));
        let deadline = self
            .config
            .run_deadline
            .map(|after| spawn_deadline(after, stop.clone(), Arc::clone(&timed_out)));

        let progress = ProgressMonitor::spawn(
            self.config.progress_interval,
            self.config.progress_buffer,
            Arc::clone(&self.reporter),
        );

        let tally = stream::iter(worklist.keys.iter().cloned())
            .take_while(|_| future::ready(!stop.is_cancelled()))
            .map(|key| self.process_key(key, &stop, &progress))
            .buffer_unordered(self.config.concurrency)
            .fold(Tally::default(), |tally, outcome| future::ready(tally.add(outcome)))
            .await;

        if let Some(deadline) = deadline {
            deadline.abort();
        }

        let flushed = self.sink.flush().await;
        progress.finish().await;

        if let Ok(stats) = self.throttle().stats().await {
            tracing::debug!(
                closures = stats.closures,
                reopenings = stats.reopenings,
                state = %stats.state,
                "Throttle at end of run"
            );
        }

        let status = if self.policy.is_aborted() {
            RunStatus::Aborted
        } else if timed_out.load(Ordering::SeqCst) {
            RunStatus::TimedOut
        } else if cancel.is_cancelled() && tally.attempted < worklist.remaining() as u64 {
            RunStatus::Cancelled
        } else {
            RunStatus::Completed
        };

        let summary = RunSummary {
            run_id,
            status,
            attempted: tally.attempted,
            succeeded: tally.written,
            failed: tally.failed,
            fatal_failures: self.policy.fatal_failures(),
            deferred: tally.deferred,
            rate_limited: self.policy.rate_limits(),
            not_started: worklist.remaining() as u64 - tally.attempted,
        };
        self.reporter.report(HarvestEvent::Finished { summary: &summary });

        flushed?;
        Ok(summary)
    }

    async fn process_key(
        &self,
        key: WorkKey,
        stop: &CancellationToken,
        progress: &ProgressMonitor,
    ) -> KeyOutcome {
        let mut rate_limited = 0u32;
        loop {
            let Some(outcome) = self.fetcher.fetch_unless_cancelled(&key, stop).await else {
                return if rate_limited == 0 {
                    KeyOutcome::NotStarted
                } else {
                    KeyOutcome::RetriesExhausted
                };
            };

            let verdict = self.policy.classify(&outcome);
            progress.observe();

            match verdict {
                Verdict::Abort => {
                    stop.cancel();
                    return KeyOutcome::Failed;
                }
                Verdict::Throttle => {
                    self.throttle().report_rate_limited();
                    rate_limited += 1;
                    if rate_limited > self.config.max_rate_limit_retries {
                        tracing::warn!(
                            %key,
                            attempts = rate_limited,
                            "Giving up on rate-limited key"
                        );
                        return KeyOutcome::RetriesExhausted;
                    }
                }
                Verdict::Pass => {
                    let FetchOutcome { key, result } = outcome;
                    return match result {
                        FetchResult::Success(entries) => self.write(key, entries, stop).await,
                        _ => KeyOutcome::Failed,
                    };
                }
            }
        }
    }

    async fn write(
        &self,
        key: WorkKey,
        entries: Vec<serde_json::Value>,
        stop: &CancellationToken,
    ) -> KeyOutcome {
        let record = Record::new(key, entries);
        match self.sink.append(&record).await {
            Ok(()) => KeyOutcome::Written,
            Err(e) => {
                let reason = FailureReason::Serialization(e.to_string());
                let outcome = FetchOutcome::failure(record.key, reason);
                if self.policy.classify(&outcome) == Verdict::Abort {
                    stop.cancel();
                }
                KeyOutcome::Failed
            }
        }
    }
}

fn spawn_deadline(
    after: std::time::Duration,
    stop: CancellationToken,
    timed_out: Arc<AtomicBool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(after) => {
                tracing::info!(seconds = after.as_secs(), "Run deadline reached, winding down");
                timed_out.store(true, Ordering::SeqCst);
                stop.cancel();
            }
            _ = stop.cancelled() => {}
        }
    })
}
