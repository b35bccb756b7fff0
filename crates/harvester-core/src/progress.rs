use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::models::RunSummary;

/// Events emitted during a run for monitoring/logging.
#[derive(Debug, Clone)]
pub enum HarvestEvent<'a> {
    WorklistResolved {
        total: usize,
        completed: usize,
        remaining: usize,
    },
    Progress {
        processed: u64,
    },
    Finished {
        summary: &'a RunSummary,
    },
}

/// Trait for receiving run events (decoupled logging).
pub trait HarvestReporter: Send + Sync {
    fn report(&self, event: HarvestEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl HarvestReporter for TracingReporter {
    fn report(&self, event: HarvestEvent<'_>) {
        match event {
            HarvestEvent::WorklistResolved {
                total,
                completed,
                remaining,
            } => {
                tracing::info!(%total, %completed, %remaining, "Worklist resolved");
            }
            HarvestEvent::Progress { processed } => {
                tracing::info!("Processed {processed} keys");
            }
            HarvestEvent::Finished { summary } => {
                tracing::info!(
                    run_id = %summary.run_id,
                    status = %summary.status,
                    attempted = summary.attempted,
                    succeeded = summary.succeeded,
                    failed = summary.failed,
                    fatal_failures = summary.fatal_failures,
                    deferred = summary.deferred,
                    rate_limited = summary.rate_limited,
                    not_started = summary.not_started,
                    "Run finished"
                );
            }
        }
    }
}

/// Counts processed attempts and reports every `interval` of them.
///
/// `observe` never waits on the reporter: reports go through a bounded
/// broadcast channel that overwrites the oldest pending report when the
/// reporter falls behind.
pub struct ProgressMonitor {
    count: AtomicU64,
    interval: u64,
    reports: broadcast::Sender<u64>,
    forwarder: JoinHandle<()>,
}

impl ProgressMonitor {
    /// Start the reporting task. Must be called from within a Tokio runtime.
    pub fn spawn<R>(interval: u64, buffer: usize, reporter: Arc<R>) -> Self
    where
        R: HarvestReporter + 'static,
    {
        let (reports, mut rx) = broadcast::channel(buffer.max(1));
        let forwarder = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(processed) => reporter.report(HarvestEvent::Progress { processed }),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "Progress reporter fell behind");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        Self {
            count: AtomicU64::new(0),
            interval: interval.max(1),
            reports,
            forwarder,
        }
    }

    /// Record one processed attempt. Returns the new count.
    pub fn observe(&self) -> u64 {
        let count = self.count.fetch_add(1, Ordering::SeqCst) + 1;
        if count % self.interval == 0 {
            // No receiver only means the forwarder is gone; nothing to report to.
            let _ = self.reports.send(count);
        }
        count
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::SeqCst)
    }

    /// Close the channel and wait until pending reports are delivered.
    pub async fn finish(self) -> u64 {
        let count = self.count();
        drop(self.reports);
        if let Err(e) = self.forwarder.await {
            tracing::warn!(error = %e, "Progress reporter task failed");
        }
        count
    }
}
