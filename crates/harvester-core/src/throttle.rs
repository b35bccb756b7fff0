//! Shared admission gate for calls to a rate-limited API.
//!
//! Every fetch asks the gate for passage before it issues its call. While the
//! gate is open, passage is granted immediately. A rate-limit response closes
//! the gate for a fixed cool-down; requests arriving in the meantime are
//! queued and all of them are granted together when the gate reopens.
//!
//! # Gate States
//!
//! ```text
//! OPEN --[rate limited]--> CLOSED (queueing) --[cool-down elapsed]--> OPEN
//!                            |      ^
//!                            +------+ rate limited again: ignored,
//!                                     the original deadline stands
//! ```
//!
//! The state is owned by a single control task. Handles talk to it over a
//! channel, so closing on a rate limit and reopening on the timer can never
//! race each other.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, sleep_until};

use crate::error::AppError;

/// Externally visible state of the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    /// Requests pass immediately.
    Open,
    /// Requests are queued until the cool-down elapses.
    Closed,
}

impl std::fmt::Display for GateState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GateState::Open => write!(f, "open"),
            GateState::Closed => write!(f, "closed"),
        }
    }
}

/// Configuration for the throttle.
#[derive(Debug, Clone)]
pub struct ThrottleConfig {
    /// How long the gate stays closed after a rate-limit report.
    pub cool_down: Duration,

    /// Longest a single request waits for passage before giving up.
    pub ceiling: Duration,
}

impl ThrottleConfig {
    pub fn new(cool_down: Duration) -> Self {
        Self {
            cool_down,
            ..Default::default()
        }
    }

    pub fn with_ceiling(mut self, ceiling: Duration) -> Self {
        self.ceiling = ceiling;
        self
    }
}

impl Default for ThrottleConfig {
    /// 30 minute cool-down, 2 hour wait ceiling.
    fn default() -> Self {
        Self {
            cool_down: Duration::from_secs(30 * 60),
            ceiling: Duration::from_secs(2 * 60 * 60),
        }
    }
}

/// Snapshot of the gate for monitoring.
#[derive(Debug, Clone)]
pub struct ThrottleStats {
    pub state: GateState,
    /// Number of Open → Closed transitions so far.
    pub closures: u64,
    /// Number of Closed → Open transitions so far.
    pub reopenings: u64,
    /// Requests currently waiting for passage.
    pub queued: usize,
    pub reopen_in: Option<Duration>,
}

enum Command {
    WantToPass(oneshot::Sender<()>),
    RateLimited,
    Snapshot(oneshot::Sender<ThrottleStats>),
}

enum ThrottleState {
    Open,
    Closed {
        reopen_at: Instant,
        waiters: VecDeque<oneshot::Sender<()>>,
    },
}

/// The single writer of [`ThrottleState`].
struct ControlLoop {
    state: ThrottleState,
    cool_down: Duration,
    closures: u64,
    reopenings: u64,
    commands: mpsc::UnboundedReceiver<Command>,
}

impl ControlLoop {
    async fn run(mut self) {
        loop {
            let reopen_at = match &self.state {
                ThrottleState::Closed { reopen_at, .. } => Some(*reopen_at),
                ThrottleState::Open => None,
            };

            tokio::select! {
                // The timer wins over queued commands so a reopen that is due
                // is applied before anything else is looked at.
                biased;

                () = sleep_until(reopen_at.unwrap_or_else(Instant::now)),
                    if reopen_at.is_some() =>
                {
                    self.reopen();
                }
                command = self.commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
            }
        }

        // Every handle is gone; nobody can close the gate again.
        if let ThrottleState::Closed { waiters, .. } =
            std::mem::replace(&mut self.state, ThrottleState::Open)
        {
            release(waiters);
        }
        tracing::debug!("Throttle control loop stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::WantToPass(grant) => match &mut self.state {
                ThrottleState::Open => {
                    let _ = grant.send(());
                }
                ThrottleState::Closed { waiters, .. } => {
                    waiters.push_back(grant);
                    tracing::debug!(
                        queued = waiters.len(),
                        "Currently throttled, queueing request"
                    );
                }
            },
            Command::RateLimited => match &self.state {
                ThrottleState::Open => {
                    tracing::warn!(
                        cool_down_secs = self.cool_down.as_secs(),
                        "Request limit exceeded: throttling"
                    );
                    self.state = ThrottleState::Closed {
                        reopen_at: Instant::now() + self.cool_down,
                        waiters: VecDeque::new(),
                    };
                    self.closures += 1;
                }
                ThrottleState::Closed { reopen_at, .. } => {
                    tracing::debug!(
                        reopen_in_secs =
                            reopen_at.saturating_duration_since(Instant::now()).as_secs(),
                        "Already throttled, keeping the original deadline"
                    );
                }
            },
            Command::Snapshot(reply) => {
                let _ = reply.send(self.stats());
            }
        }
    }

    fn reopen(&mut self) {
        if let ThrottleState::Closed { waiters, .. } =
            std::mem::replace(&mut self.state, ThrottleState::Open)
        {
            self.reopenings += 1;
            tracing::info!(
                released = waiters.len(),
                "Throttle reopened, releasing waiting requests"
            );
            release(waiters);
        }
    }

    fn stats(&mut self) -> ThrottleStats {
        match &mut self.state {
            ThrottleState::Open => ThrottleStats {
                state: GateState::Open,
                closures: self.closures,
                reopenings: self.reopenings,
                queued: 0,
                reopen_in: None,
            },
            ThrottleState::Closed { reopen_at, waiters } => {
                // Requesters that gave up (ceiling, cancellation) dropped their receiver.
                waiters.retain(|w| !w.is_closed());
                ThrottleStats {
                    state: GateState::Closed,
                    closures: self.closures,
                    reopenings: self.reopenings,
                    queued: waiters.len(),
                    reopen_in: Some(reopen_at.saturating_duration_since(Instant::now())),
                }
            }
        }
    }
}

fn release(waiters: VecDeque<oneshot::Sender<()>>) {
    for waiter in waiters {
        let _ = waiter.send(());
    }
}

/// Handle to the shared gate. Cheap to clone; all clones talk to the same
/// control task, which stops once the last handle is dropped.
#[derive(Clone)]
pub struct Throttle {
    commands: mpsc::UnboundedSender<Command>,
    ceiling: Duration,
}

impl Throttle {
    /// Start the control task. Must be called from within a Tokio runtime.
    pub fn spawn(config: ThrottleConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let control = ControlLoop {
            state: ThrottleState::Open,
            cool_down: config.cool_down,
            closures: 0,
            reopenings: 0,
            commands: rx,
        };
        tokio::spawn(control.run());

        Self {
            commands: tx,
            ceiling: config.ceiling,
        }
    }

    /// Wait for passage.
    ///
    /// Resolves immediately while the gate is open. While it is closed the
    /// caller is suspended until the gate reopens, or fails with
    /// [`AppError::Timeout`] once the ceiling elapses.
    pub async fn acquire(&self) -> Result<(), AppError> {
        let (grant_tx, grant_rx) = oneshot::channel();
        self.commands
            .send(Command::WantToPass(grant_tx))
            .map_err(|_| AppError::ThrottleUnavailable)?;

        match tokio::time::timeout(self.ceiling, grant_rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(AppError::ThrottleUnavailable),
            Err(_) => Err(AppError::Timeout(self.ceiling.as_secs())),
        }
    }

    /// Tell the gate the API answered with its rate-limit status.
    pub fn report_rate_limited(&self) {
        if self.commands.send(Command::RateLimited).is_err() {
            tracing::warn!("Rate limit reported after the throttle stopped");
        }
    }

    pub async fn stats(&self) -> Result<ThrottleStats, AppError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::Snapshot(reply_tx))
            .map_err(|_| AppError::ThrottleUnavailable)?;
        reply_rx.await.map_err(|_| AppError::ThrottleUnavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COOL_DOWN: Duration = Duration::from_secs(30 * 60);

    fn throttle() -> Throttle {
        Throttle::spawn(ThrottleConfig::new(COOL_DOWN))
    }

    async fn wait_for_queued(throttle: &Throttle, expected: usize) {
        while throttle.stats().await.unwrap().queued < expected {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn open_gate_grants_immediately() {
        let throttle = throttle();
        let start = Instant::now();
        throttle.acquire().await.unwrap();
        assert_eq!(start.elapsed(), Duration::ZERO);

        let stats = throttle.stats().await.unwrap();
        assert_eq!(stats.state, GateState::Open);
        assert_eq!(stats.closures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_closes_and_queues_requests() {
        let throttle = throttle();
        throttle.report_rate_limited();

        let stats = throttle.stats().await.unwrap();
        assert_eq!(stats.state, GateState::Closed);
        assert_eq!(stats.reopen_in, Some(COOL_DOWN));

        let waiter = {
            let throttle = throttle.clone();
            tokio::spawn(async move { throttle.acquire().await })
        };
        wait_for_queued(&throttle, 1).await;
        assert!(!waiter.is_finished());

        tokio::time::advance(COOL_DOWN).await;
        waiter.await.unwrap().unwrap();

        let stats = throttle.stats().await.unwrap();
        assert_eq!(stats.state, GateState::Open);
        assert_eq!(stats.reopenings, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_signals_do_not_extend_deadline() {
        let throttle = throttle();
        throttle.report_rate_limited();
        throttle.stats().await.unwrap();

        tokio::time::advance(Duration::from_secs(10 * 60)).await;
        for _ in 0..4 {
            throttle.report_rate_limited();
        }
        let stats = throttle.stats().await.unwrap();
        assert_eq!(stats.closures, 1);
        assert_eq!(stats.reopen_in, Some(Duration::from_secs(20 * 60)));

        tokio::time::advance(Duration::from_secs(20 * 60 - 1)).await;
        assert_eq!(throttle.stats().await.unwrap().state, GateState::Closed);

        tokio::time::advance(Duration::from_secs(2)).await;
        let stats = throttle.stats().await.unwrap();
        assert_eq!(stats.state, GateState::Open);
        assert_eq!(stats.closures, 1);
        assert_eq!(stats.reopenings, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reopening_releases_every_waiter() {
        let throttle = throttle();
        throttle.report_rate_limited();

        let waiters: Vec<_> = (0..5)
            .map(|_| {
                let throttle = throttle.clone();
                tokio::spawn(async move { throttle.acquire().await })
            })
            .collect();
        wait_for_queued(&throttle, 5).await;

        tokio::time::advance(COOL_DOWN).await;
        for waiter in waiters {
            waiter.await.unwrap().unwrap();
        }
        assert_eq!(throttle.stats().await.unwrap().queued, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_ceiling_times_out() {
        let throttle = Throttle::spawn(
            ThrottleConfig::new(COOL_DOWN).with_ceiling(Duration::from_secs(60)),
        );
        throttle.report_rate_limited();

        let err = throttle.acquire().await.unwrap_err();
        assert!(matches!(err, AppError::Timeout(60)));

        // The abandoned waiter is not counted as queued.
        assert_eq!(throttle.stats().await.unwrap().queued, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn gate_can_close_again_after_reopening() {
        let throttle = throttle();
        throttle.report_rate_limited();
        throttle.stats().await.unwrap();
        tokio::time::advance(COOL_DOWN).await;
        assert_eq!(throttle.stats().await.unwrap().state, GateState::Open);

        throttle.report_rate_limited();
        let stats = throttle.stats().await.unwrap();
        assert_eq!(stats.state, GateState::Closed);
        assert_eq!(stats.closures, 2);
        assert_eq!(stats.reopenings, 1);
    }

    #[test]
    fn default_config_is_sensible() {
        let config = ThrottleConfig::default();
        assert_eq!(config.cool_down, Duration::from_secs(1800));
        assert_eq!(config.ceiling, Duration::from_secs(7200));
    }
}
