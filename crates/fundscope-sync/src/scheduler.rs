use std::sync::Arc;
use std::time::Duration;

use fundscope_core::{CYCLE_PERIOD, MAX_CYCLE_ATTEMPTS, RETRY_DELAY};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::{CycleError, IngestionCycle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Running,
    /// Waiting out the retry delay before `next_attempt`.
    Retrying { next_attempt: usize },
    /// Waiting for the next period tick.
    Waiting,
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulePolicy {
    pub period: Duration,
    pub max_attempts: usize,
    pub retry_delay: Duration,
}

impl Default for SchedulePolicy {
    fn default() -> Self {
        Self {
            period: CYCLE_PERIOD,
            max_attempts: MAX_CYCLE_ATTEMPTS,
            retry_delay: RETRY_DELAY,
        }
    }
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("initial ingestion cycle failed: {0}")]
    StartupCycleFailed(#[source] CycleError),
}

/// Runs an ingestion cycle at startup and then once per period, retrying
/// failed scheduled cycles before giving up until the next period.
pub struct Scheduler {
    cycle: Arc<dyn IngestionCycle>,
    policy: SchedulePolicy,
    state: watch::Sender<SchedulerState>,
}

impl Scheduler {
    pub fn new(cycle: Arc<dyn IngestionCycle>, policy: SchedulePolicy) -> Self {
        let (state, _) = watch::channel(SchedulerState::Idle);
        Self {
            cycle,
            policy,
            state,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SchedulerState> {
        self.state.subscribe()
    }

    /// Returns only if the startup cycle fails; scheduled cycles never end the loop.
    pub async fn run(self) -> Result<(), SchedulerError> {
        let mut ticker = tokio::time::interval(self.policy.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;

        self.state.send_replace(SchedulerState::Running);
        match self.cycle.run_cycle().await {
            Ok(report) => info!(
                stored = report.stored,
                skipped = report.skipped,
                failed = report.failed,
                "initial ingestion cycle completed"
            ),
            Err(err) => {
                error!(error = %err, "initial ingestion cycle failed");
                self.state.send_replace(SchedulerState::Idle);
                return Err(SchedulerError::StartupCycleFailed(err));
            }
        }

        loop {
            self.state.send_replace(SchedulerState::Waiting);
            ticker.tick().await;
            self.run_with_retries().await;
        }
    }

    async fn run_with_retries(&self) {
        let max_attempts = self.policy.max_attempts.max(1);
        for attempt in 1..=max_attempts {
            self.state.send_replace(SchedulerState::Running);
            match self.cycle.run_cycle().await {
                Ok(report) => {
                    info!(
                        attempt,
                        stored = report.stored,
                        skipped = report.skipped,
                        failed = report.failed,
                        "scheduled ingestion cycle completed"
                    );
                    return;
                }
                Err(err) => {
                    warn!(attempt, max_attempts, error = %err, "scheduled ingestion cycle failed");
                    if attempt < max_attempts {
                        info!(delay = ?self.policy.retry_delay, "retrying ingestion cycle");
                        self.state.send_replace(SchedulerState::Retrying {
                            next_attempt: attempt + 1,
                        });
                        tokio::time::sleep(self.policy.retry_delay).await;
                    }
                }
            }
        }
        error!(
            attempts = max_attempts,
            "giving up on ingestion cycle until the next scheduled period"
        );
    }
}
