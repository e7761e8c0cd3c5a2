//! Periodic sweeper
//!
//! Reports idempotency keys stuck in `processing` and expires approval
//! requests left undecided past their deadline. Stuck keys are only
//! reported; resolving them is an operator decision.

use crate::{
    governance::Governance,
    idempotency::{IdempotencyGuard, StuckReport},
    types::ApprovalId,
    Result,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Result of one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Keys processing longer than the threshold
    pub stuck: Vec<StuckReport>,
    /// Requests expired by this sweep
    pub expired: Vec<ApprovalId>,
}

/// Sweeper
#[derive(Debug, Clone)]
pub struct Sweeper {
    guard: Arc<IdempotencyGuard>,
    governance: Arc<Governance>,
}

impl Sweeper {
    /// Create sweeper
    pub fn new(guard: Arc<IdempotencyGuard>, governance: Arc<Governance>) -> Self {
        Self { guard, governance }
    }

    /// Run one sweep as of `now`
    pub fn run_once(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let stuck = self.guard.sweep_stuck(now)?;
        let expired = self.governance.expire_pending(now)?;

        if !stuck.is_empty() || !expired.is_empty() {
            info!(stuck = stuck.len(), expired = expired.len(), "Sweep finished");
        }
        Ok(SweepReport { stuck, expired })
    }

    /// Sweep every `period` until the task is dropped
    pub async fn start(self: Arc<Self>, period: Duration) {
        info!(period_secs = period.as_secs(), "Starting sweeper");

        let mut interval = tokio::time::interval(period);

        loop {
            interval.tick().await;

            let sweeper = self.clone();
            match tokio::task::spawn_blocking(move || sweeper.run_once(Utc::now())).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => warn!("Sweep failed: {}", e),
                Err(e) => error!("Sweep task aborted: {}", e),
            }
        }
    }
}
