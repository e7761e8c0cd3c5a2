//! Idempotency guard for job and operation execution
//!
//! Each logical operation carries a key that deterministically encodes its
//! identity. The job row for `(job, key)` is the primary key of its column
//! family, so two admissions of one key serialize on the row lock and only
//! one of them sees "absent".
//!
//! Lifecycle of a row:
//!
//! ```text
//! (absent) --try_begin--> processing --stage_complete--> completed
//!                              |
//!                              +--fail--> failed --try_begin--> processing (attempt + 1)
//! ```
//!
//! A row left `processing` past the stuck threshold is never re-admitted
//! automatically; the sweep reports it and a human resolves it.

use crate::{
    metrics::Metrics,
    storage::{cf, keys, Storage, WriteTxn},
    types::{ActorRef, ApprovalId, JourneyId, Money, WalletId},
    Error, Result,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Stable identity of one logical operation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyKey {
    job: String,
    key: String,
}

impl IdempotencyKey {
    /// Arbitrary job and key
    pub fn new(job: impl Into<String>, key: impl Into<String>) -> Self {
        Self { job: job.into(), key: key.into() }
    }

    /// Gateway payment confirmation
    pub fn payment(gateway_id: &str) -> Self {
        Self::new("payment_confirmed", format!("payment:{}", gateway_id))
    }

    /// Share listing approval
    pub fn listing(listing_id: &str) -> Self {
        Self::new("share_listing_approved", format!("listing:{}", listing_id))
    }

    /// Admin decision on an approval request
    pub fn decision(request_id: ApprovalId) -> Self {
        Self::new("admin_decision", format!("decision:{}", request_id))
    }

    /// Purchase at the end of an investor journey
    pub fn investment(journey_id: JourneyId) -> Self {
        Self::new("invest", format!("investment:{}", journey_id))
    }

    /// Manual wallet adjustment requested by an admin.
    ///
    /// The same admin asking for the same amount on the same wallet within
    /// one minute is treated as one request.
    pub fn manual_adjustment(admin: &ActorRef, wallet_id: WalletId, amount: Money, at: DateTime<Utc>) -> Self {
        let minute = at.timestamp().div_euclid(60);
        Self::new(
            "manual_adjustment",
            format!("adjustment:{}:{}:{}:{}", admin, wallet_id, amount, minute),
        )
    }

    /// Job name
    pub fn job(&self) -> &str {
        &self.job
    }

    /// Key within the job
    pub fn as_str(&self) -> &str {
        &self.key
    }

    fn storage_key(&self) -> Result<Vec<u8>> {
        Ok(keys::join(&[&keys::text(&self.job)?, self.key.as_bytes()]))
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

/// Job row status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    /// Released for another attempt by an operator
    Pending,
    /// Admitted and running
    Processing,
    /// Effect committed
    Completed,
    /// Attempt failed; may be re-admitted
    Failed,
}

impl JobStatus {
    /// Lower-case name
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

/// Job execution row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobExecution {
    /// Key
    pub key: IdempotencyKey,
    /// Status
    pub status: JobStatus,
    /// Number of admissions
    pub attempts: u32,
    /// Start of the current attempt
    pub started_at: DateTime<Utc>,
    /// Last status change
    pub updated_at: DateTime<Utc>,
    /// JSON-encoded result of the successful attempt
    pub result_json: Option<String>,
    /// Error of the last failed attempt
    pub last_error: Option<String>,
    /// Handed to a human by the stuck sweep
    pub escalated: bool,
}

/// Outcome of asking to run an operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Caller owns this attempt and must complete or fail it
    Admitted {
        /// Attempt number, starting at 1
        attempt: u32,
    },
    /// Already done; here is the first run's result
    AlreadyCompleted {
        /// JSON-encoded result
        result_json: String,
    },
    /// Another worker holds the key
    InProgress,
}

/// Action an operator may take on a stuck job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResolutionAction {
    /// Release the key so the next delivery is admitted
    Retry,
    /// Give up: mark failed with a cancellation note
    Cancel,
    /// Leave processing, flag for a senior decision
    Escalate,
}

/// Stuck job found by the sweep
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StuckReport {
    /// Key
    pub key: IdempotencyKey,
    /// Seconds in processing
    pub age_secs: i64,
    /// Admissions so far
    pub attempts: u32,
    /// Already escalated
    pub escalated: bool,
    /// Actions offered to the operator (never taken automatically)
    pub offered: Vec<ResolutionAction>,
}

impl StuckReport {
    /// As a taxonomy error
    pub fn to_error(&self) -> Error {
        Error::StuckOperation { key: self.key.to_string(), age_secs: self.age_secs }
    }
}

/// Idempotency guard service
#[derive(Debug)]
pub struct IdempotencyGuard {
    storage: Arc<Storage>,
    metrics: Arc<Metrics>,
    stuck_after: Duration,
}

impl IdempotencyGuard {
    /// Create guard
    pub fn new(storage: Arc<Storage>, metrics: Arc<Metrics>, stuck_after: Duration) -> Self {
        Self { storage, metrics, stuck_after }
    }

    /// Admit the key once; report replays and in-flight attempts
    pub fn try_begin(&self, key: &IdempotencyKey) -> Result<Admission> {
        self.try_begin_at(key, Utc::now())
    }

    pub(crate) fn try_begin_at(&self, key: &IdempotencyKey, now: DateTime<Utc>) -> Result<Admission> {
        let result: Result<Admission> = (|| {
            let txn = self.storage.begin();
            let row_key = key.storage_key()?;
            let existing: Option<JobExecution> = txn.lock(cf::JOBS, &row_key)?;

            let admission = match existing {
                None => {
                    txn.insert(cf::JOBS, &row_key, &JobExecution {
                        key: key.clone(),
                        status: JobStatus::Processing,
                        attempts: 1,
                        started_at: now,
                        updated_at: now,
                        result_json: None,
                        last_error: None,
                        escalated: false,
                    })?;
                    Admission::Admitted { attempt: 1 }
                }
                Some(job) => match job.status {
                    JobStatus::Completed => Admission::AlreadyCompleted {
                        result_json: job.result_json.unwrap_or_else(|| "null".to_string()),
                    },
                    JobStatus::Processing => {
                        let age = now - job.started_at;
                        if age > self.stuck_after {
                            return Err(Error::StuckOperation {
                                key: key.to_string(),
                                age_secs: age.num_seconds(),
                            });
                        }
                        Admission::InProgress
                    }
                    JobStatus::Failed | JobStatus::Pending => {
                        let attempt = job.attempts + 1;
                        txn.put(cf::JOBS, &row_key, &JobExecution {
                            status: JobStatus::Processing,
                            attempts: attempt,
                            started_at: now,
                            updated_at: now,
                            escalated: false,
                            ..job
                        })?;
                        Admission::Admitted { attempt }
                    }
                },
            };
            txn.commit()?;
            Ok(admission)
        })();

        match &result {
            Ok(Admission::Admitted { attempt }) => {
                info!(key = %key, job = key.job(), attempt, "Operation admitted")
            }
            Ok(Admission::AlreadyCompleted { .. }) => info!(key = %key, "Operation replayed"),
            Ok(Admission::InProgress) => warn!(key = %key, "Operation already in progress"),
            Err(e) => warn!(key = %key, error = %e, "Admission refused"),
        }
        self.metrics.observe(result)
    }

    /// Strict admission: a completed key is a loud [`Error::DuplicateOperation`]
    pub fn begin_exclusive(&self, key: &IdempotencyKey) -> Result<u32> {
        match self.try_begin(key)? {
            Admission::Admitted { attempt } => Ok(attempt),
            Admission::AlreadyCompleted { .. } => self
                .metrics
                .observe(Err(Error::DuplicateOperation { key: key.to_string() })),
            Admission::InProgress => self
                .metrics
                .observe(Err(Error::OperationInProgress(key.to_string()))),
        }
    }

    /// Mark the key completed inside the write unit that carries the effect
    pub(crate) fn stage_complete<T: Serialize>(
        &self,
        txn: &WriteTxn<'_>,
        key: &IdempotencyKey,
        result: &T,
    ) -> Result<()> {
        let row_key = key.storage_key()?;
        let job: JobExecution = txn
            .lock(cf::JOBS, &row_key)?
            .ok_or_else(|| Error::InvariantViolation(format!("completing unknown key {}", key)))?;
        if job.status != JobStatus::Processing {
            return Err(Error::InvariantViolation(format!(
                "completing key {} in status {}",
                key,
                job.status.as_str()
            )));
        }

        txn.put(cf::JOBS, &row_key, &JobExecution {
            status: JobStatus::Completed,
            updated_at: Utc::now(),
            result_json: Some(serde_json::to_string(result)?),
            last_error: None,
            ..job
        })
    }

    /// Mark the key completed on its own
    pub fn complete<T: Serialize>(&self, key: &IdempotencyKey, result: &T) -> Result<()> {
        let txn = self.storage.begin();
        self.stage_complete(&txn, key, result)?;
        txn.commit()?;
        info!(key = %key, "Operation completed");
        Ok(())
    }

    /// Mark the current attempt failed; the key may be admitted again
    pub fn fail(&self, key: &IdempotencyKey, reason: &str) -> Result<()> {
        let txn = self.storage.begin();
        let row_key = key.storage_key()?;
        let job: JobExecution = txn
            .lock(cf::JOBS, &row_key)?
            .ok_or_else(|| Error::NotFound(format!("job {}", key)))?;
        if job.status != JobStatus::Processing {
            return Err(Error::InvalidRequest(format!(
                "cannot fail key {} in status {}",
                key,
                job.status.as_str()
            )));
        }

        txn.put(cf::JOBS, &row_key, &JobExecution {
            status: JobStatus::Failed,
            updated_at: Utc::now(),
            last_error: Some(reason.to_string()),
            ..job
        })?;
        txn.commit()?;
        warn!(key = %key, reason, "Operation failed");
        Ok(())
    }

    /// Job row for a key
    pub fn status(&self, key: &IdempotencyKey) -> Result<Option<JobExecution>> {
        self.storage.get(cf::JOBS, &key.storage_key()?)
    }

    /// Report every job processing longer than the threshold.
    ///
    /// Nothing is changed; each report lists the actions an operator may take.
    pub fn sweep_stuck(&self, now: DateTime<Utc>) -> Result<Vec<StuckReport>> {
        let jobs: Vec<(Vec<u8>, JobExecution)> = self.storage.scan_all(cf::JOBS)?;

        let reports: Vec<StuckReport> = jobs
            .into_iter()
            .map(|(_, job)| job)
            .filter(|job| job.status == JobStatus::Processing && now - job.started_at > self.stuck_after)
            .map(|job| {
                let offered = if job.escalated {
                    vec![ResolutionAction::Retry, ResolutionAction::Cancel]
                } else {
                    vec![ResolutionAction::Retry, ResolutionAction::Cancel, ResolutionAction::Escalate]
                };
                StuckReport {
                    age_secs: (now - job.started_at).num_seconds(),
                    attempts: job.attempts,
                    escalated: job.escalated,
                    key: job.key,
                    offered,
                }
            })
            .collect();

        self.metrics.stuck_operations.set(reports.len() as i64);
        for report in &reports {
            error!(
                key = %report.key,
                job = report.key.job(),
                age_secs = report.age_secs,
                attempts = report.attempts,
                "Stuck operation needs a resolution"
            );
        }
        Ok(reports)
    }

    /// Apply an operator's resolution to a stuck job
    pub fn resolve(&self, key: &IdempotencyKey, action: ResolutionAction, actor: &ActorRef) -> Result<JobExecution> {
        self.resolve_at(key, action, actor, Utc::now())
    }

    pub(crate) fn resolve_at(
        &self,
        key: &IdempotencyKey,
        action: ResolutionAction,
        actor: &ActorRef,
        now: DateTime<Utc>,
    ) -> Result<JobExecution> {
        let txn = self.storage.begin();
        let row_key = key.storage_key()?;
        let job: JobExecution = txn
            .lock(cf::JOBS, &row_key)?
            .ok_or_else(|| Error::NotFound(format!("job {}", key)))?;

        let age = now - job.started_at;
        if job.status != JobStatus::Processing || age <= self.stuck_after {
            return self.metrics.observe(Err(Error::InvalidRequest(format!(
                "key {} is {} for {}s, not stuck",
                key,
                job.status.as_str(),
                age.num_seconds()
            ))));
        }

        let resolved = match action {
            ResolutionAction::Retry => JobExecution {
                status: JobStatus::Pending,
                updated_at: now,
                last_error: Some(format!("released for retry by {}", actor)),
                ..job
            },
            ResolutionAction::Cancel => JobExecution {
                status: JobStatus::Failed,
                updated_at: now,
                last_error: Some(format!("cancelled by {}", actor)),
                ..job
            },
            ResolutionAction::Escalate => JobExecution {
                escalated: true,
                updated_at: now,
                last_error: Some(format!("escalated by {}", actor)),
                ..job
            },
        };
        txn.put(cf::JOBS, &row_key, &resolved)?;
        txn.commit()?;

        info!(key = %key, action = ?action, actor = %actor, "Stuck operation resolved");
        Ok(resolved)
    }
}
