//! Governance and audit layer
//!
//! Two concerns live here:
//!
//! - Platform context snapshots ([`snapshot`]): frozen governance facts per
//!   company, with one current-snapshot pointer that superseding moves.
//! - Maker-checker dual control ([`approval`]): high-risk changes wait for
//!   a second principal. An approved change is applied in the same write
//!   unit as its governance-log row, so the log never records a change that
//!   did not happen and no change happens without a log row.

pub mod approval;
pub mod snapshot;

pub use approval::{
    AppliedEffect, ApprovalRequest, ApprovalStatus, Decision, GovernanceLogRow, ProposedChange,
    GENESIS_HASH,
};
pub use snapshot::{ContextProvider, ContextSnapshot, Lifecycle, PlatformFacts, StaticContextProvider};

use crate::{
    events::{EngineEvent, Outbox},
    journal::{Journal, RecordRequest, TransactionType},
    journey::Journey,
    ledger::{Ledger, LineRequest, PostEntry},
    storage::{cf, keys, Storage, WriteTxn},
    types::{ActorKind, ActorRef, ApprovalId, CompanyId, Direction, JourneyId, SnapshotId},
    Error, Result,
};
use approval::LogHead;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use snapshot::SnapshotHead;
use std::sync::Arc;
use tracing::{error, info, warn};

const GOVERNANCE_HEAD: &[u8] = b"governance_head";

/// Result of one decision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionRecord {
    /// Request after the decision
    pub request: ApprovalRequest,
    /// Governance-log row written for it
    pub log: GovernanceLogRow,
    /// Records the change produced (empty unless approved)
    pub effects: Vec<AppliedEffect>,
}

/// Governance service
#[derive(Debug)]
pub struct Governance {
    storage: Arc<Storage>,
    outbox: Outbox,
    provider: Arc<dyn ContextProvider>,
    ledger: Arc<Ledger>,
    journal: Arc<Journal>,
    approval_ttl: Duration,
}

impl Governance {
    /// Create service
    pub fn new(
        storage: Arc<Storage>,
        outbox: Outbox,
        provider: Arc<dyn ContextProvider>,
        ledger: Arc<Ledger>,
        journal: Arc<Journal>,
        approval_ttl: Duration,
    ) -> Self {
        Self { storage, outbox, provider, ledger, journal, approval_ttl }
    }

    /// Live facts source
    pub fn provider(&self) -> &Arc<dyn ContextProvider> {
        &self.provider
    }

    /// Capture the company's live facts as its new current snapshot
    pub fn snapshot_context(&self, company_id: CompanyId, actor: &ActorRef) -> Result<ContextSnapshot> {
        let result: Result<ContextSnapshot> = (|| {
            let facts = self.provider.facts(company_id)?;
            let txn = self.storage.begin();
            let snapshot = self.stage_snapshot(&txn, company_id, facts, actor)?;
            self.outbox.commit(txn, Vec::new())?;
            Ok(snapshot)
        })();

        let snapshot = self.outbox.metrics().observe(result)?;
        info!(
            snapshot_id = %snapshot.id,
            company_id = %company_id,
            version = snapshot.version,
            digest = %snapshot.digest,
            "Context snapshot taken"
        );
        Ok(snapshot)
    }

    pub(crate) fn stage_snapshot(
        &self,
        txn: &WriteTxn<'_>,
        company_id: CompanyId,
        facts: PlatformFacts,
        actor: &ActorRef,
    ) -> Result<ContextSnapshot> {
        let head: Option<SnapshotHead> = txn.lock(cf::SNAPSHOT_HEADS, company_id.as_bytes())?;
        let snapshot = ContextSnapshot {
            id: SnapshotId::new(),
            company_id,
            digest: snapshot::digest(company_id, &facts)?,
            facts,
            supersedes: head.map(|h| h.current),
            version: head.map_or(1, |h| h.version + 1),
            taken_by: actor.clone(),
            taken_at: Utc::now(),
        };
        txn.insert(cf::SNAPSHOTS, snapshot.id.as_bytes(), &snapshot)?;
        txn.put(
            cf::SNAPSHOT_HEADS,
            company_id.as_bytes(),
            &SnapshotHead { current: snapshot.id, version: snapshot.version },
        )?;
        Ok(snapshot)
    }

    /// Get snapshot
    pub fn snapshot(&self, snapshot_id: SnapshotId) -> Result<ContextSnapshot> {
        self.storage
            .require(cf::SNAPSHOTS, snapshot_id.as_bytes(), &format!("snapshot {}", snapshot_id))
    }

    /// Current snapshot of a company, if one was ever taken
    pub fn current_snapshot(&self, company_id: CompanyId) -> Result<Option<ContextSnapshot>> {
        let head: Option<SnapshotHead> = self.storage.get(cf::SNAPSHOT_HEADS, company_id.as_bytes())?;
        head.map(|h| self.snapshot(h.current)).transpose()
    }

    /// Whether the snapshot is still its company's current one
    pub fn is_current(&self, snapshot_id: SnapshotId) -> Result<bool> {
        let snapshot = self.snapshot(snapshot_id)?;
        Ok(self
            .current_snapshot(snapshot.company_id)?
            .is_some_and(|current| current.id == snapshot_id))
    }

    /// Read a snapshot that must still be current.
    ///
    /// The company's head row is held shared until the unit ends, so a
    /// concurrent supersede waits instead of slipping in underneath.
    pub(crate) fn stage_require_current(
        &self,
        txn: &WriteTxn<'_>,
        snapshot_id: SnapshotId,
    ) -> Result<ContextSnapshot> {
        let snapshot: ContextSnapshot = txn
            .get(cf::SNAPSHOTS, snapshot_id.as_bytes())?
            .ok_or_else(|| Error::NotFound(format!("snapshot {}", snapshot_id)))?;
        let head: Option<SnapshotHead> =
            txn.lock_shared(cf::SNAPSHOT_HEADS, snapshot.company_id.as_bytes())?;
        match head {
            Some(head) if head.current == snapshot_id => Ok(snapshot),
            Some(head) => Err(Error::InvalidRequest(format!(
                "snapshot {} superseded by {}",
                snapshot_id, head.current
            ))),
            None => Err(Error::InvariantViolation(format!(
                "snapshot {} has no head for company {}",
                snapshot_id, snapshot.company_id
            ))),
        }
    }

    /// Bind a current snapshot of the journey's company to the journey
    pub fn bind_to_journey(&self, journey_id: JourneyId, snapshot_id: SnapshotId) -> Result<Journey> {
        let result: Result<Journey> = (|| {
            let txn = self.storage.begin();
            let journey = self.stage_bind_to_journey(&txn, journey_id, snapshot_id)?;
            self.outbox.commit(txn, Vec::new())?;
            Ok(journey)
        })();

        let journey = self.outbox.metrics().observe(result)?;
        info!(journey_id = %journey_id, snapshot_id = %snapshot_id, "Snapshot bound to journey");
        Ok(journey)
    }

    pub(crate) fn stage_bind_to_journey(
        &self,
        txn: &WriteTxn<'_>,
        journey_id: JourneyId,
        snapshot_id: SnapshotId,
    ) -> Result<Journey> {
        let mut journey: Journey = txn
            .lock(cf::JOURNEYS, journey_id.as_bytes())?
            .ok_or_else(|| Error::NotFound(format!("journey {}", journey_id)))?;
        let snapshot = self.stage_require_current(txn, snapshot_id)?;
        if snapshot.company_id != journey.company_id {
            return Err(Error::InvalidRequest(format!(
                "snapshot {} belongs to company {}, journey {} to {}",
                snapshot_id, snapshot.company_id, journey_id, journey.company_id
            )));
        }

        journey.snapshot_id = Some(snapshot_id);
        txn.put(cf::JOURNEYS, journey_id.as_bytes(), &journey)?;
        Ok(journey)
    }

    /// Open a maker-checker request
    pub fn request_approval(
        &self,
        change: ProposedChange,
        maker: ActorRef,
        reason: &str,
    ) -> Result<ApprovalRequest> {
        let result: Result<ApprovalRequest> = (|| {
            require_admin(&maker)?;
            if reason.trim().is_empty() {
                return Err(Error::InvalidRequest("approval request requires a reason".to_string()));
            }
            if let ProposedChange::WalletAdjustment { amount, .. } = &change {
                if !amount.is_positive() {
                    return Err(Error::InvalidRequest(format!(
                        "adjustment amount must be positive, got {}",
                        amount
                    )));
                }
            }

            let now = Utc::now();
            let request = ApprovalRequest {
                id: ApprovalId::new(),
                action_type: change.action_type().to_string(),
                change,
                maker,
                reason: reason.to_string(),
                status: ApprovalStatus::Pending,
                created_at: now,
                expires_at: now + self.approval_ttl,
                decided_by: None,
                decided_at: None,
                decision_reason: None,
            };
            let txn = self.storage.begin();
            txn.insert(cf::APPROVALS, request.id.as_bytes(), &request)?;
            txn.commit()?;
            Ok(request)
        })();

        let request = self.outbox.metrics().observe(result)?;
        info!(
            request_id = %request.id,
            action_type = %request.action_type,
            maker = %request.maker,
            expires_at = %request.expires_at,
            "Approval requested"
        );
        Ok(request)
    }

    /// Decide a pending request.
    ///
    /// An approval applies the change and writes the governance-log row in
    /// one unit. A request found past its expiry is expired (and logged) and
    /// the decision fails with [`Error::ApprovalExpired`].
    pub fn decide(
        &self,
        request_id: ApprovalId,
        checker: ActorRef,
        decision: Decision,
        reason: &str,
    ) -> Result<DecisionRecord> {
        let mut events = Vec::new();
        let result: Result<DecisionRecord> = (|| {
            let txn = self.storage.begin();
            let record = self.stage_decide(&txn, request_id, &checker, decision, reason, Utc::now(), &mut events)?;
            self.outbox.commit(txn, std::mem::take(&mut events))?;
            Ok(record)
        })();

        if let Err(Error::ApprovalExpired(_)) = &result {
            self.expire_one(request_id, Utc::now())?;
        }
        let record = self.outbox.metrics().observe(result).inspect_err(|e| {
            warn!(request_id = %request_id, checker = %checker, error = %e, "Decision refused");
        })?;
        self.publish_facts(&record)?;
        Ok(record)
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn stage_decide(
        &self,
        txn: &WriteTxn<'_>,
        request_id: ApprovalId,
        checker: &ActorRef,
        decision: Decision,
        reason: &str,
        now: DateTime<Utc>,
        events: &mut Vec<EngineEvent>,
    ) -> Result<DecisionRecord> {
        let mut request: ApprovalRequest = txn
            .lock(cf::APPROVALS, request_id.as_bytes())?
            .ok_or_else(|| Error::NotFound(format!("approval request {}", request_id)))?;

        if request.status != ApprovalStatus::Pending {
            return Err(Error::RequestNotPending {
                request_id: request_id.to_string(),
                status: request.status.as_str().to_string(),
            });
        }
        if *checker == request.maker {
            return Err(Error::SelfApproval {
                request_id: request_id.to_string(),
                actor: checker.to_string(),
            });
        }
        if now > request.expires_at {
            return Err(Error::ApprovalExpired(request_id.to_string()));
        }
        require_admin(checker)?;
        if reason.trim().is_empty() {
            return Err(Error::InvalidRequest("decision requires a reason".to_string()));
        }

        let (status, effects) = match decision {
            Decision::Approve => (ApprovalStatus::Approved, self.stage_apply(txn, &request, checker, events)?),
            Decision::Reject => (ApprovalStatus::Rejected, Vec::new()),
        };

        request.status = status;
        request.decided_by = Some(checker.clone());
        request.decided_at = Some(now);
        request.decision_reason = Some(reason.to_string());
        txn.put(cf::APPROVALS, request_id.as_bytes(), &request)?;

        let log = self.stage_log(txn, &request, checker, reason, effects.clone(), now, events)?;
        info!(
            request_id = %request_id,
            action_type = %request.action_type,
            outcome = status.as_str(),
            checker = %checker,
            sequence = log.sequence,
            "Governance decision staged"
        );
        Ok(DecisionRecord { request, log, effects })
    }

    fn stage_apply(
        &self,
        txn: &WriteTxn<'_>,
        request: &ApprovalRequest,
        checker: &ActorRef,
        events: &mut Vec<EngineEvent>,
    ) -> Result<Vec<AppliedEffect>> {
        let reason = format!("approval {}: {}", request.id, request.reason);
        match &request.change {
            ProposedChange::WalletAdjustment { wallet_id, direction, amount } => {
                let transaction_type = match direction {
                    Direction::Credit => TransactionType::AdjustmentCredit,
                    Direction::Debit => TransactionType::AdjustmentDebit,
                };
                let transaction = self.journal.stage_override(
                    txn,
                    &RecordRequest {
                        wallet_id: *wallet_id,
                        transaction_type,
                        amount: *amount,
                        reference: Some(format!("approval:{}", request.id)),
                        actor: checker.clone(),
                    },
                    &request.reason,
                    Some(request.id),
                    events,
                )?;

                let chart = self.ledger.chart()?;
                let lines = match direction {
                    Direction::Credit => vec![
                        LineRequest::debit(chart.adjustment_expense, *amount),
                        LineRequest::credit(chart.investor_wallets, *amount),
                    ],
                    Direction::Debit => vec![
                        LineRequest::debit(chart.investor_wallets, *amount),
                        LineRequest::credit(chart.adjustment_income, *amount),
                    ],
                };
                let entry = self.ledger.stage_entry(
                    txn,
                    PostEntry {
                        lines,
                        reference_type: "approval".to_string(),
                        reference_id: request.id.to_string(),
                        description: format!("Wallet adjustment on {}", wallet_id),
                        entry_date: Utc::now(),
                        created_by: checker.clone(),
                    },
                    events,
                )?;
                Ok(vec![AppliedEffect::Transaction(transaction.id), AppliedEffect::Entry(entry.id)])
            }
            ProposedChange::ReverseTransaction { transaction_id } => {
                let reversal =
                    self.journal.stage_reverse(txn, *transaction_id, &reason, checker.clone(), events)?;
                Ok(vec![AppliedEffect::Transaction(reversal.id)])
            }
            ProposedChange::ReverseEntry { entry_id } => {
                let reversal = self.ledger.stage_reversal(txn, *entry_id, &reason, checker.clone(), events)?;
                Ok(vec![AppliedEffect::Entry(reversal.id)])
            }
            ProposedChange::SetBuyingEnabled { company_id, enabled } => {
                let mut facts = self.provider.facts(*company_id)?;
                facts.buying_enabled = *enabled;
                let snapshot = self.stage_snapshot(txn, *company_id, facts, checker)?;
                Ok(vec![AppliedEffect::Snapshot(snapshot.id)])
            }
            ProposedChange::SetLifecycle { company_id, lifecycle } => {
                let mut facts = self.provider.facts(*company_id)?;
                facts.lifecycle = *lifecycle;
                let snapshot = self.stage_snapshot(txn, *company_id, facts, checker)?;
                Ok(vec![AppliedEffect::Snapshot(snapshot.id)])
            }
        }
    }

    /// Push facts changed by a committed decision to the provider
    pub(crate) fn publish_facts(&self, record: &DecisionRecord) -> Result<()> {
        for effect in &record.effects {
            if let AppliedEffect::Snapshot(snapshot_id) = effect {
                let snapshot = self.snapshot(*snapshot_id)?;
                self.provider.update(snapshot.company_id, &snapshot.facts)?;
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn stage_log(
        &self,
        txn: &WriteTxn<'_>,
        request: &ApprovalRequest,
        checker: &ActorRef,
        reason: &str,
        effects: Vec<AppliedEffect>,
        now: DateTime<Utc>,
        events: &mut Vec<EngineEvent>,
    ) -> Result<GovernanceLogRow> {
        let head: LogHead = txn.lock(cf::META, GOVERNANCE_HEAD)?.unwrap_or_default();

        let mut row = GovernanceLogRow {
            sequence: head.sequence + 1,
            request_id: request.id,
            action_type: request.action_type.clone(),
            outcome: request.status,
            maker: request.maker.clone(),
            checker: checker.clone(),
            reason: reason.to_string(),
            change: request.change.clone(),
            effects,
            recorded_at: now,
            prev_hash: head.hash,
            hash: String::new(),
        };
        row.hash = row.compute_hash()?;

        txn.insert(cf::GOVERNANCE_LOG, &keys::seq(row.sequence), &row)?;
        txn.put(cf::META, GOVERNANCE_HEAD, &LogHead { sequence: row.sequence, hash: row.hash.clone() })?;

        events.push(EngineEvent::GovernanceDecisionLogged {
            sequence: row.sequence,
            request_id: row.request_id,
            decision: row.outcome.as_str().to_string(),
            checker: checker.clone(),
        });
        Ok(row)
    }

    /// Expire every pending request past its expiry; returns the expired ids
    pub fn expire_pending(&self, now: DateTime<Utc>) -> Result<Vec<ApprovalId>> {
        let requests: Vec<(Vec<u8>, ApprovalRequest)> = self.storage.scan_all(cf::APPROVALS)?;

        let mut expired = Vec::new();
        for (_, request) in requests {
            if request.status == ApprovalStatus::Pending && now > request.expires_at
                && self.expire_one(request.id, now)?
            {
                expired.push(request.id);
            }
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "Expired pending approval requests");
        }
        Ok(expired)
    }

    /// Expire one request if it is still pending and past expiry
    pub(crate) fn expire_one(&self, request_id: ApprovalId, now: DateTime<Utc>) -> Result<bool> {
        let mut events = Vec::new();
        let txn = self.storage.begin();
        let mut request: ApprovalRequest = txn
            .lock(cf::APPROVALS, request_id.as_bytes())?
            .ok_or_else(|| Error::NotFound(format!("approval request {}", request_id)))?;
        if request.status != ApprovalStatus::Pending || now <= request.expires_at {
            return Ok(false);
        }

        let system = ActorRef::system();
        request.status = ApprovalStatus::Expired;
        request.decided_by = Some(system.clone());
        request.decided_at = Some(now);
        request.decision_reason = Some("expired undecided".to_string());
        txn.put(cf::APPROVALS, request_id.as_bytes(), &request)?;
        self.stage_log(&txn, &request, &system, "expired undecided", Vec::new(), now, &mut events)?;
        self.outbox.commit(txn, events)?;

        warn!(request_id = %request_id, action_type = %request.action_type, "Approval request expired");
        Ok(true)
    }

    /// Get request
    pub fn request(&self, request_id: ApprovalId) -> Result<ApprovalRequest> {
        self.storage.require(
            cf::APPROVALS,
            request_id.as_bytes(),
            &format!("approval request {}", request_id),
        )
    }

    /// Governance log, oldest first
    pub fn log(&self) -> Result<Vec<GovernanceLogRow>> {
        Ok(self
            .storage
            .scan_all::<GovernanceLogRow>(cf::GOVERNANCE_LOG)?
            .into_iter()
            .map(|(_, row)| row)
            .collect())
    }

    /// Walk the log and check every link; returns the number of rows
    pub fn verify_log_chain(&self) -> Result<u64> {
        let rows = self.log()?;
        let mut prev_hash = GENESIS_HASH.to_string();
        for (index, row) in rows.iter().enumerate() {
            let expected = index as u64 + 1;
            let broken = if row.sequence != expected {
                Some(format!("expected sequence {}, found {}", expected, row.sequence))
            } else if row.prev_hash != prev_hash {
                Some("previous-hash link does not match".to_string())
            } else if !row.verify_hash()? {
                Some("row hash does not match its contents".to_string())
            } else {
                None
            };
            if let Some(reason) = broken {
                error!(sequence = row.sequence, %reason, "Governance log chain broken");
                return Err(Error::InvariantViolation(format!(
                    "governance log row {}: {}",
                    row.sequence, reason
                )));
            }
            prev_hash = row.hash.clone();
        }

        let head: LogHead = self.storage.get(cf::META, GOVERNANCE_HEAD)?.unwrap_or_default();
        if head.sequence != rows.len() as u64 || head.hash != prev_hash {
            return Err(Error::InvariantViolation(format!(
                "governance head at {} does not match log tail at {}",
                head.sequence,
                rows.len()
            )));
        }
        Ok(rows.len() as u64)
    }
}

fn require_admin(actor: &ActorRef) -> Result<()> {
    if actor.kind != ActorKind::PlatformAdmin {
        return Err(Error::InvalidRequest(format!(
            "{} is not a platform admin",
            actor
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        journal::Transaction,
        test_support::open_store,
        types::{Money, WalletId},
    };

    struct Fixture {
        governance: Governance,
        journal: Arc<Journal>,
        ledger: Arc<Ledger>,
        provider: Arc<StaticContextProvider>,
        storage: Arc<Storage>,
        _temp: tempfile::TempDir,
    }

    fn fixture(ttl: Duration) -> Fixture {
        let (storage, outbox, temp) = open_store();
        let ledger = Arc::new(Ledger::new(storage.clone(), outbox.clone()));
        ledger.bootstrap_chart().unwrap();
        let journal = Arc::new(Journal::new(storage.clone(), outbox.clone(), Money::ZERO));
        let provider = Arc::new(StaticContextProvider::new());
        let governance = Governance::new(
            storage.clone(),
            outbox,
            provider.clone(),
            ledger.clone(),
            journal.clone(),
            ttl,
        );
        Fixture { governance, journal, ledger, provider, storage, _temp: temp }
    }

    fn listed() -> PlatformFacts {
        PlatformFacts {
            lifecycle: Lifecycle::Listed,
            buying_enabled: true,
            risk_score: 30,
            compliance_score: 95,
        }
    }

    fn deposit(journal: &Journal, wallet_id: WalletId, amount: i64) -> Transaction {
        journal
            .record(RecordRequest {
                wallet_id,
                transaction_type: TransactionType::Deposit,
                amount: Money::from_minor(amount),
                reference: None,
                actor: ActorRef::system(),
            })
            .unwrap()
    }

    #[test]
    fn test_snapshots_supersede() {
        let f = fixture(Duration::hours(1));
        let company = CompanyId::new();
        f.provider.set(company, listed());

        let first = f.governance.snapshot_context(company, &ActorRef::system()).unwrap();
        assert_eq!(first.version, 1);
        assert!(first.verify().unwrap());
        assert!(f.governance.is_current(first.id).unwrap());

        let second = f.governance.snapshot_context(company, &ActorRef::system()).unwrap();
        assert_eq!(second.supersedes, Some(first.id));
        assert!(!f.governance.is_current(first.id).unwrap());
        // Superseded row is untouched
        assert_eq!(f.governance.snapshot(first.id).unwrap(), first);
    }

    #[test]
    fn test_self_approval_refused_then_checker_applies() {
        let f = fixture(Duration::hours(1));
        let wallet = WalletId::new();
        let maker = ActorRef::admin("maker");

        let request = f
            .governance
            .request_approval(
                ProposedChange::WalletAdjustment {
                    wallet_id: wallet,
                    direction: Direction::Credit,
                    amount: Money::from_minor(2_500),
                },
                maker.clone(),
                "goodwill credit",
            )
            .unwrap();

        assert!(matches!(
            f.governance.decide(request.id, maker, Decision::Approve, "self"),
            Err(Error::SelfApproval { .. })
        ));
        assert!(f.journal.history(wallet).unwrap().is_empty());
        assert!(f.governance.log().unwrap().is_empty());

        let record = f
            .governance
            .decide(request.id, ActorRef::admin("checker"), Decision::Approve, "verified ticket")
            .unwrap();
        assert_eq!(record.request.status, ApprovalStatus::Approved);
        assert_eq!(f.journal.balance(wallet).unwrap(), Money::from_minor(2_500));
        assert_eq!(f.journal.history(wallet).unwrap().len(), 1);
        assert_eq!(f.governance.log().unwrap().len(), 1);

        let transaction_id = match record.effects[0] {
            AppliedEffect::Transaction(id) => id,
            ref other => panic!("unexpected effect {:?}", other),
        };
        let audit = f.journal.override_audit(transaction_id).unwrap().unwrap();
        assert_eq!(audit.approval_id, Some(request.id));

        let trial = f.ledger.trial_balance(Utc::now()).unwrap();
        assert!(trial.is_balanced());

        // Decided requests cannot be acted on again
        assert!(matches!(
            f.governance.decide(request.id, ActorRef::admin("other"), Decision::Reject, "late"),
            Err(Error::RequestNotPending { .. })
        ));
    }

    #[test]
    fn test_rejection_is_logged_without_effects() {
        let f = fixture(Duration::hours(1));
        let wallet = WalletId::new();
        let original = deposit(&f.journal, wallet, 800);

        let request = f
            .governance
            .request_approval(
                ProposedChange::ReverseTransaction { transaction_id: original.id },
                ActorRef::admin("maker"),
                "suspected duplicate",
            )
            .unwrap();
        let record = f
            .governance
            .decide(request.id, ActorRef::admin("checker"), Decision::Reject, "not a duplicate")
            .unwrap();

        assert_eq!(record.log.outcome, ApprovalStatus::Rejected);
        assert!(record.effects.is_empty());
        assert_eq!(f.journal.balance(wallet).unwrap(), Money::from_minor(800));
    }

    #[test]
    fn test_expired_request_cannot_be_decided() {
        let f = fixture(Duration::seconds(-1));
        let request = f
            .governance
            .request_approval(
                ProposedChange::ReverseEntry { entry_id: crate::types::EntryId::new() },
                ActorRef::admin("maker"),
                "wrong account",
            )
            .unwrap();

        assert!(matches!(
            f.governance.decide(request.id, ActorRef::admin("checker"), Decision::Approve, "ok"),
            Err(Error::ApprovalExpired(_))
        ));
        assert_eq!(f.governance.request(request.id).unwrap().status, ApprovalStatus::Expired);
        assert!(matches!(
            f.governance.decide(request.id, ActorRef::admin("checker"), Decision::Approve, "ok"),
            Err(Error::RequestNotPending { .. })
        ));
        assert!(f.governance.expire_pending(Utc::now()).unwrap().is_empty());
        assert_eq!(f.governance.log().unwrap()[0].outcome, ApprovalStatus::Expired);
    }

    #[test]
    fn test_expire_pending_sweep() {
        let f = fixture(Duration::minutes(5));
        let request = f
            .governance
            .request_approval(
                ProposedChange::SetBuyingEnabled { company_id: CompanyId::new(), enabled: false },
                ActorRef::admin("maker"),
                "halt",
            )
            .unwrap();

        assert!(f.governance.expire_pending(Utc::now()).unwrap().is_empty());
        let later = Utc::now() + Duration::minutes(6);
        assert_eq!(f.governance.expire_pending(later).unwrap(), vec![request.id]);
        assert_eq!(f.governance.verify_log_chain().unwrap(), 1);
    }

    #[test]
    fn test_governance_change_supersedes_snapshot() {
        let f = fixture(Duration::hours(1));
        let company = CompanyId::new();
        f.provider.set(company, listed());
        let before = f.governance.snapshot_context(company, &ActorRef::system()).unwrap();

        let request = f
            .governance
            .request_approval(
                ProposedChange::SetBuyingEnabled { company_id: company, enabled: false },
                ActorRef::admin("maker"),
                "disclosure overdue",
            )
            .unwrap();
        f.governance
            .decide(request.id, ActorRef::admin("checker"), Decision::Approve, "confirmed")
            .unwrap();

        let current = f.governance.current_snapshot(company).unwrap().unwrap();
        assert_eq!(current.supersedes, Some(before.id));
        assert!(!current.facts.buying_enabled);
        assert!(before.facts.buying_enabled);
        assert!(!f.provider.facts(company).unwrap().buying_enabled);
    }

    #[test]
    fn test_log_chain_detects_tampering() {
        let f = fixture(Duration::hours(1));
        for _ in 0..3 {
            let request = f
                .governance
                .request_approval(
                    ProposedChange::SetLifecycle { company_id: CompanyId::new(), lifecycle: Lifecycle::Suspended },
                    ActorRef::admin("maker"),
                    "review",
                )
                .unwrap();
            f.governance
                .decide(request.id, ActorRef::admin("checker"), Decision::Reject, "no")
                .unwrap();
        }
        assert_eq!(f.governance.verify_log_chain().unwrap(), 3);

        let mut rows = f.governance.log().unwrap();
        assert_eq!(rows[1].prev_hash, rows[0].hash);
        rows[1].reason = "yes".to_string();
        assert!(!rows[1].verify_hash().unwrap());
        // The wrapper refuses to rewrite a logged row
        assert!(f.storage.begin().put(cf::GOVERNANCE_LOG, &keys::seq(2), &rows[1]).is_err());
    }

    #[test]
    fn test_non_admin_cannot_request() {
        let f = fixture(Duration::hours(1));
        let result = f.governance.request_approval(
            ProposedChange::ReverseEntry { entry_id: crate::types::EntryId::new() },
            ActorRef::company_user("cfo"),
            "mistake",
        );
        assert!(matches!(result, Err(Error::InvalidRequest(_))));
    }
}
