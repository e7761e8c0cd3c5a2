//! Engine facade
//!
//! Wires storage, the services, the transition registry, the event bus and
//! metrics, and exposes the inbound handlers. Every handler runs under the
//! idempotency guard: the effect and the key's completion commit in one
//! write unit, so a redelivered event either replays the stored result or
//! runs again from scratch. It never half-applies.
//!
//! # Example
//!
//! ```no_run
//! use integrity_core::{Config, IntegrityEngine, PaymentConfirmed, WalletId};
//!
//! fn main() -> integrity_core::Result<()> {
//!     let engine = IntegrityEngine::open(Config::default())?;
//!     let outcome = engine.on_payment_confirmed(PaymentConfirmed {
//!         gateway_id: "pi_3N1".to_string(),
//!         wallet_id: WalletId::new(),
//!         amount_minor: 50_000,
//!     })?;
//!     assert!(!outcome.is_replay());
//!     Ok(())
//! }
//! ```

use crate::{
    events::{AdminDecision, EngineEvent, EventBus, Outbox, PaymentConfirmed, ShareListingApproved},
    governance::{
        ApprovalRequest, ContextProvider, DecisionRecord, Governance, ProposedChange,
        StaticContextProvider,
    },
    idempotency::{Admission, IdempotencyGuard, IdempotencyKey},
    inventory::{expected_total, Inventory, NewLot, Provenance},
    journal::{Floor, Journal, RecordRequest, TransactionType},
    journey::Journeys,
    ledger::{ChartOfAccounts, Ledger, LineRequest, PostEntry},
    metrics::Metrics,
    reconciliation::Reconciler,
    state_machine::{
        InvestmentStatus, JourneyState, StateMachine, TransitionRegistry, TransitionRequest,
        WorkflowState,
    },
    storage::{cf, Storage, WriteTxn},
    sweep::Sweeper,
    types::{
        ActorRef, AllocationId, Direction, EntryId, InvestmentId, JourneyId, LotId, Money,
        SnapshotId, TransactionId, WalletId,
    },
    Config, Error, Result,
};
use chrono::{DateTime, Duration, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Result of an idempotent handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    /// The effect was applied by this call
    Applied(T),
    /// The key had already completed; this is the stored result
    Replayed(T),
}

impl<T> Outcome<T> {
    /// Result either way
    pub fn into_inner(self) -> T {
        match self {
            Outcome::Applied(value) | Outcome::Replayed(value) => value,
        }
    }

    /// Borrow the result
    pub fn value(&self) -> &T {
        match self {
            Outcome::Applied(value) | Outcome::Replayed(value) => value,
        }
    }

    /// Whether this call was a replay
    pub fn is_replay(&self) -> bool {
        matches!(self, Outcome::Replayed(_))
    }
}

/// Confirmed payment credited to a wallet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentReceipt {
    /// Wallet transaction
    pub transaction_id: TransactionId,
    /// Journal entry
    pub entry_id: EntryId,
    /// Wallet balance after the credit
    pub balance_after: Money,
}

/// Approved listing received into inventory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LotReceipt {
    /// New lot
    pub lot_id: LotId,
    /// Journal entry
    pub entry_id: EntryId,
    /// Face value paid
    pub face_value: Money,
    /// Total value received including the extra allocation
    pub total_value_received: Money,
}

/// Investment record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Investment {
    /// Investment ID
    pub id: InvestmentId,
    /// Journey it closes
    pub journey_id: JourneyId,
    /// Lot allocated from
    pub lot_id: LotId,
    /// Wallet debited
    pub wallet_id: WalletId,
    /// Amount
    pub amount: Money,
    /// Snapshot the purchase was decided under
    pub snapshot_id: SnapshotId,
    /// Investor
    pub investor: ActorRef,
    /// Timestamp
    pub created_at: DateTime<Utc>,
}

/// Completed purchase
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvestmentReceipt {
    /// Investment
    pub investment: Investment,
    /// Wallet debit
    pub transaction_id: TransactionId,
    /// Allocation log row
    pub allocation_id: AllocationId,
    /// Journal entry
    pub entry_id: EntryId,
}

/// Financial integrity engine
#[derive(Debug)]
pub struct IntegrityEngine {
    config: Config,
    storage: Arc<Storage>,
    outbox: Outbox,
    metrics: Arc<Metrics>,
    chart: ChartOfAccounts,
    ledger: Arc<Ledger>,
    journal: Arc<Journal>,
    inventory: Arc<Inventory>,
    guard: Arc<IdempotencyGuard>,
    machine: Arc<StateMachine>,
    governance: Arc<Governance>,
    journeys: Arc<Journeys>,
}

impl IntegrityEngine {
    /// Open the engine with an in-memory context provider
    pub fn open(config: Config) -> Result<Self> {
        Self::open_with_provider(config, Arc::new(StaticContextProvider::new()))
    }

    /// Open the engine with a given source of platform facts
    pub fn open_with_provider(config: Config, provider: Arc<dyn ContextProvider>) -> Result<Self> {
        config.validate()?;

        let storage = Arc::new(Storage::open(&config)?);
        let metrics = Arc::new(
            Metrics::new().map_err(|e| Error::Config(format!("Failed to register metrics: {}", e)))?,
        );
        let outbox = Outbox::new(EventBus::default(), metrics.clone());

        let registry = Arc::new(TransitionRegistry::with_builtin());
        if let Some(path) = &config.transitions.table_file {
            let loaded = registry.load_file(path)?;
            info!(path = ?path, tables = loaded, "Loaded transition tables");
        }

        let ledger = Arc::new(Ledger::new(storage.clone(), outbox.clone()));
        let chart = ledger.bootstrap_chart()?;
        let journal = Arc::new(Journal::new(
            storage.clone(),
            outbox.clone(),
            Money::from_minor(config.journal.minimum_reserve_minor),
        ));
        let inventory = Arc::new(Inventory::new(storage.clone(), outbox.clone()));
        let guard = Arc::new(IdempotencyGuard::new(
            storage.clone(),
            metrics.clone(),
            Duration::seconds(config.idempotency.stuck_after_secs),
        ));
        let machine = Arc::new(StateMachine::new(storage.clone(), registry, outbox.clone()));
        let governance = Arc::new(Governance::new(
            storage.clone(),
            outbox.clone(),
            provider,
            ledger.clone(),
            journal.clone(),
            Duration::seconds(config.governance.approval_ttl_secs),
        ));
        let journeys = Arc::new(Journeys::new(
            storage.clone(),
            machine.clone(),
            governance.clone(),
            outbox.clone(),
        ));

        info!(
            service = %config.service_name,
            version = %config.service_version,
            data_dir = ?config.data_dir,
            "Integrity engine opened"
        );

        Ok(Self {
            config,
            storage,
            outbox,
            metrics,
            chart,
            ledger,
            journal,
            inventory,
            guard,
            machine,
            governance,
            journeys,
        })
    }

    /// Configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Event bus
    pub fn events(&self) -> &EventBus {
        self.outbox.bus()
    }

    /// Metrics
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// System accounts
    pub fn chart(&self) -> ChartOfAccounts {
        self.chart
    }

    /// Ledger store
    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Wallet journal
    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    /// Inventory accounting
    pub fn inventory(&self) -> &Inventory {
        &self.inventory
    }

    /// Idempotency guard
    pub fn guard(&self) -> &IdempotencyGuard {
        &self.guard
    }

    /// State machine
    pub fn state_machine(&self) -> &StateMachine {
        &self.machine
    }

    /// Governance layer
    pub fn governance(&self) -> &Governance {
        &self.governance
    }

    /// Investor journeys
    pub fn journeys(&self) -> &Journeys {
        &self.journeys
    }

    /// Stuck-operation and approval-expiry sweeper
    pub fn sweeper(&self) -> Sweeper {
        Sweeper::new(self.guard.clone(), self.governance.clone())
    }

    /// Drift detector over this engine's store
    pub fn reconciler(&self) -> Reconciler {
        Reconciler::new(
            self.ledger.clone(),
            self.journal.clone(),
            self.inventory.clone(),
            self.governance.clone(),
            self.metrics.clone(),
        )
    }

    fn admit<T: DeserializeOwned>(&self, key: &IdempotencyKey) -> Result<Option<Outcome<T>>> {
        match self.guard.try_begin(key)? {
            Admission::Admitted { .. } => Ok(None),
            Admission::AlreadyCompleted { result_json } => {
                let value = serde_json::from_str(&result_json)?;
                Ok(Some(Outcome::Replayed(value)))
            }
            Admission::InProgress => self
                .metrics
                .observe(Err(Error::OperationInProgress(key.to_string()))),
        }
    }

    fn release(&self, key: &IdempotencyKey, cause: &Error) {
        if let Err(e) = self.guard.fail(key, &cause.to_string()) {
            error!(key = %key, error = %e, "Failed to release idempotency key");
        }
    }

    /// Admit `key` once, then stage the effect and the key's completion in one unit
    fn run_once<T, F>(&self, key: &IdempotencyKey, stage: F) -> Result<Outcome<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(&WriteTxn<'_>, &mut Vec<EngineEvent>) -> Result<T>,
    {
        if let Some(replayed) = self.admit(key)? {
            return Ok(replayed);
        }

        let mut events = Vec::new();
        let result: Result<T> = (|| {
            let txn = self.storage.begin();
            let value = stage(&txn, &mut events)?;
            self.guard.stage_complete(&txn, key, &value)?;
            self.outbox.commit(txn, std::mem::take(&mut events))?;
            Ok(value)
        })();

        match result {
            Ok(value) => Ok(Outcome::Applied(value)),
            Err(e) => {
                warn!(key = %key, error = %e, "Operation rejected");
                self.release(key, &e);
                self.metrics.observe(Err(e))
            }
        }
    }

    /// Credit a wallet for a confirmed gateway payment
    pub fn on_payment_confirmed(&self, event: PaymentConfirmed) -> Result<Outcome<PaymentReceipt>> {
        let key = event.idempotency_key();
        let amount = Money::from_minor(event.amount_minor);

        let outcome = self.run_once(&key, |txn, events| {
            let transaction = self.journal.stage_record(
                txn,
                &RecordRequest {
                    wallet_id: event.wallet_id,
                    transaction_type: TransactionType::PaymentReceived,
                    amount,
                    reference: Some(key.as_str().to_string()),
                    actor: ActorRef::system(),
                },
                Floor::Reserve,
                events,
            )?;
            let entry = self.ledger.stage_entry(
                txn,
                PostEntry {
                    lines: vec![
                        LineRequest::debit(self.chart.gateway_clearing, amount),
                        LineRequest::credit(self.chart.investor_wallets, amount),
                    ],
                    reference_type: "payment".to_string(),
                    reference_id: event.gateway_id.clone(),
                    description: format!("Payment {} to wallet {}", event.gateway_id, event.wallet_id),
                    entry_date: Utc::now(),
                    created_by: ActorRef::system(),
                },
                events,
            )?;
            Ok(PaymentReceipt {
                transaction_id: transaction.id,
                entry_id: entry.id,
                balance_after: transaction.balance_after,
            })
        })?;

        info!(
            gateway_id = %event.gateway_id,
            wallet_id = %event.wallet_id,
            replay = outcome.is_replay(),
            "Payment confirmation handled"
        );
        Ok(outcome)
    }

    /// Receive the purchased block of an approved listing as an inventory lot
    pub fn on_share_listing_approved(&self, event: ShareListingApproved) -> Result<Outcome<LotReceipt>> {
        let key = event.idempotency_key();

        let outcome = self.run_once(&key, |txn, events| {
            let quantity = i64::try_from(event.quantity)
                .map_err(|_| Error::AmountOverflow(format!("quantity {}", event.quantity)))?;
            let face_value = event
                .unit_price_minor
                .checked_mul(quantity)
                .map(Money::from_minor)
                .ok_or_else(|| {
                    Error::AmountOverflow(format!("{} x {}", event.quantity, event.unit_price_minor))
                })?;
            let total = expected_total(face_value, event.extra_allocation_pct)?;
            let extra = total.checked_sub(face_value)?;

            let lot = self.inventory.stage_receive_lot(
                txn,
                NewLot {
                    company_id: event.company_id,
                    product_id: None,
                    provenance: Provenance::Listing { listing_id: event.listing_id.clone() },
                    face_value,
                    extra_allocation_pct: event.extra_allocation_pct,
                    total_value_received: total,
                    received_by: ActorRef::system(),
                },
            )?;

            let mut lines = vec![
                LineRequest::debit(self.chart.share_inventory, total),
                LineRequest::credit(self.chart.cash, face_value),
            ];
            if extra.is_positive() {
                lines.push(LineRequest::credit(self.chart.platform_equity, extra));
            }
            let entry = self.ledger.stage_entry(
                txn,
                PostEntry {
                    lines,
                    reference_type: "listing".to_string(),
                    reference_id: event.listing_id.clone(),
                    description: format!("Share inventory received for listing {}", event.listing_id),
                    entry_date: Utc::now(),
                    created_by: ActorRef::system(),
                },
                events,
            )?;

            Ok(LotReceipt {
                lot_id: lot.id,
                entry_id: entry.id,
                face_value,
                total_value_received: total,
            })
        })?;

        info!(
            listing_id = %event.listing_id,
            lot_id = %outcome.value().lot_id,
            replay = outcome.is_replay(),
            "Listing approval handled"
        );
        Ok(outcome)
    }

    /// Route an admin-console decision to the maker-checker gate
    pub fn on_admin_decision(&self, event: AdminDecision) -> Result<Outcome<DecisionRecord>> {
        let request = self.governance.request(event.target_id)?;
        if request.action_type != event.action_type {
            return self.metrics.observe(Err(Error::InvalidRequest(format!(
                "request {} is {}, decision names {}",
                event.target_id, request.action_type, event.action_type
            ))));
        }

        let key = event.idempotency_key();
        let now = Utc::now();
        let result = self.run_once(&key, |txn, events| {
            self.governance.stage_decide(
                txn,
                event.target_id,
                &event.actor,
                event.decision,
                &event.reason,
                now,
                events,
            )
        });

        match result {
            Ok(Outcome::Applied(record)) => {
                self.governance.publish_facts(&record)?;
                Ok(Outcome::Applied(record))
            }
            Ok(replayed) => Ok(replayed),
            Err(Error::ApprovalExpired(id)) => {
                self.governance.expire_one(event.target_id, now)?;
                Err(Error::ApprovalExpired(id))
            }
            Err(e) => Err(e),
        }
    }

    /// Open a maker-checker request for a manual wallet adjustment.
    ///
    /// The same admin asking for the same amount on the same wallet within
    /// one minute is refused as a duplicate.
    pub fn request_wallet_adjustment(
        &self,
        admin: ActorRef,
        wallet_id: WalletId,
        direction: Direction,
        amount: Money,
        reason: &str,
    ) -> Result<ApprovalRequest> {
        self.request_wallet_adjustment_at(admin, wallet_id, direction, amount, reason, Utc::now())
    }

    pub(crate) fn request_wallet_adjustment_at(
        &self,
        admin: ActorRef,
        wallet_id: WalletId,
        direction: Direction,
        amount: Money,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<ApprovalRequest> {
        let key = IdempotencyKey::manual_adjustment(&admin, wallet_id, amount, at);
        self.guard.begin_exclusive(&key)?;

        let change = ProposedChange::WalletAdjustment { wallet_id, direction, amount };
        match self.governance.request_approval(change, admin, reason) {
            Ok(request) => {
                self.guard.complete(&key, &request.id)?;
                Ok(request)
            }
            Err(e) => {
                self.release(&key, &e);
                Err(e)
            }
        }
    }

    /// End-to-end purchase at the close of a confirmed journey.
    ///
    /// First unit: the investment row is created (or, on a retry, revived
    /// from `failed`, or from `processing` when an earlier attempt died
    /// between the two units) and both the investment and the journey move to
    /// `processing`. Second unit: wallet debit, lot allocation, ledger entry,
    /// `completed`/`invested` and the key's completion, all or nothing. If
    /// the second unit is rejected the investment moves to `failed` and the
    /// journey stays in `processing`, so the same journey can be retried.
    pub fn invest(
        &self,
        journey_id: JourneyId,
        lot_id: LotId,
        wallet_id: WalletId,
        amount: Money,
        actor: ActorRef,
    ) -> Result<Outcome<InvestmentReceipt>> {
        let key = IdempotencyKey::investment(journey_id);
        if let Some(replayed) = self.admit(&key)? {
            return Ok(replayed);
        }

        let investment = match self.prepare_investment(journey_id, lot_id, wallet_id, amount, &actor) {
            Ok(investment) => investment,
            Err(e) => {
                warn!(journey_id = %journey_id, error = %e, "Investment refused");
                self.release(&key, &e);
                return self.metrics.observe(Err(e));
            }
        };

        let mut events = Vec::new();
        let result: Result<InvestmentReceipt> = (|| {
            let txn = self.storage.begin();
            let receipt = self.stage_purchase(&txn, &investment, &actor, &mut events)?;
            self.guard.stage_complete(&txn, &key, &receipt)?;
            self.outbox.commit(txn, std::mem::take(&mut events))?;
            Ok(receipt)
        })();

        match result {
            Ok(receipt) => {
                info!(
                    investment_id = %investment.id,
                    journey_id = %journey_id,
                    lot_id = %lot_id,
                    wallet_id = %wallet_id,
                    amount = %amount,
                    "Investment completed"
                );
                Ok(Outcome::Applied(receipt))
            }
            Err(e) => {
                warn!(investment_id = %investment.id, error = %e, "Investment rejected");
                if let Err(mark) = self.machine.transition_typed(
                    &investment.id.to_string(),
                    InvestmentStatus::Processing,
                    InvestmentStatus::Failed,
                    &actor,
                    None,
                ) {
                    error!(investment_id = %investment.id, error = %mark, "Failed to mark investment failed");
                }
                self.release(&key, &e);
                self.metrics.observe(Err(e))
            }
        }
    }

    fn prepare_investment(
        &self,
        journey_id: JourneyId,
        lot_id: LotId,
        wallet_id: WalletId,
        amount: Money,
        actor: &ActorRef,
    ) -> Result<Investment> {
        if !amount.is_positive() {
            return Err(Error::InvalidRequest(format!(
                "investment amount must be positive, got {}",
                amount
            )));
        }

        let mut events = Vec::new();
        let txn = self.storage.begin();
        let journey = self.journeys.lock_journey(&txn, journey_id)?;
        if *actor != journey.investor {
            return Err(Error::InvalidRequest(format!(
                "{} cannot invest on journey of {}",
                actor, journey.investor
            )));
        }
        let lot = self.inventory.lot(lot_id)?;
        if lot.company_id != journey.company_id {
            return Err(Error::InvalidRequest(format!(
                "lot {} belongs to company {}, journey {} to {}",
                lot_id, lot.company_id, journey_id, journey.company_id
            )));
        }

        let journey_state = self
            .machine
            .lock_state(&txn, JourneyState::KIND, &journey_id.to_string())?
            .typed::<JourneyState>()?;

        let investment = match (journey_state, journey.investment_id) {
            (JourneyState::Confirming, _) => {
                let investment_id = InvestmentId::new();
                let journey = self
                    .journeys
                    .stage_begin_processing(&txn, journey_id, investment_id, actor, &mut events)?;
                let snapshot_id = journey.snapshot_id.ok_or_else(|| {
                    Error::InvariantViolation(format!("journey {} processing without snapshot", journey_id))
                })?;

                let investment = Investment {
                    id: investment_id,
                    journey_id,
                    lot_id,
                    wallet_id,
                    amount,
                    snapshot_id,
                    investor: actor.clone(),
                    created_at: Utc::now(),
                };
                txn.insert(cf::INVESTMENTS, investment.id.as_bytes(), &investment)?;
                self.machine
                    .stage_create(&txn, InvestmentStatus::KIND, &investment.id.to_string())?;
                self.stage_investment_step(
                    &txn,
                    &investment,
                    InvestmentStatus::Pending,
                    InvestmentStatus::Processing,
                    actor,
                    &mut events,
                )?;
                investment
            }
            (JourneyState::Processing, Some(investment_id)) => {
                let investment = self.investment(investment_id)?;
                if investment.lot_id != lot_id || investment.wallet_id != wallet_id || investment.amount != amount {
                    return Err(Error::InvalidRequest(format!(
                        "retry of investment {} must use its original lot, wallet and amount",
                        investment_id
                    )));
                }
                let snapshot = self.governance.stage_require_current(&txn, investment.snapshot_id)?;
                if !snapshot.facts.accepts_purchases() {
                    return Err(Error::InvalidRequest(format!(
                        "snapshot {} no longer accepts purchases",
                        snapshot.id
                    )));
                }
                let status = self
                    .machine
                    .lock_state(&txn, InvestmentStatus::KIND, &investment_id.to_string())?
                    .typed::<InvestmentStatus>()?;
                match status {
                    // The key was re-admitted, so no attempt is still in flight:
                    // an investment left in processing was stranded by a crash.
                    InvestmentStatus::Processing => {
                        warn!(investment_id = %investment_id, "Recovering stranded investment");
                        self.stage_investment_step(
                            &txn,
                            &investment,
                            InvestmentStatus::Processing,
                            InvestmentStatus::Failed,
                            actor,
                            &mut events,
                        )?;
                    }
                    InvestmentStatus::Failed => {}
                    other => {
                        return Err(Error::IllegalTransition {
                            kind: InvestmentStatus::KIND.to_string(),
                            entity_id: investment_id.to_string(),
                            from: other.as_str().to_string(),
                            to: InvestmentStatus::Processing.as_str().to_string(),
                            reason: "investment cannot be retried".to_string(),
                        });
                    }
                }
                self.stage_investment_step(
                    &txn,
                    &investment,
                    InvestmentStatus::Failed,
                    InvestmentStatus::Pending,
                    actor,
                    &mut events,
                )?;
                self.stage_investment_step(
                    &txn,
                    &investment,
                    InvestmentStatus::Pending,
                    InvestmentStatus::Processing,
                    actor,
                    &mut events,
                )?;
                investment
            }
            (state, _) => {
                return Err(Error::IllegalTransition {
                    kind: JourneyState::KIND.to_string(),
                    entity_id: journey_id.to_string(),
                    from: state.as_str().to_string(),
                    to: JourneyState::Processing.as_str().to_string(),
                    reason: "journey is not ready to invest".to_string(),
                });
            }
        };

        self.outbox.commit(txn, events)?;
        Ok(investment)
    }

    fn stage_purchase(
        &self,
        txn: &WriteTxn<'_>,
        investment: &Investment,
        actor: &ActorRef,
        events: &mut Vec<EngineEvent>,
    ) -> Result<InvestmentReceipt> {
        self.journeys.lock_journey(txn, investment.journey_id)?;
        let reference = format!("investment:{}", investment.id);

        let debit = self.journal.stage_record(
            txn,
            &RecordRequest {
                wallet_id: investment.wallet_id,
                transaction_type: TransactionType::InvestmentPurchase,
                amount: investment.amount,
                reference: Some(reference.clone()),
                actor: actor.clone(),
            },
            Floor::Reserve,
            events,
        )?;
        let allocation = self.inventory.stage_allocate(
            txn,
            investment.lot_id,
            investment.amount,
            Some(reference),
            actor.clone(),
            events,
        )?;
        let entry = self.ledger.stage_entry(
            txn,
            PostEntry {
                lines: vec![
                    LineRequest::debit(self.chart.investor_wallets, investment.amount),
                    LineRequest::credit(self.chart.share_inventory, investment.amount),
                ],
                reference_type: "investment".to_string(),
                reference_id: investment.id.to_string(),
                description: format!("Share purchase from lot {}", investment.lot_id),
                entry_date: Utc::now(),
                created_by: actor.clone(),
            },
            events,
        )?;

        self.stage_investment_step(
            txn,
            investment,
            InvestmentStatus::Processing,
            InvestmentStatus::Completed,
            actor,
            events,
        )?;
        self.journeys.stage_settle(txn, investment.journey_id, actor, events)?;

        Ok(InvestmentReceipt {
            investment: investment.clone(),
            transaction_id: debit.id,
            allocation_id: allocation.id,
            entry_id: entry.id,
        })
    }

    fn stage_investment_step(
        &self,
        txn: &WriteTxn<'_>,
        investment: &Investment,
        from: InvestmentStatus,
        to: InvestmentStatus,
        actor: &ActorRef,
        events: &mut Vec<EngineEvent>,
    ) -> Result<()> {
        self.machine.stage_transition(
            txn,
            &TransitionRequest {
                kind: InvestmentStatus::KIND,
                entity_id: &investment.id.to_string(),
                from: from.as_str(),
                to: to.as_str(),
                actor,
                snapshot_id: Some(investment.snapshot_id),
            },
            events,
        )?;
        Ok(())
    }

    /// Get investment
    pub fn investment(&self, investment_id: InvestmentId) -> Result<Investment> {
        self.storage.require(
            cf::INVESTMENTS,
            investment_id.as_bytes(),
            &format!("investment {}", investment_id),
        )
    }

    /// Current investment status
    pub fn investment_status(&self, investment_id: InvestmentId) -> Result<InvestmentStatus> {
        self.machine.state_of(&investment_id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        governance::{Decision, Lifecycle, PlatformFacts},
        idempotency::{JobStatus, ResolutionAction},
        journey::AcknowledgementKind,
        types::CompanyId,
    };
    use rust_decimal::Decimal;
    use std::str::FromStr;

    fn engine() -> (IntegrityEngine, Arc<StaticContextProvider>, tempfile::TempDir) {
        let temp = tempfile::TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp.path().to_path_buf();
        let provider = Arc::new(StaticContextProvider::new());
        let engine = IntegrityEngine::open_with_provider(config, provider.clone()).unwrap();
        (engine, provider, temp)
    }

    fn listed(buying_enabled: bool) -> PlatformFacts {
        PlatformFacts {
            lifecycle: Lifecycle::Listed,
            buying_enabled,
            risk_score: 20,
            compliance_score: 90,
        }
    }

    fn confirmed_journey(engine: &IntegrityEngine, company: CompanyId, investor: &ActorRef) -> JourneyId {
        let journeys = engine.journeys();
        let journey = journeys.start_journey(investor.clone(), company).unwrap();
        journeys.view(journey.id, investor).unwrap();
        journeys.begin_acknowledgement(journey.id, investor).unwrap();
        let snapshot = engine.governance().snapshot_context(company, &ActorRef::system()).unwrap();
        for kind in [AcknowledgementKind::Risk, AcknowledgementKind::Terms] {
            journeys.acknowledge(journey.id, kind, snapshot.id, investor).unwrap();
        }
        journeys.review(journey.id, investor).unwrap();
        journeys.confirm(journey.id, investor).unwrap();
        journey.id
    }

    fn listing(engine: &IntegrityEngine, company: CompanyId) -> LotId {
        engine
            .on_share_listing_approved(ShareListingApproved {
                listing_id: format!("listing-{}", company),
                company_id: company,
                quantity: 100,
                unit_price_minor: 1_000,
                extra_allocation_pct: Decimal::from_str("5").unwrap(),
            })
            .unwrap()
            .into_inner()
            .lot_id
    }

    fn fund(engine: &IntegrityEngine, wallet: WalletId, gateway_id: &str, amount: i64) {
        engine
            .on_payment_confirmed(PaymentConfirmed {
                gateway_id: gateway_id.to_string(),
                wallet_id: wallet,
                amount_minor: amount,
            })
            .unwrap();
    }

    #[test]
    fn test_payment_replay_is_noop() {
        let (engine, _provider, _temp) = engine();
        let wallet = WalletId::new();
        let event = PaymentConfirmed {
            gateway_id: "pi_1".to_string(),
            wallet_id: wallet,
            amount_minor: 10_000,
        };

        let first = engine.on_payment_confirmed(event.clone()).unwrap();
        let second = engine.on_payment_confirmed(event).unwrap();
        assert!(!first.is_replay());
        assert!(second.is_replay());
        assert_eq!(first.into_inner(), second.into_inner());

        assert_eq!(engine.journal().history(wallet).unwrap().len(), 1);
        assert_eq!(engine.journal().balance(wallet).unwrap(), Money::from_minor(10_000));
        let clearing = engine
            .ledger()
            .account_balance(engine.chart().gateway_clearing, Utc::now())
            .unwrap();
        assert_eq!(clearing.balance, Money::from_minor(10_000));
    }

    #[test]
    fn test_listing_receives_lot_with_extra_allocation() {
        let (engine, _provider, _temp) = engine();
        let company = CompanyId::new();
        let lot_id = listing(&engine, company);

        let lot = engine.inventory().lot(lot_id).unwrap();
        assert_eq!(lot.face_value, Money::from_minor(100_000));
        assert_eq!(lot.total_value_received, Money::from_minor(105_000));
        assert_eq!(engine.inventory().remaining(lot_id).unwrap(), Money::from_minor(105_000));

        let equity = engine
            .ledger()
            .account_balance(engine.chart().platform_equity, Utc::now())
            .unwrap();
        assert_eq!(equity.balance, Money::from_minor(5_000));
        assert!(engine.ledger().trial_balance(Utc::now()).unwrap().is_balanced());
    }

    #[test]
    fn test_invest_end_to_end() {
        let (engine, provider, _temp) = engine();
        let company = CompanyId::new();
        provider.set(company, listed(true));
        let investor = ActorRef::investor("inv-1");
        let wallet = WalletId::new();

        let lot_id = listing(&engine, company);
        fund(&engine, wallet, "pi_2", 50_000);
        let journey_id = confirmed_journey(&engine, company, &investor);

        let receipt = engine
            .invest(journey_id, lot_id, wallet, Money::from_minor(30_000), investor.clone())
            .unwrap()
            .into_inner();

        assert_eq!(engine.journal().balance(wallet).unwrap(), Money::from_minor(20_000));
        assert_eq!(engine.inventory().remaining(lot_id).unwrap(), Money::from_minor(75_000));
        assert_eq!(
            engine.investment_status(receipt.investment.id).unwrap(),
            InvestmentStatus::Completed
        );
        assert_eq!(engine.journeys().state(journey_id).unwrap(), JourneyState::Invested);
        assert!(engine.ledger().trial_balance(Utc::now()).unwrap().is_balanced());

        // Redelivery replays the receipt
        let again = engine
            .invest(journey_id, lot_id, wallet, Money::from_minor(30_000), investor)
            .unwrap();
        assert!(again.is_replay());
        assert_eq!(engine.journal().history(wallet).unwrap().len(), 2);
    }

    #[test]
    fn test_rejected_investment_fails_and_retries() {
        let (engine, provider, _temp) = engine();
        let company = CompanyId::new();
        provider.set(company, listed(true));
        let investor = ActorRef::investor("inv-2");
        let wallet = WalletId::new();

        let lot_id = listing(&engine, company);
        fund(&engine, wallet, "pi_3", 1_000);
        let journey_id = confirmed_journey(&engine, company, &investor);
        let amount = Money::from_minor(2_000);

        let rejected = engine.invest(journey_id, lot_id, wallet, amount, investor.clone());
        assert!(matches!(rejected, Err(Error::InsufficientBalance { .. })));

        let journey = engine.journeys().journey(journey_id).unwrap();
        let investment_id = journey.investment_id.unwrap();
        assert_eq!(engine.investment_status(investment_id).unwrap(), InvestmentStatus::Failed);
        assert_eq!(engine.journeys().state(journey_id).unwrap(), JourneyState::Processing);
        assert_eq!(engine.inventory().remaining(lot_id).unwrap(), Money::from_minor(105_000));
        let job = engine.guard().status(&IdempotencyKey::investment(journey_id)).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);

        fund(&engine, wallet, "pi_4", 1_000);
        let receipt = engine
            .invest(journey_id, lot_id, wallet, amount, investor)
            .unwrap()
            .into_inner();
        assert_eq!(receipt.investment.id, investment_id);
        assert_eq!(engine.investment_status(investment_id).unwrap(), InvestmentStatus::Completed);
        assert_eq!(engine.journal().balance(wallet).unwrap(), Money::ZERO);
    }

    #[test]
    fn test_invest_refused_when_buying_disabled() {
        let (engine, provider, _temp) = engine();
        let company = CompanyId::new();
        provider.set(company, listed(false));
        let investor = ActorRef::investor("inv-3");
        let wallet = WalletId::new();

        let lot_id = listing(&engine, company);
        fund(&engine, wallet, "pi_5", 10_000);
        let journey_id = confirmed_journey(&engine, company, &investor);

        let result = engine.invest(journey_id, lot_id, wallet, Money::from_minor(100), investor);
        assert!(matches!(result, Err(Error::IllegalTransition { .. })));
        assert_eq!(engine.journeys().state(journey_id).unwrap(), JourneyState::Confirming);
        assert_eq!(engine.journal().balance(wallet).unwrap(), Money::from_minor(10_000));
    }

    #[test]
    fn test_admin_decision_is_idempotent() {
        let (engine, _provider, _temp) = engine();
        let wallet = WalletId::new();
        let request = engine
            .request_wallet_adjustment(
                ActorRef::admin("maker"),
                wallet,
                Direction::Credit,
                Money::from_minor(700),
                "compensation",
            )
            .unwrap();

        let decision = AdminDecision {
            action_type: "wallet_adjustment".to_string(),
            target_id: request.id,
            decision: Decision::Approve,
            reason: "approved".to_string(),
            actor: ActorRef::admin("checker"),
        };
        assert!(!engine.on_admin_decision(decision.clone()).unwrap().is_replay());
        assert!(engine.on_admin_decision(decision).unwrap().is_replay());
        assert_eq!(engine.journal().history(wallet).unwrap().len(), 1);
        assert_eq!(engine.governance().log().unwrap().len(), 1);
    }

    #[test]
    fn test_duplicate_adjustment_request_is_loud() {
        let (engine, _provider, _temp) = engine();
        let wallet = WalletId::new();
        let admin = ActorRef::admin("maker");
        let at = DateTime::from_timestamp(1_700_000_010, 0).unwrap();
        let same_minute = DateTime::from_timestamp(1_700_000_050, 0).unwrap();
        let next_minute = DateTime::from_timestamp(1_700_000_070, 0).unwrap();
        let request = |at| {
            engine.request_wallet_adjustment_at(
                admin.clone(),
                wallet,
                Direction::Debit,
                Money::from_minor(5),
                "fee",
                at,
            )
        };

        let first = request(at).unwrap();
        assert!(matches!(request(same_minute), Err(Error::DuplicateOperation { .. })));

        let later = request(next_minute).unwrap();
        assert_ne!(later.id, first.id);
    }

    #[test]
    fn test_stranded_investment_recovers_on_retry() {
        let (engine, provider, _temp) = engine();
        let company = CompanyId::new();
        provider.set(company, listed(true));
        let investor = ActorRef::investor("inv-4");
        let wallet = WalletId::new();

        let lot_id = listing(&engine, company);
        fund(&engine, wallet, "pi_6", 5_000);
        let journey_id = confirmed_journey(&engine, company, &investor);
        let amount = Money::from_minor(4_000);

        // First write unit commits, then the process dies before the purchase
        let key = IdempotencyKey::investment(journey_id);
        assert!(matches!(engine.guard().try_begin(&key).unwrap(), Admission::Admitted { .. }));
        let stranded = engine
            .prepare_investment(journey_id, lot_id, wallet, amount, &investor)
            .unwrap();
        assert_eq!(engine.investment_status(stranded.id).unwrap(), InvestmentStatus::Processing);
        assert_eq!(engine.journeys().state(journey_id).unwrap(), JourneyState::Processing);

        let later = Utc::now() + Duration::hours(1);
        let stuck = engine.guard().sweep_stuck(later).unwrap();
        assert_eq!(stuck.len(), 1);
        assert_eq!(stuck[0].key, key);
        engine
            .guard()
            .resolve_at(&key, ResolutionAction::Retry, &ActorRef::admin("ops"), later)
            .unwrap();

        let receipt = engine
            .invest(journey_id, lot_id, wallet, amount, investor.clone())
            .unwrap()
            .into_inner();
        assert_eq!(receipt.investment.id, stranded.id);
        assert_eq!(engine.investment_status(stranded.id).unwrap(), InvestmentStatus::Completed);
        assert_eq!(engine.journeys().state(journey_id).unwrap(), JourneyState::Invested);
        assert_eq!(engine.journal().balance(wallet).unwrap(), Money::from_minor(1_000));
        assert_eq!(engine.inventory().allocations(lot_id).unwrap().len(), 1);

        let steps: Vec<(String, String)> = engine
            .state_machine()
            .history(InvestmentStatus::KIND, &stranded.id.to_string())
            .unwrap()
            .into_iter()
            .map(|r| (r.from, r.to))
            .collect();
        assert!(steps.contains(&("processing".to_string(), "failed".to_string())));

        let again = engine.invest(journey_id, lot_id, wallet, amount, investor).unwrap();
        assert!(again.is_replay());
    }
}
