//! Inbound and outbound events
//!
//! Inbound events come from collaborators outside the engine (payment
//! webhooks, the admin console, listing approval). Each one derives the
//! idempotency key that makes a replay of the same event a no-op.
//!
//! Outbound events are broadcast after a write commits. Delivery is best
//! effort: a lagging or absent subscriber never fails the write.

use crate::{
    idempotency::IdempotencyKey,
    metrics::Metrics,
    storage::WriteTxn,
    Result,
    types::{
        ActorRef, AllocationId, ApprovalId, CompanyId, EntryId, LotId, Money, TransactionId,
        WalletId,
    },
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Payment gateway confirmed funds for a wallet
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentConfirmed {
    /// Gateway's payment id (stable across webhook retries)
    pub gateway_id: String,
    /// Wallet to credit
    pub wallet_id: WalletId,
    /// Amount in minor units
    pub amount_minor: i64,
}

impl PaymentConfirmed {
    /// Idempotency key
    pub fn idempotency_key(&self) -> IdempotencyKey {
        IdempotencyKey::payment(&self.gateway_id)
    }
}

/// Decision taken in the admin console on an approval request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminDecision {
    /// Action type of the request being decided
    pub action_type: String,
    /// Approval request id
    pub target_id: ApprovalId,
    /// Approve or reject
    pub decision: crate::governance::Decision,
    /// Free-text reason
    pub reason: String,
    /// Principal issuing the decision (must differ from the request's maker)
    pub actor: ActorRef,
}

impl AdminDecision {
    /// Idempotency key
    pub fn idempotency_key(&self) -> IdempotencyKey {
        IdempotencyKey::decision(self.target_id)
    }
}

/// Share listing approved; the purchased block becomes an inventory lot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShareListingApproved {
    /// Listing id
    pub listing_id: String,
    /// Company whose shares were listed
    pub company_id: CompanyId,
    /// Number of shares purchased
    pub quantity: u64,
    /// Price per share in minor units
    pub unit_price_minor: i64,
    /// Extra allocation granted on top of face value, in percent
    pub extra_allocation_pct: Decimal,
}

impl ShareListingApproved {
    /// Idempotency key
    pub fn idempotency_key(&self) -> IdempotencyKey {
        IdempotencyKey::listing(&self.listing_id)
    }
}

/// Event emitted after a successful commit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EngineEvent {
    /// Journal entry committed
    LedgerEntryPosted {
        /// Entry id
        entry_id: EntryId,
        /// Business reference type
        reference_type: String,
        /// Business reference id
        reference_id: String,
        /// Sum of debit lines
        total: Money,
        /// Whether the entry reverses another
        is_reversal: bool,
    },
    /// Allocation (or allocation reversal) committed
    AllocationRecorded {
        /// Allocation log row
        allocation_id: AllocationId,
        /// Lot
        lot_id: LotId,
        /// Amount moved
        amount: Money,
        /// Lot remaining value after the row
        remaining_after: Money,
        /// Whether the row restores a previous allocation
        is_reversal: bool,
    },
    /// Wallet transaction committed
    TransactionRecorded {
        /// Transaction id
        transaction_id: TransactionId,
        /// Wallet
        wallet_id: WalletId,
        /// Transaction type name
        transaction_type: String,
        /// Amount
        amount: Money,
        /// Wallet balance after the row
        balance_after: Money,
    },
    /// Entity changed state
    StateTransitioned {
        /// Entity kind
        kind: String,
        /// Entity id
        entity_id: String,
        /// Previous state
        from: String,
        /// New state
        to: String,
        /// Trigger recorded with the transition
        trigger: String,
    },
    /// Maker-checker decision logged
    GovernanceDecisionLogged {
        /// Governance log sequence number
        sequence: u64,
        /// Decided request
        request_id: ApprovalId,
        /// Decision name
        decision: String,
        /// Principal that decided
        checker: ActorRef,
    },
}

impl EngineEvent {
    /// Subject collaborators subscribe on
    pub fn subject(&self) -> &'static str {
        match self {
            EngineEvent::LedgerEntryPosted { .. } => "integrity.ledger.entry_posted",
            EngineEvent::AllocationRecorded { .. } => "integrity.inventory.allocation_recorded",
            EngineEvent::TransactionRecorded { .. } => "integrity.journal.transaction_recorded",
            EngineEvent::StateTransitioned { .. } => "integrity.workflow.state_transitioned",
            EngineEvent::GovernanceDecisionLogged { .. } => "integrity.governance.decision_logged",
        }
    }
}

/// Envelope delivered to subscribers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Envelope id (UUIDv7)
    pub id: Uuid,
    /// Emission time
    pub emitted_at: DateTime<Utc>,
    /// Payload
    pub event: EngineEvent,
}

/// Fan-out of committed events to in-process subscribers
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EventEnvelope>,
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to events emitted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.sender.subscribe()
    }

    /// Emit one event; never fails the caller
    pub fn publish(&self, event: EngineEvent) {
        let subject = event.subject();
        let envelope = EventEnvelope {
            id: Uuid::now_v7(),
            emitted_at: Utc::now(),
            event,
        };
        if self.sender.send(envelope).is_err() {
            tracing::debug!(subject, "No subscribers for event");
        }
    }

    /// Emit a batch in order
    pub fn publish_all(&self, events: impl IntoIterator<Item = EngineEvent>) {
        for event in events {
            self.publish(event);
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// Commits a write unit, then counts and broadcasts what it produced.
///
/// Events are only ever emitted for committed writes.
#[derive(Debug, Clone)]
pub struct Outbox {
    bus: EventBus,
    metrics: Arc<Metrics>,
}

impl Outbox {
    /// Create outbox
    pub fn new(bus: EventBus, metrics: Arc<Metrics>) -> Self {
        Self { bus, metrics }
    }

    /// Event bus
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Metrics collector
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Commit `txn` and emit `events`
    pub fn commit(&self, txn: WriteTxn<'_>, events: Vec<EngineEvent>) -> Result<()> {
        let timer = self.metrics.write_duration.start_timer();
        txn.commit()?;
        timer.observe_duration();

        self.metrics.record_events(&events);
        self.bus.publish_all(events);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_without_subscribers_is_silent() {
        let bus = EventBus::new(4);
        bus.publish(EngineEvent::StateTransitioned {
            kind: "investment".into(),
            entity_id: "x".into(),
            from: "pending".into(),
            to: "processing".into(),
            trigger: "start".into(),
        });
    }

    #[test]
    fn test_subscriber_receives_in_order() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        let wallet_id = WalletId::new();

        bus.publish_all([
            EngineEvent::TransactionRecorded {
                transaction_id: TransactionId::new(),
                wallet_id,
                transaction_type: "deposit".into(),
                amount: Money::from_minor(100),
                balance_after: Money::from_minor(100),
            },
            EngineEvent::TransactionRecorded {
                transaction_id: TransactionId::new(),
                wallet_id,
                transaction_type: "fee".into(),
                amount: Money::from_minor(10),
                balance_after: Money::from_minor(90),
            },
        ]);

        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        assert_eq!(first.event.subject(), "integrity.journal.transaction_recorded");
        match second.event {
            EngineEvent::TransactionRecorded { balance_after, .. } => {
                assert_eq!(balance_after, Money::from_minor(90))
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_inbound_keys_are_stable() {
        let event = PaymentConfirmed {
            gateway_id: "pi_123".into(),
            wallet_id: WalletId::new(),
            amount_minor: 500,
        };
        assert_eq!(event.idempotency_key(), event.clone().idempotency_key());
        assert_eq!(event.idempotency_key().as_str(), "payment:pi_123");
    }
}
