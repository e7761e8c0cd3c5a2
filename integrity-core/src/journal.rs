//! Append-only wallet transaction journal
//!
//! A wallet has no balance field. Its balance is the `balance_after` of its
//! newest transaction; the per-wallet head row only points at that
//! transaction and carries the sequence counter. Every write locks the head
//! row first, so two debits against one wallet serialize and the second one
//! validates against the balance the first one left behind.

use crate::{
    events::{EngineEvent, Outbox},
    storage::{cf, keys, Storage, WriteTxn},
    types::{ActorRef, ApprovalId, Direction, Money, TransactionId, WalletId},
    Error, Result,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// Wallet transaction type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionType {
    /// Funds deposited by the investor
    Deposit,
    /// Payment confirmed by the gateway
    PaymentReceived,
    /// Refund back into the wallet
    Refund,
    /// Approved manual credit
    AdjustmentCredit,
    /// Compensation of a debit-like transaction
    ReversalCredit,
    /// Incoming leg of a wallet-to-wallet transfer
    TransferIn,
    /// Funds withdrawn
    Withdrawal,
    /// Shares purchased
    InvestmentPurchase,
    /// Fee charged
    Fee,
    /// Approved manual debit
    AdjustmentDebit,
    /// Compensation of a credit-like transaction
    ReversalDebit,
    /// Outgoing leg of a wallet-to-wallet transfer
    TransferOut,
}

impl TransactionType {
    /// Credit-like types raise the balance, debit-like types lower it
    pub fn direction(&self) -> Direction {
        match self {
            TransactionType::Deposit
            | TransactionType::PaymentReceived
            | TransactionType::Refund
            | TransactionType::AdjustmentCredit
            | TransactionType::ReversalCredit
            | TransactionType::TransferIn => Direction::Credit,
            TransactionType::Withdrawal
            | TransactionType::InvestmentPurchase
            | TransactionType::Fee
            | TransactionType::AdjustmentDebit
            | TransactionType::ReversalDebit
            | TransactionType::TransferOut => Direction::Debit,
        }
    }

    /// Whether the type raises the balance
    pub fn is_credit_like(&self) -> bool {
        self.direction() == Direction::Credit
    }

    /// Type of the compensating transaction
    pub fn compensation(&self) -> TransactionType {
        if self.is_credit_like() {
            TransactionType::ReversalDebit
        } else {
            TransactionType::ReversalCredit
        }
    }

    /// Snake-case name
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Deposit => "deposit",
            TransactionType::PaymentReceived => "payment_received",
            TransactionType::Refund => "refund",
            TransactionType::AdjustmentCredit => "adjustment_credit",
            TransactionType::ReversalCredit => "reversal_credit",
            TransactionType::TransferIn => "transfer_in",
            TransactionType::Withdrawal => "withdrawal",
            TransactionType::InvestmentPurchase => "investment_purchase",
            TransactionType::Fee => "fee",
            TransactionType::AdjustmentDebit => "adjustment_debit",
            TransactionType::ReversalDebit => "reversal_debit",
            TransactionType::TransferOut => "transfer_out",
        }
    }
}

/// Immutable wallet transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Transaction ID
    pub id: TransactionId,
    /// Wallet
    pub wallet_id: WalletId,
    /// Position in the wallet's history, starting at 1
    pub sequence: u64,
    /// Type
    pub transaction_type: TransactionType,
    /// Amount (always positive)
    pub amount: Money,
    /// Balance before this transaction
    pub balance_before: Money,
    /// Balance after this transaction
    pub balance_after: Money,
    /// Transaction this one compensates
    pub reverses: Option<TransactionId>,
    /// Other leg of a transfer
    pub paired_transaction_id: Option<TransactionId>,
    /// Business reference (payment id, investment id, ...)
    pub reference: Option<String>,
    /// Who recorded it
    pub created_by: ActorRef,
    /// Timestamp
    pub created_at: DateTime<Utc>,
}

/// Request to record one transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordRequest {
    /// Wallet
    pub wallet_id: WalletId,
    /// Type
    pub transaction_type: TransactionType,
    /// Amount (must be positive)
    pub amount: Money,
    /// Business reference
    pub reference: Option<String>,
    /// Actor
    pub actor: ActorRef,
}

/// Audit row written with every admin-override transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverrideAudit {
    /// Transaction recorded under the override
    pub transaction_id: TransactionId,
    /// Wallet
    pub wallet_id: WalletId,
    /// Admin who used the override
    pub actor: ActorRef,
    /// Justification
    pub reason: String,
    /// Approval request authorizing it, if any
    pub approval_id: Option<ApprovalId>,
    /// Reserve the ordinary path would have enforced
    pub bypassed_reserve: Money,
    /// Resulting balance
    pub balance_after: Money,
    /// Timestamp
    pub recorded_at: DateTime<Utc>,
}

/// Per-wallet cursor (never a balance)
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct WalletHead {
    sequence: u64,
    last_transaction_id: TransactionId,
}

/// Lowest balance a debit may leave
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Floor {
    /// Configured minimum reserve
    Reserve,
    /// Zero: admin override and compensations
    Zero,
}

fn reversal_marker(transaction_id: TransactionId) -> Vec<u8> {
    keys::join(&[b"txn/", transaction_id.as_bytes()])
}

/// Wallet transaction journal service
#[derive(Debug)]
pub struct Journal {
    storage: Arc<Storage>,
    outbox: Outbox,
    minimum_reserve: Money,
}

impl Journal {
    /// Create journal service
    pub fn new(storage: Arc<Storage>, outbox: Outbox, minimum_reserve: Money) -> Self {
        Self { storage, outbox, minimum_reserve }
    }

    /// Configured minimum reserve
    pub fn minimum_reserve(&self) -> Money {
        self.minimum_reserve
    }

    /// Record a transaction on the ordinary path (debits keep the reserve)
    pub fn record(&self, request: RecordRequest) -> Result<Transaction> {
        self.run(|txn, events| Ok(vec![self.stage_record(txn, &request, Floor::Reserve, events)?]))
            .map(|mut txns| txns.remove(0))
    }

    /// Record a transaction on the audited admin-override path.
    ///
    /// The reserve is not enforced, but the balance still cannot go below
    /// zero. The override audit row commits with the transaction.
    pub fn record_with_override(
        &self,
        request: RecordRequest,
        reason: &str,
        approval_id: Option<ApprovalId>,
    ) -> Result<Transaction> {
        self.run(|txn, events| {
            Ok(vec![self.stage_override(txn, &request, reason, approval_id, events)?])
        })
        .map(|mut txns| txns.remove(0))
    }

    /// Compensate a transaction with an opposite-direction one
    pub fn reverse(&self, transaction_id: TransactionId, reason: &str, actor: ActorRef) -> Result<Transaction> {
        self.run(|txn, events| Ok(vec![self.stage_reverse(txn, transaction_id, reason, actor, events)?]))
            .map(|mut txns| txns.remove(0))
    }

    /// Move funds between two wallets as a linked debit/credit pair
    pub fn transfer(
        &self,
        from: WalletId,
        to: WalletId,
        amount: Money,
        actor: ActorRef,
    ) -> Result<(Transaction, Transaction)> {
        let mut legs = self.run(|txn, events| {
            let (debit, credit) = self.stage_transfer(txn, from, to, amount, &actor, events)?;
            Ok(vec![debit, credit])
        })?;
        let credit = legs.remove(1);
        let debit = legs.remove(0);
        Ok((debit, credit))
    }

    fn run<F>(&self, stage: F) -> Result<Vec<Transaction>>
    where
        F: FnOnce(&WriteTxn<'_>, &mut Vec<EngineEvent>) -> Result<Vec<Transaction>>,
    {
        let mut events = Vec::new();
        let result: Result<Vec<Transaction>> = (|| {
            let txn = self.storage.begin();
            let staged = stage(&txn, &mut events)?;
            self.outbox.commit(txn, std::mem::take(&mut events))?;
            Ok(staged)
        })();

        match self.outbox.metrics().observe(result) {
            Ok(staged) => {
                for t in &staged {
                    info!(
                        transaction_id = %t.id,
                        wallet_id = %t.wallet_id,
                        transaction_type = t.transaction_type.as_str(),
                        amount = %t.amount,
                        balance_after = %t.balance_after,
                        "Wallet transaction recorded"
                    );
                }
                Ok(staged)
            }
            Err(e) => {
                warn!(error = %e, "Wallet transaction rejected");
                Err(e)
            }
        }
    }

    /// Stage one transaction into an open write unit
    pub(crate) fn stage_record(
        &self,
        txn: &WriteTxn<'_>,
        request: &RecordRequest,
        floor: Floor,
        events: &mut Vec<EngineEvent>,
    ) -> Result<Transaction> {
        self.stage_one(txn, request, floor, None, None, TransactionId::new(), events)
    }

    #[allow(clippy::too_many_arguments)]
    fn stage_one(
        &self,
        txn: &WriteTxn<'_>,
        request: &RecordRequest,
        floor: Floor,
        reverses: Option<TransactionId>,
        paired: Option<TransactionId>,
        id: TransactionId,
        events: &mut Vec<EngineEvent>,
    ) -> Result<Transaction> {
        if !request.amount.is_positive() {
            return Err(Error::InvalidRequest(format!(
                "transaction amount must be positive, got {}",
                request.amount
            )));
        }

        let head: Option<WalletHead> = txn.lock(cf::WALLET_HEADS, request.wallet_id.as_bytes())?;
        let (sequence, balance_before) = match head {
            Some(head) => {
                let last: Transaction = txn
                    .get(cf::TRANSACTIONS, head.last_transaction_id.as_bytes())?
                    .ok_or_else(|| {
                        Error::InvariantViolation(format!(
                            "wallet {} head points at missing transaction {}",
                            request.wallet_id, head.last_transaction_id
                        ))
                    })?;
                (head.sequence + 1, last.balance_after)
            }
            None => (1, Money::ZERO),
        };

        let balance_after = match request.transaction_type.direction() {
            Direction::Credit => balance_before.checked_add(request.amount)?,
            Direction::Debit => {
                let floor = match floor {
                    Floor::Reserve => self.minimum_reserve,
                    Floor::Zero => Money::ZERO,
                };
                let after = balance_before.checked_sub(request.amount)?;
                if after < floor {
                    return Err(Error::InsufficientBalance {
                        wallet_id: request.wallet_id.to_string(),
                        balance: balance_before.minor(),
                        amount: request.amount.minor(),
                        floor: floor.minor(),
                    });
                }
                after
            }
        };

        let transaction = Transaction {
            id,
            wallet_id: request.wallet_id,
            sequence,
            transaction_type: request.transaction_type,
            amount: request.amount,
            balance_before,
            balance_after,
            reverses,
            paired_transaction_id: paired,
            reference: request.reference.clone(),
            created_by: request.actor.clone(),
            created_at: Utc::now(),
        };

        txn.insert(cf::TRANSACTIONS, transaction.id.as_bytes(), &transaction)?;
        txn.insert(
            cf::WALLET_INDEX,
            &keys::join(&[request.wallet_id.as_bytes(), &keys::seq(sequence)]),
            &transaction.id,
        )?;
        txn.put(
            cf::WALLET_HEADS,
            request.wallet_id.as_bytes(),
            &WalletHead { sequence, last_transaction_id: transaction.id },
        )?;

        events.push(EngineEvent::TransactionRecorded {
            transaction_id: transaction.id,
            wallet_id: transaction.wallet_id,
            transaction_type: transaction.transaction_type.as_str().to_string(),
            amount: transaction.amount,
            balance_after,
        });
        Ok(transaction)
    }

    pub(crate) fn stage_override(
        &self,
        txn: &WriteTxn<'_>,
        request: &RecordRequest,
        reason: &str,
        approval_id: Option<ApprovalId>,
        events: &mut Vec<EngineEvent>,
    ) -> Result<Transaction> {
        if reason.trim().is_empty() {
            return Err(Error::InvalidRequest("override requires a reason".to_string()));
        }

        let transaction =
            self.stage_one(txn, request, Floor::Zero, None, None, TransactionId::new(), events)?;
        txn.insert(
            cf::OVERRIDES,
            transaction.id.as_bytes(),
            &OverrideAudit {
                transaction_id: transaction.id,
                wallet_id: transaction.wallet_id,
                actor: request.actor.clone(),
                reason: reason.to_string(),
                approval_id,
                bypassed_reserve: self.minimum_reserve,
                balance_after: transaction.balance_after,
                recorded_at: transaction.created_at,
            },
        )?;
        Ok(transaction)
    }

    pub(crate) fn stage_reverse(
        &self,
        txn: &WriteTxn<'_>,
        transaction_id: TransactionId,
        reason: &str,
        actor: ActorRef,
        events: &mut Vec<EngineEvent>,
    ) -> Result<Transaction> {
        let original: Transaction = txn
            .get(cf::TRANSACTIONS, transaction_id.as_bytes())?
            .ok_or_else(|| Error::NotFound(format!("transaction {}", transaction_id)))?;
        if original.reverses.is_some() {
            return Err(Error::InvalidRequest(format!(
                "transaction {} is itself a reversal",
                transaction_id
            )));
        }

        let marker = reversal_marker(transaction_id);
        if let Some(existing) = txn.lock::<TransactionId>(cf::REVERSALS, &marker)? {
            return Err(Error::AlreadyReversed(format!(
                "transaction {} reversed by {}",
                transaction_id, existing
            )));
        }

        let request = RecordRequest {
            wallet_id: original.wallet_id,
            transaction_type: original.transaction_type.compensation(),
            amount: original.amount,
            reference: Some(format!("reversal of {}: {}", transaction_id, reason)),
            actor,
        };
        let reversal = self.stage_one(
            txn,
            &request,
            Floor::Zero,
            Some(transaction_id),
            None,
            TransactionId::new(),
            events,
        )?;
        txn.insert(cf::REVERSALS, &marker, &reversal.id)?;
        Ok(reversal)
    }

    pub(crate) fn stage_transfer(
        &self,
        txn: &WriteTxn<'_>,
        from: WalletId,
        to: WalletId,
        amount: Money,
        actor: &ActorRef,
        events: &mut Vec<EngineEvent>,
    ) -> Result<(Transaction, Transaction)> {
        if from == to {
            return Err(Error::InvalidRequest("cannot transfer to the same wallet".to_string()));
        }

        // Lock order by wallet id so opposite transfers cannot deadlock.
        let (first, second) = if from < to { (from, to) } else { (to, from) };
        txn.lock::<WalletHead>(cf::WALLET_HEADS, first.as_bytes())?;
        txn.lock::<WalletHead>(cf::WALLET_HEADS, second.as_bytes())?;

        let debit_id = TransactionId::new();
        let credit_id = TransactionId::new();
        let reference = Some(format!("transfer {} -> {}", from, to));

        let debit = self.stage_one(
            txn,
            &RecordRequest {
                wallet_id: from,
                transaction_type: TransactionType::TransferOut,
                amount,
                reference: reference.clone(),
                actor: actor.clone(),
            },
            Floor::Reserve,
            None,
            Some(credit_id),
            debit_id,
            events,
        )?;
        let credit = self.stage_one(
            txn,
            &RecordRequest {
                wallet_id: to,
                transaction_type: TransactionType::TransferIn,
                amount,
                reference,
                actor: actor.clone(),
            },
            Floor::Reserve,
            None,
            Some(debit_id),
            credit_id,
            events,
        )?;
        Ok((debit, credit))
    }

    /// Get transaction
    pub fn transaction(&self, transaction_id: TransactionId) -> Result<Transaction> {
        self.storage.require(
            cf::TRANSACTIONS,
            transaction_id.as_bytes(),
            &format!("transaction {}", transaction_id),
        )
    }

    /// Override audit row for a transaction, if it used the override path
    pub fn override_audit(&self, transaction_id: TransactionId) -> Result<Option<OverrideAudit>> {
        self.storage.get(cf::OVERRIDES, transaction_id.as_bytes())
    }

    /// Current balance: the newest transaction's `balance_after`
    pub fn balance(&self, wallet_id: WalletId) -> Result<Money> {
        let head: Option<WalletHead> = self.storage.get(cf::WALLET_HEADS, wallet_id.as_bytes())?;
        match head {
            Some(head) => Ok(self.transaction(head.last_transaction_id)?.balance_after),
            None => Ok(Money::ZERO),
        }
    }

    /// Every transaction of a wallet in sequence order
    pub fn history(&self, wallet_id: WalletId) -> Result<Vec<Transaction>> {
        self.storage
            .scan_prefix::<TransactionId>(cf::WALLET_INDEX, wallet_id.as_bytes())?
            .into_iter()
            .map(|(_, id)| self.transaction(id))
            .collect()
    }

    /// Fold the wallet's history from zero, checking every row's arithmetic
    pub fn replay_balance(&self, wallet_id: WalletId) -> Result<Money> {
        replay(&self.history(wallet_id)?)
    }

    /// Every wallet with at least one transaction
    pub fn wallets(&self) -> Result<Vec<WalletId>> {
        self.storage
            .scan_all::<WalletHead>(cf::WALLET_HEADS)?
            .into_iter()
            .map(|(_, head)| Ok(self.transaction(head.last_transaction_id)?.wallet_id))
            .collect()
    }
}

/// Fold transactions from zero; any row that does not chain is an invariant violation
pub fn replay(history: &[Transaction]) -> Result<Money> {
    let mut balance = Money::ZERO;
    for (index, t) in history.iter().enumerate() {
        let expected_sequence = index as u64 + 1;
        if t.sequence != expected_sequence || t.balance_before != balance {
            return Err(Error::InvariantViolation(format!(
                "wallet {} breaks at sequence {}: expected before {}, found {}",
                t.wallet_id, t.sequence, balance, t.balance_before
            )));
        }
        balance = match t.transaction_type.direction() {
            Direction::Credit => balance.checked_add(t.amount)?,
            Direction::Debit => balance.checked_sub(t.amount)?,
        };
        if balance != t.balance_after || balance.is_negative() {
            return Err(Error::InvariantViolation(format!(
                "wallet {} sequence {}: recorded after {}, replayed {}",
                t.wallet_id, t.sequence, t.balance_after, balance
            )));
        }
    }
    Ok(balance)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::open_store;

    fn journal(reserve: i64) -> (Journal, tempfile::TempDir) {
        let (storage, outbox, temp) = open_store();
        (Journal::new(storage, outbox, Money::from_minor(reserve)), temp)
    }

    fn request(wallet_id: WalletId, transaction_type: TransactionType, amount: i64) -> RecordRequest {
        RecordRequest {
            wallet_id,
            transaction_type,
            amount: Money::from_minor(amount),
            reference: None,
            actor: ActorRef::system(),
        }
    }

    #[test]
    fn test_balance_follows_conservation_rule() {
        let (journal, _temp) = journal(0);
        let wallet = WalletId::new();

        let deposit = journal.record(request(wallet, TransactionType::Deposit, 1_000)).unwrap();
        assert_eq!(deposit.balance_before, Money::ZERO);
        assert_eq!(deposit.balance_after, Money::from_minor(1_000));
        assert_eq!(deposit.sequence, 1);

        let fee = journal.record(request(wallet, TransactionType::Fee, 150)).unwrap();
        assert_eq!(fee.balance_before, Money::from_minor(1_000));
        assert_eq!(fee.balance_after, Money::from_minor(850));
        assert_eq!(fee.sequence, 2);

        assert_eq!(journal.balance(wallet).unwrap(), Money::from_minor(850));
        assert_eq!(journal.replay_balance(wallet).unwrap(), Money::from_minor(850));
    }

    #[test]
    fn test_overdraw_rejected() {
        let (journal, _temp) = journal(0);
        let wallet = WalletId::new();
        journal.record(request(wallet, TransactionType::Deposit, 100)).unwrap();

        let result = journal.record(request(wallet, TransactionType::Withdrawal, 101));
        assert!(matches!(
            result,
            Err(Error::InsufficientBalance { balance: 100, amount: 101, floor: 0, .. })
        ));
        assert_eq!(journal.history(wallet).unwrap().len(), 1);
    }

    #[test]
    fn test_non_positive_amount_rejected() {
        let (journal, _temp) = journal(0);
        let result = journal.record(request(WalletId::new(), TransactionType::Deposit, 0));
        assert!(matches!(result, Err(Error::InvalidRequest(_))));
    }

    #[test]
    fn test_reserve_and_override() {
        let (journal, _temp) = journal(200);
        let wallet = WalletId::new();
        journal.record(request(wallet, TransactionType::Deposit, 1_000)).unwrap();

        // Ordinary path must leave the reserve behind
        assert!(matches!(
            journal.record(request(wallet, TransactionType::Withdrawal, 900)),
            Err(Error::InsufficientBalance { floor: 200, .. })
        ));

        let admin = ActorRef::admin("ops-7");
        let mut drain = request(wallet, TransactionType::AdjustmentDebit, 1_000);
        drain.actor = admin.clone();
        let t = journal
            .record_with_override(drain, "account closure", None)
            .unwrap();
        assert_eq!(t.balance_after, Money::ZERO);

        let audit = journal.override_audit(t.id).unwrap().unwrap();
        assert_eq!(audit.actor, admin);
        assert_eq!(audit.bypassed_reserve, Money::from_minor(200));

        // Override still cannot go below zero
        let mut below = request(wallet, TransactionType::AdjustmentDebit, 1);
        below.actor = admin;
        assert!(matches!(
            journal.record_with_override(below, "again", None),
            Err(Error::InsufficientBalance { floor: 0, .. })
        ));
    }

    #[test]
    fn test_reverse_compensates_once() {
        let (journal, _temp) = journal(0);
        let wallet = WalletId::new();
        journal.record(request(wallet, TransactionType::Deposit, 500)).unwrap();
        let fee = journal.record(request(wallet, TransactionType::Fee, 40)).unwrap();

        let reversal = journal.reverse(fee.id, "fee waived", ActorRef::admin("a")).unwrap();
        assert_eq!(reversal.transaction_type, TransactionType::ReversalCredit);
        assert_eq!(reversal.reverses, Some(fee.id));
        assert_eq!(reversal.balance_after, Money::from_minor(500));
        assert_eq!(journal.transaction(fee.id).unwrap(), fee);

        assert!(matches!(
            journal.reverse(fee.id, "twice", ActorRef::admin("a")),
            Err(Error::AlreadyReversed(_))
        ));
        assert!(matches!(
            journal.reverse(reversal.id, "undo", ActorRef::admin("a")),
            Err(Error::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_reversing_spent_credit_fails() {
        let (journal, _temp) = journal(0);
        let wallet = WalletId::new();
        let deposit = journal.record(request(wallet, TransactionType::Deposit, 300)).unwrap();
        journal.record(request(wallet, TransactionType::Withdrawal, 250)).unwrap();

        assert!(matches!(
            journal.reverse(deposit.id, "chargeback", ActorRef::admin("a")),
            Err(Error::InsufficientBalance { .. })
        ));
    }

    #[test]
    fn test_transfer_pairs_legs() {
        let (journal, _temp) = journal(0);
        let alice = WalletId::new();
        let bob = WalletId::new();
        journal.record(request(alice, TransactionType::Deposit, 1_000)).unwrap();

        let (debit, credit) = journal
            .transfer(alice, bob, Money::from_minor(400), ActorRef::investor("alice"))
            .unwrap();
        assert_eq!(debit.paired_transaction_id, Some(credit.id));
        assert_eq!(credit.paired_transaction_id, Some(debit.id));
        assert_eq!(journal.balance(alice).unwrap(), Money::from_minor(600));
        assert_eq!(journal.balance(bob).unwrap(), Money::from_minor(400));

        // Failed transfer leaves neither leg behind
        assert!(journal
            .transfer(bob, alice, Money::from_minor(401), ActorRef::investor("bob"))
            .is_err());
        assert_eq!(journal.history(bob).unwrap().len(), 1);
        assert_eq!(journal.history(alice).unwrap().len(), 2);
    }

    #[test]
    fn test_replay_detects_broken_chain() {
        let (journal, _temp) = journal(0);
        let wallet = WalletId::new();
        journal.record(request(wallet, TransactionType::Deposit, 100)).unwrap();
        journal.record(request(wallet, TransactionType::Deposit, 50)).unwrap();

        let mut history = journal.history(wallet).unwrap();
        history[1].balance_before = Money::from_minor(99);
        assert!(matches!(replay(&history), Err(Error::InvariantViolation(_))));
    }
}
