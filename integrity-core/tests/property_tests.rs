//! Property-based tests for engine invariants
//!
//! These tests use proptest to verify critical invariants:
//! - Every entry balances: Σ(debits) == Σ(credits)
//! - Lot remaining value stays within [0, total received]
//! - Wallet balance replays exactly from the transaction log
//! - Idempotency: a redelivered event has exactly one effect
//! - State machines only record legal transitions; terminal states stay put

use chrono::Utc;
use integrity_core::{
    inventory::{NewLot, Provenance},
    journal::{RecordRequest, TransactionType},
    ledger::{LineRequest, PostEntry},
    state_machine::{InvestmentStatus, JourneyState, WorkflowState},
    types::AllocationId,
    ActorRef, CompanyId, Config, Direction, Error, IntegrityEngine, Money, PaymentConfirmed, WalletId,
};
use proptest::prelude::*;
use rust_decimal::Decimal;
use tempfile::TempDir;

/// Create test engine with temp directory
fn create_test_engine() -> (IntegrityEngine, TempDir) {
    let temp_dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.data_dir = temp_dir.path().to_path_buf();
    (IntegrityEngine::open(config).unwrap(), temp_dir)
}

/// Strategy for generating wallet transaction types
fn transaction_type_strategy() -> impl Strategy<Value = TransactionType> {
    prop_oneof![
        Just(TransactionType::Deposit),
        Just(TransactionType::PaymentReceived),
        Just(TransactionType::Refund),
        Just(TransactionType::Withdrawal),
        Just(TransactionType::InvestmentPurchase),
        Just(TransactionType::Fee),
    ]
}

/// Strategy for generating investment states
fn investment_status_strategy() -> impl Strategy<Value = InvestmentStatus> {
    prop_oneof![
        Just(InvestmentStatus::Pending),
        Just(InvestmentStatus::Processing),
        Just(InvestmentStatus::Completed),
        Just(InvestmentStatus::Failed),
        Just(InvestmentStatus::Cancelled),
    ]
}

/// Strategy for generating journey states
fn journey_state_strategy() -> impl Strategy<Value = JourneyState> {
    prop_oneof![
        Just(JourneyState::Initiated),
        Just(JourneyState::Viewing),
        Just(JourneyState::Acknowledging),
        Just(JourneyState::Reviewing),
        Just(JourneyState::Confirming),
        Just(JourneyState::Processing),
        Just(JourneyState::Invested),
        Just(JourneyState::Blocked),
        Just(JourneyState::Abandoned),
    ]
}

/// Drive one entity through `targets` and check every outcome against its table
fn check_walk<S: WorkflowState + std::fmt::Debug>(
    engine: &IntegrityEngine,
    targets: &[S],
) -> Result<(), TestCaseError> {
    let machine = engine.state_machine();
    let table = machine.registry().table(S::KIND).unwrap();
    let entity_id = uuid::Uuid::now_v7().to_string();
    machine.create(S::KIND, &entity_id).unwrap();
    let actor = ActorRef::system();

    for target in targets {
        let current: S = machine.state_of(&entity_id).unwrap();
        let legal = table.check(current.as_str(), target.as_str()).is_ok();
        let result = machine.transition_typed(&entity_id, current, *target, &actor, None);

        prop_assert_eq!(result.is_ok(), legal);
        if table.is_terminal(current.as_str()) {
            prop_assert!(result.is_err());
        }
        if let Err(e) = result {
            prop_assert!(matches!(e, Error::IllegalTransition { .. }), "unexpected {:?}", e);
        }
    }

    for record in machine.history(S::KIND, &entity_id).unwrap() {
        prop_assert!(table.check(&record.from, &record.to).is_ok());
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Property: Only balanced entries are ever posted
    #[test]
    fn prop_posted_entries_balance(
        debits in prop::collection::vec(1i64..1_000_000, 1..6),
        skew in -2i64..=2,
    ) {
        let (engine, _temp) = create_test_engine();
        let chart = engine.chart();
        let total: i64 = debits.iter().sum();

        let mut lines: Vec<LineRequest> = debits
            .iter()
            .map(|amount| LineRequest::debit(chart.cash, Money::from_minor(*amount)))
            .collect();
        lines.push(LineRequest::credit(chart.platform_equity, Money::from_minor(total + skew)));

        let result = engine.ledger().post_entry(PostEntry {
            lines,
            reference_type: "manual".to_string(),
            reference_id: "prop".to_string(),
            description: "Capital injection".to_string(),
            entry_date: Utc::now(),
            created_by: ActorRef::admin("accountant"),
        });

        if skew == 0 {
            let entry = result.unwrap();
            let lines = engine.ledger().entry_lines(entry.id).unwrap();
            let sum = |direction: Direction| -> i64 {
                lines.iter().filter(|l| l.direction == direction).map(|l| l.amount.minor()).sum()
            };
            prop_assert_eq!(sum(Direction::Debit), sum(Direction::Credit));
            prop_assert_eq!(sum(Direction::Debit), entry.total.minor());
        } else {
            prop_assert!(matches!(result, Err(Error::UnbalancedEntry { .. })), "unexpected {:?}", result);
            prop_assert!(engine.ledger().entries().unwrap().is_empty());
        }
        prop_assert!(engine.ledger().trial_balance(Utc::now()).unwrap().is_balanced());
    }

    /// Property: Lot remaining value stays in bounds under allocations and reversals
    #[test]
    fn prop_lot_remaining_in_bounds(
        ops in prop::collection::vec((any::<bool>(), 1i64..600, any::<prop::sample::Index>()), 1..25),
    ) {
        let (engine, _temp) = create_test_engine();
        let inventory = engine.inventory();
        let total = Money::from_minor(1_000);
        let lot = inventory
            .receive_lot(NewLot {
                company_id: CompanyId::new(),
                product_id: None,
                provenance: Provenance::Manual { justification: "property run".to_string() },
                face_value: total,
                extra_allocation_pct: Decimal::ZERO,
                total_value_received: total,
                received_by: ActorRef::admin("ops"),
            })
            .unwrap();

        let mut allocated: Vec<AllocationId> = Vec::new();
        for (reverse, amount, pick) in ops {
            if reverse && !allocated.is_empty() {
                let target = allocated[pick.index(allocated.len())];
                match inventory.reverse_allocation(target, "property run", ActorRef::admin("ops")) {
                    Ok(_) | Err(Error::AlreadyReversed(_)) => {}
                    Err(e) => prop_assert!(false, "unexpected {:?}", e),
                }
            } else {
                match inventory.allocate(lot.id, Money::from_minor(amount), None, ActorRef::system()) {
                    Ok(row) => allocated.push(row.id),
                    Err(Error::InsufficientInventory { .. }) => {}
                    Err(e) => prop_assert!(false, "unexpected {:?}", e),
                }
            }

            let remaining = inventory.remaining(lot.id).unwrap();
            prop_assert!(!remaining.is_negative());
            prop_assert!(remaining <= total);
            prop_assert_eq!(inventory.replay_remaining(lot.id).unwrap(), remaining);
        }
    }

    /// Property: Wallet balance is exactly the replay of its log
    #[test]
    fn prop_wallet_balance_replays(
        ops in prop::collection::vec((transaction_type_strategy(), 1i64..10_000), 1..30),
    ) {
        let (engine, _temp) = create_test_engine();
        let journal = engine.journal();
        let wallet = WalletId::new();

        for (transaction_type, amount) in ops {
            let result = journal.record(RecordRequest {
                wallet_id: wallet,
                transaction_type,
                amount: Money::from_minor(amount),
                reference: None,
                actor: ActorRef::system(),
            });
            match result {
                Ok(_) | Err(Error::InsufficientBalance { .. }) => {}
                Err(e) => prop_assert!(false, "unexpected {:?}", e),
            }

            let balance = journal.balance(wallet).unwrap();
            prop_assert!(!balance.is_negative());
            prop_assert_eq!(journal.replay_balance(wallet).unwrap(), balance);
        }

        let history = journal.history(wallet).unwrap();
        let folded: i64 = history
            .iter()
            .map(|t| match t.transaction_type.direction() {
                Direction::Credit => t.amount.minor(),
                Direction::Debit => -t.amount.minor(),
            })
            .sum();
        prop_assert_eq!(Money::from_minor(folded), journal.balance(wallet).unwrap());
        for (index, t) in history.iter().enumerate() {
            prop_assert_eq!(t.sequence, index as u64 + 1);
        }
    }

    /// Property: A redelivered payment confirmation is applied once
    #[test]
    fn prop_payment_applied_once(amount in 1i64..1_000_000, deliveries in 2usize..6) {
        let (engine, _temp) = create_test_engine();
        let wallet = WalletId::new();
        let event = PaymentConfirmed {
            gateway_id: format!("pi_{}", amount),
            wallet_id: wallet,
            amount_minor: amount,
        };

        let first = engine.on_payment_confirmed(event.clone()).unwrap();
        prop_assert!(!first.is_replay());
        for _ in 1..deliveries {
            let again = engine.on_payment_confirmed(event.clone()).unwrap();
            prop_assert!(again.is_replay());
            prop_assert_eq!(again.value(), first.value());
        }

        prop_assert_eq!(engine.journal().history(wallet).unwrap().len(), 1);
        prop_assert_eq!(engine.journal().balance(wallet).unwrap(), Money::from_minor(amount));
        prop_assert_eq!(engine.ledger().entries().unwrap().len(), 1);
    }

    /// Property: Investments only move along their table
    #[test]
    fn prop_investment_transitions_legal(
        targets in prop::collection::vec(investment_status_strategy(), 1..12),
    ) {
        let (engine, _temp) = create_test_engine();
        check_walk(&engine, &targets)?;
    }

    /// Property: Journeys only move along their table
    #[test]
    fn prop_journey_transitions_legal(
        targets in prop::collection::vec(journey_state_strategy(), 1..15),
    ) {
        let (engine, _temp) = create_test_engine();
        check_walk(&engine, &targets)?;
    }
}
