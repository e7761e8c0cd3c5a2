//! Integrity Core
//!
//! Financial integrity engine for a share-investment platform: a
//! double-entry book, inventory accounting for purchased share lots, an
//! append-only wallet journal, idempotent event handling, table-driven
//! workflow state machines and a maker-checker governance layer.
//!
//! # Architecture
//!
//! - **Append-only logs**: entries, allocations, wallet transactions,
//!   transitions and governance decisions are never edited or deleted
//! - **Derived balances**: every balance is a fold over its log; heads only
//!   point at the newest row
//! - **Row locks**: each mutation runs in one RocksDB write unit and locks
//!   the rows it validates against
//! - **Idempotency**: every inbound event carries a key; a replay returns
//!   the first result
//!
//! # Invariants
//!
//! - Σ debits == Σ credits for every entry and for the whole book
//! - 0 ≤ lot remaining ≤ lot total value received
//! - wallet balance = Σ credits − Σ debits, never below zero
//! - maker ≠ checker for every approved change

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod types;
pub mod error;
pub mod config;
pub mod storage;
pub mod metrics;
pub mod events;
pub mod ledger;
pub mod journal;
pub mod inventory;
pub mod idempotency;
pub mod state_machine;
pub mod governance;
pub mod journey;
pub mod engine;
pub mod sweep;
pub mod reconciliation;

// Re-exports
pub use config::Config;
pub use engine::{IntegrityEngine, Investment, InvestmentReceipt, LotReceipt, Outcome, PaymentReceipt};
pub use error::{Disposition, Error, Result};
pub use events::{AdminDecision, EngineEvent, EventEnvelope, PaymentConfirmed, ShareListingApproved};
pub use governance::{ContextProvider, Decision, Lifecycle, PlatformFacts, StaticContextProvider};
pub use reconciliation::{Drift, DriftReport};
pub use sweep::{SweepReport, Sweeper};
pub use types::{
    AccountId, ActorKind, ActorRef, ApprovalId, CompanyId, Direction, EntryId, InvestmentId,
    JourneyId, LotId, Money, SnapshotId, TransactionId, WalletId,
};
