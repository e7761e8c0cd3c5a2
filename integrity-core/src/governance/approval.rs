//! Maker-checker requests and the governance log
//!
//! Each decision (approval, rejection, expiry) appends one governance-log
//! row. Rows are hash-chained: every row stores the previous row's hash and
//! its own hash covers that link, so editing or dropping a row breaks the
//! chain from that point on.

use super::snapshot::Lifecycle;
use crate::{
    storage::encode,
    types::{ActorRef, ApprovalId, CompanyId, Direction, EntryId, Money, SnapshotId, TransactionId, WalletId},
    Result,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Hash stored as `prev_hash` of the first row
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// High-risk change that needs a second principal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProposedChange {
    /// Credit or debit a wallet outside the normal flows
    WalletAdjustment {
        /// Wallet
        wallet_id: WalletId,
        /// Credit raises, debit lowers the balance
        direction: Direction,
        /// Amount
        amount: Money,
    },
    /// Compensate a wallet transaction
    ReverseTransaction {
        /// Transaction to reverse
        transaction_id: TransactionId,
    },
    /// Compensate a journal entry
    ReverseEntry {
        /// Entry to reverse
        entry_id: EntryId,
    },
    /// Open or halt purchases for a company
    SetBuyingEnabled {
        /// Company
        company_id: CompanyId,
        /// New flag
        enabled: bool,
    },
    /// Move a company through its listing lifecycle
    SetLifecycle {
        /// Company
        company_id: CompanyId,
        /// New lifecycle state
        lifecycle: Lifecycle,
    },
}

impl ProposedChange {
    /// Action type name
    pub fn action_type(&self) -> &'static str {
        match self {
            ProposedChange::WalletAdjustment { .. } => "wallet_adjustment",
            ProposedChange::ReverseTransaction { .. } => "reverse_transaction",
            ProposedChange::ReverseEntry { .. } => "reverse_entry",
            ProposedChange::SetBuyingEnabled { .. } => "set_buying_enabled",
            ProposedChange::SetLifecycle { .. } => "set_lifecycle",
        }
    }
}

/// Request status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApprovalStatus {
    /// Waiting for a checker
    Pending,
    /// Approved and applied
    Approved,
    /// Rejected
    Rejected,
    /// Left undecided past expiry
    Expired,
}

impl ApprovalStatus {
    /// Lower-case name
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Rejected => "rejected",
            ApprovalStatus::Expired => "expired",
        }
    }
}

/// Checker's decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    /// Apply the change
    Approve,
    /// Drop the change
    Reject,
}

/// Maker-checker request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    /// Request ID
    pub id: ApprovalId,
    /// Action type
    pub action_type: String,
    /// Proposed change
    pub change: ProposedChange,
    /// Principal who opened it
    pub maker: ActorRef,
    /// Maker's justification
    pub reason: String,
    /// Status
    pub status: ApprovalStatus,
    /// Opened at
    pub created_at: DateTime<Utc>,
    /// Undecided past this instant, the request expires
    pub expires_at: DateTime<Utc>,
    /// Checker (or the system, for expiry)
    pub decided_by: Option<ActorRef>,
    /// Decision time
    pub decided_at: Option<DateTime<Utc>>,
    /// Checker's reason
    pub decision_reason: Option<String>,
}

/// Record produced by applying an approved change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppliedEffect {
    /// Wallet transaction written
    Transaction(TransactionId),
    /// Journal entry posted
    Entry(EntryId),
    /// Superseding snapshot taken
    Snapshot(SnapshotId),
}

/// Immutable, hash-chained governance-log row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GovernanceLogRow {
    /// Position in the log, starting at 1
    pub sequence: u64,
    /// Decided request
    pub request_id: ApprovalId,
    /// Action type
    pub action_type: String,
    /// Resulting status
    pub outcome: ApprovalStatus,
    /// Maker
    pub maker: ActorRef,
    /// Checker (system for expiry)
    pub checker: ActorRef,
    /// Checker's reason
    pub reason: String,
    /// The change as proposed
    pub change: ProposedChange,
    /// Records the change produced
    pub effects: Vec<AppliedEffect>,
    /// Timestamp
    pub recorded_at: DateTime<Utc>,
    /// Hash of the previous row
    pub prev_hash: String,
    /// Hash of this row
    pub hash: String,
}

impl GovernanceLogRow {
    /// SHA-256 (hex) over every field except `hash`
    pub fn compute_hash(&self) -> Result<String> {
        let mut hasher = Sha256::new();
        hasher.update(self.prev_hash.as_bytes());
        hasher.update(self.sequence.to_be_bytes());
        hasher.update(self.request_id.as_bytes());
        hasher.update(self.action_type.as_bytes());
        hasher.update(self.outcome.as_str().as_bytes());
        hasher.update(encode(&self.maker)?);
        hasher.update(encode(&self.checker)?);
        hasher.update(self.reason.as_bytes());
        hasher.update(encode(&self.change)?);
        hasher.update(encode(&self.effects)?);
        hasher.update(self.recorded_at.to_rfc3339().as_bytes());
        Ok(hex::encode(hasher.finalize()))
    }

    /// Whether the stored hash matches the row
    pub fn verify_hash(&self) -> Result<bool> {
        Ok(self.hash == self.compute_hash()?)
    }
}

/// Tail of the governance log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct LogHead {
    pub(crate) sequence: u64,
    pub(crate) hash: String,
}

impl Default for LogHead {
    fn default() -> Self {
        Self { sequence: 0, hash: GENESIS_HASH.to_string() }
    }
}
