//! Error types for the integrity engine
//!
//! Every rejection surfaces a specific variant so callers can tell
//! "retry safely" from "do not retry" from "needs a human decision"
//! (see [`Error::disposition`]).

use thiserror::Error;

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Engine errors
#[derive(Error, Debug)]
pub enum Error {
    /// Journal entry does not balance or is malformed
    #[error("Unbalanced entry: debits {debits} != credits {credits} ({lines} lines)")]
    UnbalancedEntry {
        /// Sum of debit lines (minor units)
        debits: i64,
        /// Sum of credit lines (minor units)
        credits: i64,
        /// Number of lines submitted
        lines: usize,
    },

    /// Allocation would drive a lot below zero remaining
    #[error("Insufficient inventory on lot {lot_id}: requested {requested}, remaining {remaining}")]
    InsufficientInventory {
        /// Lot the allocation targeted
        lot_id: String,
        /// Requested amount (minor units)
        requested: i64,
        /// Remaining value at the time of the check
        remaining: i64,
    },

    /// Debit would drive a wallet below its floor
    #[error("Insufficient balance on wallet {wallet_id}: balance {balance}, debit {amount}, floor {floor}")]
    InsufficientBalance {
        /// Wallet the debit targeted
        wallet_id: String,
        /// Current derived balance
        balance: i64,
        /// Requested debit
        amount: i64,
        /// Lowest balance the debit may leave
        floor: i64,
    },

    /// Idempotency key reused after it already completed
    #[error("Duplicate operation: key {key} already completed")]
    DuplicateOperation {
        /// Idempotency key
        key: String,
    },

    /// Transition not present in the legal-transition table
    #[error("Illegal transition for {kind} {entity_id}: {from} -> {to} ({reason})")]
    IllegalTransition {
        /// Entity kind (investment, journey, ...)
        kind: String,
        /// Entity identifier
        entity_id: String,
        /// State the caller expected / the entity holds
        from: String,
        /// Requested target state
        to: String,
        /// Why it was refused
        reason: String,
    },

    /// Maker tried to check their own request
    #[error("Self approval refused: {actor} cannot decide request {request_id} they opened")]
    SelfApproval {
        /// Approval request
        request_id: String,
        /// Offending principal
        actor: String,
    },

    /// Job left processing past the stuck threshold
    #[error("Stuck operation: key {key} processing for {age_secs}s")]
    StuckOperation {
        /// Idempotency key
        key: String,
        /// Seconds since the job started
        age_secs: i64,
    },

    /// Idempotency key currently held by another worker
    #[error("Operation in progress: key {0}")]
    OperationInProgress(String),

    /// Approval request passed its expiry
    #[error("Approval request expired: {0}")]
    ApprovalExpired(String),

    /// Approval request already decided
    #[error("Approval request {request_id} is {status}, not pending")]
    RequestNotPending {
        /// Approval request
        request_id: String,
        /// Current status
        status: String,
    },

    /// Record already has a compensating reversal
    #[error("Already reversed: {0}")]
    AlreadyReversed(String),

    /// Request failed validation
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Record not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Stored data violates an invariant
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Checked arithmetic overflowed
    #[error("Amount overflow: {0}")]
    AmountOverflow(String),

    /// Storage error (RocksDB)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// How a caller should treat a rejection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Same request may be resubmitted; it cannot double-apply
    RetrySafe,
    /// Resubmitting cannot succeed without changed inputs
    DoNotRetry,
    /// An operator must look at it
    NeedsHumanDecision,
}

impl Error {
    /// Stable short name used for metrics labels and logs
    pub fn kind(&self) -> &'static str {
        match self {
            Error::UnbalancedEntry { .. } => "unbalanced_entry",
            Error::InsufficientInventory { .. } => "insufficient_inventory",
            Error::InsufficientBalance { .. } => "insufficient_balance",
            Error::DuplicateOperation { .. } => "duplicate_operation",
            Error::IllegalTransition { .. } => "illegal_transition",
            Error::SelfApproval { .. } => "self_approval",
            Error::StuckOperation { .. } => "stuck_operation",
            Error::OperationInProgress(_) => "operation_in_progress",
            Error::ApprovalExpired(_) => "approval_expired",
            Error::RequestNotPending { .. } => "request_not_pending",
            Error::AlreadyReversed(_) => "already_reversed",
            Error::InvalidRequest(_) => "invalid_request",
            Error::NotFound(_) => "not_found",
            Error::InvariantViolation(_) => "invariant_violation",
            Error::AmountOverflow(_) => "amount_overflow",
            Error::Storage(_) => "storage",
            Error::Serialization(_) => "serialization",
            Error::Config(_) => "config",
            Error::Io(_) => "io",
        }
    }

    /// Classify the error for the API layer
    pub fn disposition(&self) -> Disposition {
        match self {
            Error::DuplicateOperation { .. }
            | Error::OperationInProgress(_)
            | Error::Storage(_)
            | Error::Io(_) => Disposition::RetrySafe,
            Error::IllegalTransition { .. }
            | Error::StuckOperation { .. }
            | Error::InvariantViolation(_) => Disposition::NeedsHumanDecision,
            _ => Disposition::DoNotRetry,
        }
    }
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
