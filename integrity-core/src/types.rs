//! Core types shared by every engine module
//!
//! All types are designed for:
//! - Deterministic serialization (bincode)
//! - Exact arithmetic (integer minor units for money, never floating point)
//! - Typed identifiers so a lot id cannot be passed where a wallet id is expected

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            /// Generate a new time-ordered identifier (UUIDv7)
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            /// Wrap an existing UUID
            pub fn from_uuid(id: Uuid) -> Self {
                Self(id)
            }

            /// Underlying UUID
            pub fn as_uuid(&self) -> Uuid {
                self.0
            }

            /// Raw bytes, used for storage keys
            pub fn as_bytes(&self) -> &[u8; 16] {
                self.0.as_bytes()
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                Uuid::parse_str(s)
                    .map(Self)
                    .map_err(|e| Error::InvalidRequest(format!("invalid {}: {}", stringify!($name), e)))
            }
        }
    };
}

uuid_id!(
    /// Chart-of-accounts account
    AccountId
);
uuid_id!(
    /// Journal entry (one per business event)
    EntryId
);
uuid_id!(
    /// Journal line within an entry
    LineId
);
uuid_id!(
    /// Purchased share block
    LotId
);
uuid_id!(
    /// Allocation log row
    AllocationId
);
uuid_id!(
    /// Investor wallet
    WalletId
);
uuid_id!(
    /// Wallet-affecting transaction
    TransactionId
);
uuid_id!(
    /// Investment record
    InvestmentId
);
uuid_id!(
    /// Investor journey
    JourneyId
);
uuid_id!(
    /// Platform context snapshot
    SnapshotId
);
uuid_id!(
    /// Maker-checker approval request
    ApprovalId
);
uuid_id!(
    /// Listed company
    CompanyId
);
uuid_id!(
    /// Share product a lot belongs to
    ProductId
);

/// Money amount in integer minor units (cents, fils, paise)
///
/// Arithmetic is checked; overflow surfaces as [`Error::AmountOverflow`].
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Money(i64);

impl Money {
    /// Zero
    pub const ZERO: Money = Money(0);

    /// Create from minor units
    pub const fn from_minor(minor: i64) -> Self {
        Self(minor)
    }

    /// Minor units
    pub const fn minor(&self) -> i64 {
        self.0
    }

    /// Strictly greater than zero
    pub fn is_positive(&self) -> bool {
        self.0 > 0
    }

    /// Strictly less than zero
    pub fn is_negative(&self) -> bool {
        self.0 < 0
    }

    /// Checked addition
    pub fn checked_add(self, other: Money) -> Result<Money> {
        self.0
            .checked_add(other.0)
            .map(Money)
            .ok_or_else(|| Error::AmountOverflow(format!("{} + {}", self.0, other.0)))
    }

    /// Checked subtraction
    pub fn checked_sub(self, other: Money) -> Result<Money> {
        self.0
            .checked_sub(other.0)
            .map(Money)
            .ok_or_else(|| Error::AmountOverflow(format!("{} - {}", self.0, other.0)))
    }

    /// Checked sum over an iterator
    pub fn checked_sum<I: IntoIterator<Item = Money>>(iter: I) -> Result<Money> {
        iter.into_iter().try_fold(Money::ZERO, Money::checked_add)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Side of a journal line or wallet movement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Debit
    Debit,
    /// Credit
    Credit,
}

impl Direction {
    /// Opposite side
    pub fn flip(self) -> Self {
        match self {
            Direction::Debit => Direction::Credit,
            Direction::Credit => Direction::Debit,
        }
    }

    /// Lower-case name
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Debit => "debit",
            Direction::Credit => "credit",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of principal taking an action
///
/// Platform admins and company-side users have disjoint identity spaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActorKind {
    /// Platform administrator
    PlatformAdmin,
    /// User acting for a listed company
    CompanyUser,
    /// Investor acting on their own journey
    Investor,
    /// The engine itself (sweeps, bootstrap)
    System,
}

impl ActorKind {
    /// Lower-case name
    pub fn as_str(&self) -> &'static str {
        match self {
            ActorKind::PlatformAdmin => "platform_admin",
            ActorKind::CompanyUser => "company_user",
            ActorKind::Investor => "investor",
            ActorKind::System => "system",
        }
    }
}

/// Tagged actor reference `{kind, id}`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActorRef {
    /// Identity space
    pub kind: ActorKind,
    /// Identifier within that space
    pub id: String,
}

impl ActorRef {
    /// Platform admin
    pub fn admin(id: impl Into<String>) -> Self {
        Self { kind: ActorKind::PlatformAdmin, id: id.into() }
    }

    /// Company-side user
    pub fn company_user(id: impl Into<String>) -> Self {
        Self { kind: ActorKind::CompanyUser, id: id.into() }
    }

    /// Investor
    pub fn investor(id: impl Into<String>) -> Self {
        Self { kind: ActorKind::Investor, id: id.into() }
    }

    /// The engine
    pub fn system() -> Self {
        Self { kind: ActorKind::System, id: "integrity-engine".to_string() }
    }
}

impl fmt::Display for ActorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.id)
    }
}
