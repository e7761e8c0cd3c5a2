//! Platform context snapshots
//!
//! A snapshot freezes the governance facts about a company at one moment.
//! Journeys and investments reference the snapshot they were decided under,
//! so later changes cannot alter what an investor was shown. Snapshots are
//! never edited: a change produces a new snapshot and moves the company's
//! current-snapshot pointer.

use crate::{
    storage::encode,
    types::{ActorRef, CompanyId, SnapshotId},
    Error, Result,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Listing lifecycle of a company on the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Lifecycle {
    /// Being prepared, not yet visible
    Draft,
    /// Open to investors
    Listed,
    /// Temporarily halted
    Suspended,
    /// Permanently removed
    Delisted,
}

/// Governance facts shown to an investor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformFacts {
    /// Lifecycle state
    pub lifecycle: Lifecycle,
    /// Whether new purchases are accepted
    pub buying_enabled: bool,
    /// Risk score (0-100)
    pub risk_score: u32,
    /// Compliance score (0-100)
    pub compliance_score: u32,
}

impl PlatformFacts {
    /// Purchases are allowed only for a listed company with buying enabled
    pub fn accepts_purchases(&self) -> bool {
        self.buying_enabled && self.lifecycle == Lifecycle::Listed
    }
}

/// Source of live governance facts
pub trait ContextProvider: Send + Sync + std::fmt::Debug {
    /// Current facts for a company
    fn facts(&self, company_id: CompanyId) -> Result<PlatformFacts>;

    /// Record facts changed through an approved governance request
    fn update(&self, company_id: CompanyId, facts: &PlatformFacts) -> Result<()>;
}

/// In-memory provider
#[derive(Debug, Default)]
pub struct StaticContextProvider {
    facts: DashMap<CompanyId, PlatformFacts>,
}

impl StaticContextProvider {
    /// Create empty provider
    pub fn new() -> Self {
        Self::default()
    }

    /// Set facts for a company
    pub fn set(&self, company_id: CompanyId, facts: PlatformFacts) {
        self.facts.insert(company_id, facts);
    }
}

impl ContextProvider for StaticContextProvider {
    fn facts(&self, company_id: CompanyId) -> Result<PlatformFacts> {
        self.facts
            .get(&company_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::NotFound(format!("platform facts for company {}", company_id)))
    }

    fn update(&self, company_id: CompanyId, facts: &PlatformFacts) -> Result<()> {
        self.facts.insert(company_id, facts.clone());
        Ok(())
    }
}

/// Immutable snapshot of platform facts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    /// Snapshot ID
    pub id: SnapshotId,
    /// Company
    pub company_id: CompanyId,
    /// Captured facts
    pub facts: PlatformFacts,
    /// SHA-256 (hex) over company and facts
    pub digest: String,
    /// Snapshot this one superseded
    pub supersedes: Option<SnapshotId>,
    /// Position in the company's snapshot history, starting at 1
    pub version: u64,
    /// Who took it
    pub taken_by: ActorRef,
    /// Timestamp
    pub taken_at: DateTime<Utc>,
}

impl ContextSnapshot {
    /// Whether the stored digest still matches the facts
    pub fn verify(&self) -> Result<bool> {
        Ok(self.digest == digest(self.company_id, &self.facts)?)
    }
}

/// Company -> current snapshot
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub(crate) struct SnapshotHead {
    pub(crate) current: SnapshotId,
    pub(crate) version: u64,
}

/// Digest of a company's facts
pub fn digest(company_id: CompanyId, facts: &PlatformFacts) -> Result<String> {
    let mut hasher = Sha256::new();
    hasher.update(company_id.as_bytes());
    hasher.update(encode(facts)?);
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn facts() -> PlatformFacts {
        PlatformFacts {
            lifecycle: Lifecycle::Listed,
            buying_enabled: true,
            risk_score: 40,
            compliance_score: 90,
        }
    }

    #[test]
    fn test_digest_is_stable_and_sensitive() {
        let company = CompanyId::new();
        let a = digest(company, &facts()).unwrap();
        assert_eq!(a, digest(company, &facts()).unwrap());
        assert_eq!(a.len(), 64);

        let mut changed = facts();
        changed.risk_score = 41;
        assert_ne!(a, digest(company, &changed).unwrap());
        assert_ne!(a, digest(CompanyId::new(), &facts()).unwrap());
    }

    #[test]
    fn test_static_provider() {
        let provider = StaticContextProvider::new();
        let company = CompanyId::new();
        assert!(matches!(provider.facts(company), Err(Error::NotFound(_))));

        provider.set(company, facts());
        let mut suspended = facts();
        suspended.lifecycle = Lifecycle::Suspended;
        provider.update(company, &suspended).unwrap();
        assert!(!provider.facts(company).unwrap().accepts_purchases());
    }
}
