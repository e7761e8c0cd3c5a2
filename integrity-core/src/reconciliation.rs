//! Drift detection
//!
//! Recomputes every derived figure from the append-only logs and compares
//! it with what the heads and headers say. Findings are reported and
//! logged; nothing is repaired here.

use crate::{
    governance::Governance,
    inventory::Inventory,
    journal::Journal,
    ledger::Ledger,
    metrics::Metrics,
    types::{Direction, EntryId, LotId, Money, WalletId},
    Result,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};

/// One discrepancy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Drift {
    /// Entry lines do not sum to the header total on both sides
    UnbalancedEntry {
        /// Entry
        entry_id: EntryId,
        /// Σ debit lines
        debits: Money,
        /// Σ credit lines
        credits: Money,
        /// Header total
        total: Money,
    },
    /// Lot remaining value outside `[0, total_value_received]`
    LotOutOfBounds {
        /// Lot
        lot_id: LotId,
        /// Remaining value at the head
        remaining: Money,
        /// Total value received
        total: Money,
    },
    /// Folding the allocation log disagrees with the head
    LotReplayMismatch {
        /// Lot
        lot_id: LotId,
        /// What went wrong
        detail: String,
    },
    /// Folding the wallet history disagrees with the head
    WalletChainBroken {
        /// Wallet
        wallet_id: WalletId,
        /// What went wrong
        detail: String,
    },
    /// Governance log hash chain broken
    GovernanceChainBroken {
        /// What went wrong
        detail: String,
    },
    /// Whole-book debits and credits differ
    TrialBalanceMismatch {
        /// Σ debits
        debits: Money,
        /// Σ credits
        credits: Money,
    },
}

/// Result of one reconciliation run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriftReport {
    /// Run time
    pub checked_at: DateTime<Utc>,
    /// Entries checked
    pub entries: usize,
    /// Lots checked
    pub lots: usize,
    /// Wallets checked
    pub wallets: usize,
    /// Governance-log rows verified
    pub governance_rows: u64,
    /// Discrepancies
    pub findings: Vec<Drift>,
}

impl DriftReport {
    /// No discrepancies
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }
}

/// Reconciler
#[derive(Debug, Clone)]
pub struct Reconciler {
    ledger: Arc<Ledger>,
    journal: Arc<Journal>,
    inventory: Arc<Inventory>,
    governance: Arc<Governance>,
    metrics: Arc<Metrics>,
}

impl Reconciler {
    /// Create reconciler
    pub fn new(
        ledger: Arc<Ledger>,
        journal: Arc<Journal>,
        inventory: Arc<Inventory>,
        governance: Arc<Governance>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self { ledger, journal, inventory, governance, metrics }
    }

    /// Check every record family once
    pub fn run(&self) -> Result<DriftReport> {
        let checked_at = Utc::now();
        let mut findings = Vec::new();

        let entries = self.ledger.entries()?;
        for entry in &entries {
            let mut debits = Money::ZERO;
            let mut credits = Money::ZERO;
            for line in self.ledger.entry_lines(entry.id)? {
                match line.direction {
                    Direction::Debit => debits = debits.checked_add(line.amount)?,
                    Direction::Credit => credits = credits.checked_add(line.amount)?,
                }
            }
            if debits != credits || debits != entry.total {
                findings.push(Drift::UnbalancedEntry {
                    entry_id: entry.id,
                    debits,
                    credits,
                    total: entry.total,
                });
            }
        }

        let trial = self.ledger.trial_balance(checked_at)?;
        if !trial.is_balanced() {
            findings.push(Drift::TrialBalanceMismatch {
                debits: trial.total_debits,
                credits: trial.total_credits,
            });
        }

        let lots = self.inventory.lots()?;
        for lot in &lots {
            let remaining = self.inventory.remaining(lot.id)?;
            if remaining.is_negative() || remaining > lot.total_value_received {
                findings.push(Drift::LotOutOfBounds {
                    lot_id: lot.id,
                    remaining,
                    total: lot.total_value_received,
                });
            }
            match self.inventory.replay_remaining(lot.id) {
                Ok(replayed) if replayed == remaining => {}
                Ok(replayed) => findings.push(Drift::LotReplayMismatch {
                    lot_id: lot.id,
                    detail: format!("head says {}, log folds to {}", remaining, replayed),
                }),
                Err(e) => findings.push(Drift::LotReplayMismatch {
                    lot_id: lot.id,
                    detail: e.to_string(),
                }),
            }
        }

        let wallets = self.journal.wallets()?;
        for wallet_id in &wallets {
            let balance = self.journal.balance(*wallet_id)?;
            match self.journal.replay_balance(*wallet_id) {
                Ok(replayed) if replayed == balance => {}
                Ok(replayed) => findings.push(Drift::WalletChainBroken {
                    wallet_id: *wallet_id,
                    detail: format!("head says {}, history folds to {}", balance, replayed),
                }),
                Err(e) => findings.push(Drift::WalletChainBroken {
                    wallet_id: *wallet_id,
                    detail: e.to_string(),
                }),
            }
        }

        let governance_rows = match self.governance.verify_log_chain() {
            Ok(rows) => rows,
            Err(e) => {
                findings.push(Drift::GovernanceChainBroken { detail: e.to_string() });
                0
            }
        };

        for finding in &findings {
            error!(?finding, "Drift detected");
        }
        self.metrics.drift_findings.set(findings.len() as i64);
        info!(
            entries = entries.len(),
            lots = lots.len(),
            wallets = wallets.len(),
            governance_rows,
            findings = findings.len(),
            "Reconciliation finished"
        );

        Ok(DriftReport {
            checked_at,
            entries: entries.len(),
            lots: lots.len(),
            wallets: wallets.len(),
            governance_rows,
            findings,
        })
    }
}
