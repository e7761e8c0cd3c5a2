//! Metrics collection for observability
//!
//! This module provides Prometheus metrics for monitoring the engine.
//!
//! # Metrics
//!
//! - `integrity_entries_posted_total` - Journal entries committed
//! - `integrity_allocations_total` - Allocation log rows committed
//! - `integrity_wallet_transactions_total` - Wallet transactions committed
//! - `integrity_transitions_total` - State transitions committed
//! - `integrity_governance_decisions_total` - Maker-checker decisions logged
//! - `integrity_rejections_total{kind}` - Rejected operations by error kind
//! - `integrity_stuck_operations` - Jobs found stuck by the last sweep
//! - `integrity_drift_findings` - Findings of the last reconciliation run
//! - `integrity_write_duration_seconds` - Atomic write latency

use crate::{events::EngineEvent, Error};
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;

/// Metrics collector
///
/// Each collector owns its registry, so several engines in one process
/// (tests, tools) never collide on registration.
#[derive(Clone, Debug)]
pub struct Metrics {
    /// Journal entries committed
    pub entries_posted: IntCounter,

    /// Allocation log rows committed
    pub allocations: IntCounter,

    /// Wallet transactions committed
    pub wallet_transactions: IntCounter,

    /// State transitions committed
    pub transitions: IntCounter,

    /// Governance decisions logged
    pub governance_decisions: IntCounter,

    /// Rejections by error kind
    pub rejections: IntCounterVec,

    /// Stuck jobs found by the last sweep
    pub stuck_operations: IntGauge,

    /// Findings of the last reconciliation run
    pub drift_findings: IntGauge,

    /// Atomic write duration histogram
    pub write_duration: Histogram,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let entries_posted = IntCounter::new(
            "integrity_entries_posted_total",
            "Journal entries committed",
        )?;
        registry.register(Box::new(entries_posted.clone()))?;

        let allocations = IntCounter::new(
            "integrity_allocations_total",
            "Allocation log rows committed",
        )?;
        registry.register(Box::new(allocations.clone()))?;

        let wallet_transactions = IntCounter::new(
            "integrity_wallet_transactions_total",
            "Wallet transactions committed",
        )?;
        registry.register(Box::new(wallet_transactions.clone()))?;

        let transitions = IntCounter::new(
            "integrity_transitions_total",
            "State transitions committed",
        )?;
        registry.register(Box::new(transitions.clone()))?;

        let governance_decisions = IntCounter::new(
            "integrity_governance_decisions_total",
            "Maker-checker decisions logged",
        )?;
        registry.register(Box::new(governance_decisions.clone()))?;

        let rejections = IntCounterVec::new(
            Opts::new("integrity_rejections_total", "Rejected operations by error kind"),
            &["kind"],
        )?;
        registry.register(Box::new(rejections.clone()))?;

        let stuck_operations = IntGauge::new(
            "integrity_stuck_operations",
            "Jobs found stuck by the last sweep",
        )?;
        registry.register(Box::new(stuck_operations.clone()))?;

        let drift_findings = IntGauge::new(
            "integrity_drift_findings",
            "Findings of the last reconciliation run",
        )?;
        registry.register(Box::new(drift_findings.clone()))?;

        let write_duration = Histogram::with_opts(
            HistogramOpts::new(
                "integrity_write_duration_seconds",
                "Atomic write latency",
            )
            .buckets(vec![0.0005, 0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 1.0]),
        )?;
        registry.register(Box::new(write_duration.clone()))?;

        Ok(Self {
            entries_posted,
            allocations,
            wallet_transactions,
            transitions,
            governance_decisions,
            rejections,
            stuck_operations,
            drift_findings,
            write_duration,
            registry,
        })
    }

    /// Count committed writes by the events they produced
    pub fn record_events(&self, events: &[EngineEvent]) {
        for event in events {
            match event {
                EngineEvent::LedgerEntryPosted { .. } => self.entries_posted.inc(),
                EngineEvent::AllocationRecorded { .. } => self.allocations.inc(),
                EngineEvent::TransactionRecorded { .. } => self.wallet_transactions.inc(),
                EngineEvent::StateTransitioned { .. } => self.transitions.inc(),
                EngineEvent::GovernanceDecisionLogged { .. } => self.governance_decisions.inc(),
            }
        }
    }

    /// Count a rejected operation
    pub fn record_rejection(&self, error: &Error) {
        self.rejections.with_label_values(&[error.kind()]).inc();
    }

    /// Pass a result through, counting it if it is a rejection
    pub fn observe<T>(&self, result: crate::Result<T>) -> crate::Result<T> {
        if let Err(ref e) = result {
            self.record_rejection(e);
        }
        result
    }

    /// Rejections counted for one error kind
    pub fn rejections_of(&self, kind: &str) -> u64 {
        self.rejections.with_label_values(&[kind]).get()
    }

    /// Prometheus text exposition of every metric
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!("Failed to encode metrics: {}", e);
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();
        assert_eq!(metrics.entries_posted.get(), 0);
        assert_eq!(metrics.allocations.get(), 0);
    }

    #[test]
    fn test_two_collectors_do_not_collide() {
        let first = Metrics::new().unwrap();
        let second = Metrics::new().unwrap();
        first.entries_posted.inc();
        assert_eq!(first.entries_posted.get(), 1);
        assert_eq!(second.entries_posted.get(), 0);
    }

    #[test]
    fn test_rejections_by_kind() {
        let metrics = Metrics::new().unwrap();
        let result: crate::Result<()> = Err(Error::DuplicateOperation { key: "k".into() });
        assert!(metrics.observe(result).is_err());
        assert_eq!(metrics.rejections_of("duplicate_operation"), 1);
        assert!(metrics.render().contains("integrity_rejections_total"));
    }
}
