//! Investor journey
//!
//! The journey walks `initiated → viewing → acknowledging → reviewing →
//! confirming → processing → invested`, one step at a time, with `blocked`
//! and `abandoned` reachable from any non-terminal step. The step itself
//! lives in the state machine; this module keeps the journey record (the
//! acknowledgements and the bound snapshot) and the guards that need it:
//!
//! - `acknowledging → reviewing` needs both acknowledgements and a bound
//!   snapshot;
//! - `confirming → processing` needs the bound snapshot to still be current
//!   and to accept purchases.
//!
//! Every step locks the journey row before the state row. Only the journey's
//! investor may take a step; `block` is reserved to admins and the system.

use crate::{
    events::{EngineEvent, Outbox},
    governance::Governance,
    state_machine::{EntityState, JourneyState, StateMachine, TransitionRecord, TransitionRequest, WorkflowState},
    storage::{cf, Storage, WriteTxn},
    types::{ActorKind, ActorRef, CompanyId, InvestmentId, JourneyId, SnapshotId},
    Error, Result,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, warn};

/// Acknowledgement an investor must give before reviewing an order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AcknowledgementKind {
    /// Investment risk disclosure
    Risk,
    /// Terms of the offering
    Terms,
}

/// Journey record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Journey {
    /// Journey ID
    pub id: JourneyId,
    /// Investor walking the journey
    pub investor: ActorRef,
    /// Company being invested in
    pub company_id: CompanyId,
    /// Snapshot bound at acknowledgement
    pub snapshot_id: Option<SnapshotId>,
    /// Acknowledgements given
    pub acknowledgements: BTreeSet<AcknowledgementKind>,
    /// Investment created at confirmation
    pub investment_id: Option<InvestmentId>,
    /// Timestamp
    pub created_at: DateTime<Utc>,
}

impl Journey {
    /// Whether both acknowledgements were given
    pub fn fully_acknowledged(&self) -> bool {
        self.acknowledgements.contains(&AcknowledgementKind::Risk)
            && self.acknowledgements.contains(&AcknowledgementKind::Terms)
    }
}

fn refused(journey_id: JourneyId, from: JourneyState, to: JourneyState, reason: impl Into<String>) -> Error {
    Error::IllegalTransition {
        kind: JourneyState::KIND.to_string(),
        entity_id: journey_id.to_string(),
        from: from.as_str().to_string(),
        to: to.as_str().to_string(),
        reason: reason.into(),
    }
}

/// Journey service
#[derive(Debug)]
pub struct Journeys {
    storage: Arc<Storage>,
    machine: Arc<StateMachine>,
    governance: Arc<Governance>,
    outbox: Outbox,
}

impl Journeys {
    /// Create service
    pub fn new(
        storage: Arc<Storage>,
        machine: Arc<StateMachine>,
        governance: Arc<Governance>,
        outbox: Outbox,
    ) -> Self {
        Self { storage, machine, governance, outbox }
    }

    fn run<T, F>(&self, journey_id: JourneyId, op: &str, stage: F) -> Result<T>
    where
        F: FnOnce(&WriteTxn<'_>, &mut Vec<EngineEvent>) -> Result<T>,
    {
        let mut events = Vec::new();
        let result: Result<T> = (|| {
            let txn = self.storage.begin();
            let value = stage(&txn, &mut events)?;
            self.outbox.commit(txn, std::mem::take(&mut events))?;
            Ok(value)
        })();

        match self.outbox.metrics().observe(result) {
            Ok(value) => {
                info!(journey_id = %journey_id, op, "Journey updated");
                Ok(value)
            }
            Err(e) => {
                warn!(journey_id = %journey_id, op, error = %e, "Journey step refused");
                Err(e)
            }
        }
    }

    /// Open a journey for an investor
    pub fn start_journey(&self, investor: ActorRef, company_id: CompanyId) -> Result<Journey> {
        let journey = Journey {
            id: JourneyId::new(),
            investor,
            company_id,
            snapshot_id: None,
            acknowledgements: BTreeSet::new(),
            investment_id: None,
            created_at: Utc::now(),
        };
        self.run(journey.id, "start", |txn, _| {
            if journey.investor.kind != ActorKind::Investor {
                return Err(Error::InvalidRequest(format!(
                    "{} cannot open an investor journey",
                    journey.investor
                )));
            }
            txn.insert(cf::JOURNEYS, journey.id.as_bytes(), &journey)?;
            self.machine.stage_create(txn, JourneyState::KIND, &journey.id.to_string())?;
            Ok(journey.clone())
        })
    }

    /// Get journey record
    pub fn journey(&self, journey_id: JourneyId) -> Result<Journey> {
        self.storage
            .require(cf::JOURNEYS, journey_id.as_bytes(), &format!("journey {}", journey_id))
    }

    /// Current step
    pub fn state(&self, journey_id: JourneyId) -> Result<JourneyState> {
        self.machine.state_of(&journey_id.to_string())
    }

    /// Transition history
    pub fn history(&self, journey_id: JourneyId) -> Result<Vec<TransitionRecord>> {
        self.machine.history(JourneyState::KIND, &journey_id.to_string())
    }

    /// `initiated → viewing`
    pub fn view(&self, journey_id: JourneyId, actor: &ActorRef) -> Result<EntityState> {
        self.run(journey_id, "view", |txn, events| {
            self.lock_for_investor(txn, journey_id, actor)?;
            self.stage_step(txn, journey_id, JourneyState::Initiated, JourneyState::Viewing, actor, None, events)
        })
    }

    /// `viewing → acknowledging`
    pub fn begin_acknowledgement(&self, journey_id: JourneyId, actor: &ActorRef) -> Result<EntityState> {
        self.run(journey_id, "begin_acknowledgement", |txn, events| {
            self.lock_for_investor(txn, journey_id, actor)?;
            self.stage_step(
                txn,
                journey_id,
                JourneyState::Viewing,
                JourneyState::Acknowledging,
                actor,
                None,
                events,
            )
        })
    }

    /// Record an acknowledgement and bind the snapshot it was given under
    pub fn acknowledge(
        &self,
        journey_id: JourneyId,
        kind: AcknowledgementKind,
        snapshot_id: SnapshotId,
        actor: &ActorRef,
    ) -> Result<Journey> {
        self.run(journey_id, "acknowledge", |txn, _| {
            self.lock_for_investor(txn, journey_id, actor)?;
            let state = self.machine.lock_state(txn, JourneyState::KIND, &journey_id.to_string())?;
            if state.typed::<JourneyState>()? != JourneyState::Acknowledging {
                return Err(Error::InvalidRequest(format!(
                    "journey {} is {}, not acknowledging",
                    journey_id, state.state
                )));
            }

            let mut journey = self.governance.stage_bind_to_journey(txn, journey_id, snapshot_id)?;
            journey.acknowledgements.insert(kind);
            txn.put(cf::JOURNEYS, journey_id.as_bytes(), &journey)?;
            Ok(journey)
        })
    }

    /// `acknowledging → reviewing`, once both acknowledgements are in
    pub fn review(&self, journey_id: JourneyId, actor: &ActorRef) -> Result<EntityState> {
        self.run(journey_id, "review", |txn, events| {
            let journey = self.lock_for_investor(txn, journey_id, actor)?;
            let (from, to) = (JourneyState::Acknowledging, JourneyState::Reviewing);
            if !journey.fully_acknowledged() {
                return Err(refused(journey_id, from, to, "risk and terms must both be acknowledged"));
            }
            let snapshot_id = journey
                .snapshot_id
                .ok_or_else(|| refused(journey_id, from, to, "no snapshot bound"))?;
            self.stage_step(txn, journey_id, from, to, actor, Some(snapshot_id), events)
        })
    }

    /// `reviewing → confirming`
    pub fn confirm(&self, journey_id: JourneyId, actor: &ActorRef) -> Result<EntityState> {
        self.run(journey_id, "confirm", |txn, events| {
            self.lock_for_investor(txn, journey_id, actor)?;
            self.stage_step(
                txn,
                journey_id,
                JourneyState::Reviewing,
                JourneyState::Confirming,
                actor,
                None,
                events,
            )
        })
    }

    /// Emergency exit: the platform stops the journey
    pub fn block(&self, journey_id: JourneyId, actor: &ActorRef) -> Result<EntityState> {
        self.run(journey_id, "block", |txn, events| {
            self.lock_journey(txn, journey_id)?;
            if !matches!(actor.kind, ActorKind::PlatformAdmin | ActorKind::System) {
                return Err(Error::InvalidRequest(format!("{} cannot block a journey", actor)));
            }
            self.stage_exit(txn, journey_id, JourneyState::Blocked, actor, events)
        })
    }

    /// Emergency exit: the investor leaves
    pub fn abandon(&self, journey_id: JourneyId, actor: &ActorRef) -> Result<EntityState> {
        self.run(journey_id, "abandon", |txn, events| {
            self.lock_for_investor(txn, journey_id, actor)?;
            self.stage_exit(txn, journey_id, JourneyState::Abandoned, actor, events)
        })
    }

    fn stage_exit(
        &self,
        txn: &WriteTxn<'_>,
        journey_id: JourneyId,
        to: JourneyState,
        actor: &ActorRef,
        events: &mut Vec<EngineEvent>,
    ) -> Result<EntityState> {
        let entity_id = journey_id.to_string();
        let current = self.machine.lock_state(txn, JourneyState::KIND, &entity_id)?;
        self.machine.stage_transition(
            txn,
            &TransitionRequest {
                kind: JourneyState::KIND,
                entity_id: &entity_id,
                from: &current.state,
                to: to.as_str(),
                actor,
                snapshot_id: None,
            },
            events,
        )
    }

    /// `confirming → processing` for a purchase of `investment_id`
    pub(crate) fn stage_begin_processing(
        &self,
        txn: &WriteTxn<'_>,
        journey_id: JourneyId,
        investment_id: InvestmentId,
        actor: &ActorRef,
        events: &mut Vec<EngineEvent>,
    ) -> Result<Journey> {
        let mut journey = self.lock_for_investor(txn, journey_id, actor)?;
        let (from, to) = (JourneyState::Confirming, JourneyState::Processing);
        let snapshot_id = journey
            .snapshot_id
            .ok_or_else(|| refused(journey_id, from, to, "no snapshot bound"))?;
        let snapshot = self
            .governance
            .stage_require_current(txn, snapshot_id)
            .map_err(|e| refused(journey_id, from, to, e.to_string()))?;
        if !snapshot.facts.accepts_purchases() {
            return Err(refused(
                journey_id,
                from,
                to,
                format!("snapshot {} does not accept purchases", snapshot_id),
            ));
        }

        self.stage_step(txn, journey_id, from, to, actor, Some(snapshot_id), events)?;
        journey.investment_id = Some(investment_id);
        txn.put(cf::JOURNEYS, journey_id.as_bytes(), &journey)?;
        Ok(journey)
    }

    /// `processing → invested`
    pub(crate) fn stage_settle(
        &self,
        txn: &WriteTxn<'_>,
        journey_id: JourneyId,
        actor: &ActorRef,
        events: &mut Vec<EngineEvent>,
    ) -> Result<EntityState> {
        self.lock_for_investor(txn, journey_id, actor)?;
        self.stage_step(
            txn,
            journey_id,
            JourneyState::Processing,
            JourneyState::Invested,
            actor,
            None,
            events,
        )
    }

    pub(crate) fn lock_journey(&self, txn: &WriteTxn<'_>, journey_id: JourneyId) -> Result<Journey> {
        txn.lock(cf::JOURNEYS, journey_id.as_bytes())?
            .ok_or_else(|| Error::NotFound(format!("journey {}", journey_id)))
    }

    /// Journey row, locked before its state row, for a step only its investor may take
    fn lock_for_investor(&self, txn: &WriteTxn<'_>, journey_id: JourneyId, actor: &ActorRef) -> Result<Journey> {
        let journey = self.lock_journey(txn, journey_id)?;
        if *actor != journey.investor {
            return Err(Error::InvalidRequest(format!(
                "{} cannot act on journey of {}",
                actor, journey.investor
            )));
        }
        Ok(journey)
    }

    #[allow(clippy::too_many_arguments)]
    fn stage_step(
        &self,
        txn: &WriteTxn<'_>,
        journey_id: JourneyId,
        from: JourneyState,
        to: JourneyState,
        actor: &ActorRef,
        snapshot_id: Option<SnapshotId>,
        events: &mut Vec<EngineEvent>,
    ) -> Result<EntityState> {
        self.machine.stage_transition(
            txn,
            &TransitionRequest {
                kind: JourneyState::KIND,
                entity_id: &journey_id.to_string(),
                from: from.as_str(),
                to: to.as_str(),
                actor,
                snapshot_id,
            },
            events,
        )
    }
}
