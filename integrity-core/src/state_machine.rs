//! State machine engine
//!
//! Legal transitions are data: a table of `(from, to, trigger)` tuples per
//! entity kind, plus a terminal set and a set of emergency exits reachable
//! from any non-terminal state. Tables can be loaded from TOML and added at
//! runtime; call sites stay typed through [`WorkflowState`].
//!
//! The current state of every entity lives in one row that is locked while
//! the transition is validated and written, so two concurrent transitions
//! cannot both validate against the same stale `from`.

use crate::{
    events::{EngineEvent, Outbox},
    storage::{cf, keys, Storage, WriteTxn},
    types::{ActorRef, SnapshotId},
    Error, Result,
};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Trigger recorded for an emergency-exit transition
pub const EMERGENCY_EXIT_TRIGGER: &str = "emergency_exit";

/// One legal `(from, to, trigger)` tuple
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRule {
    /// Source state
    pub from: String,
    /// Target state
    pub to: String,
    /// Business trigger recorded with the transition
    pub trigger: String,
}

/// Legal-transition table for one entity kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionTable {
    /// Entity kind
    pub kind: String,
    /// State new entities start in
    pub initial: String,
    /// States that accept no transition at all
    #[serde(default)]
    pub terminal: BTreeSet<String>,
    /// States reachable from any non-terminal state
    #[serde(default)]
    pub emergency_exits: BTreeSet<String>,
    /// Ordinary transitions
    #[serde(default)]
    pub transitions: Vec<TransitionRule>,
}

#[derive(Debug, Deserialize)]
struct TableFile {
    #[serde(default)]
    table: Vec<TransitionTable>,
}

impl TransitionTable {
    /// Empty table
    pub fn new(kind: &str, initial: &str) -> Self {
        Self {
            kind: kind.to_string(),
            initial: initial.to_string(),
            terminal: BTreeSet::new(),
            emergency_exits: BTreeSet::new(),
            transitions: Vec::new(),
        }
    }

    /// Add a legal transition
    pub fn allow(mut self, from: &str, to: &str, trigger: &str) -> Self {
        self.transitions.push(TransitionRule {
            from: from.to_string(),
            to: to.to_string(),
            trigger: trigger.to_string(),
        });
        self
    }

    /// Mark states terminal
    pub fn terminal(mut self, states: &[&str]) -> Self {
        self.terminal.extend(states.iter().map(|s| s.to_string()));
        self
    }

    /// Mark states as emergency exits
    pub fn emergency_exits(mut self, states: &[&str]) -> Self {
        self.emergency_exits.extend(states.iter().map(|s| s.to_string()));
        self
    }

    /// Built-in investment status table
    pub fn investment() -> Self {
        Self::new(InvestmentStatus::KIND, "pending")
            .allow("pending", "processing", "start")
            .allow("pending", "cancelled", "cancel")
            .allow("processing", "completed", "settle")
            .allow("processing", "failed", "reject")
            .allow("failed", "pending", "retry")
            .terminal(&["completed", "cancelled"])
    }

    /// Built-in investor journey table
    pub fn journey() -> Self {
        Self::new(JourneyState::KIND, "initiated")
            .allow("initiated", "viewing", "view")
            .allow("viewing", "acknowledging", "acknowledge")
            .allow("acknowledging", "reviewing", "review")
            .allow("reviewing", "confirming", "confirm")
            .allow("confirming", "processing", "pay")
            .allow("processing", "invested", "settle")
            .terminal(&["invested", "blocked", "abandoned"])
            .emergency_exits(&["blocked", "abandoned"])
    }

    /// Every state the table mentions
    pub fn states(&self) -> BTreeSet<String> {
        let mut states: BTreeSet<String> = self
            .transitions
            .iter()
            .flat_map(|r| [r.from.clone(), r.to.clone()])
            .collect();
        states.insert(self.initial.clone());
        states.extend(self.terminal.iter().cloned());
        states.extend(self.emergency_exits.iter().cloned());
        states
    }

    /// Whether `state` accepts no transitions
    pub fn is_terminal(&self, state: &str) -> bool {
        self.terminal.contains(state)
    }

    /// Trigger of the legal `from -> to` transition, or why it is illegal
    pub fn check(&self, from: &str, to: &str) -> std::result::Result<&str, String> {
        if self.is_terminal(from) {
            return Err(format!("{} is terminal", from));
        }
        if let Some(rule) = self.transitions.iter().find(|r| r.from == from && r.to == to) {
            return Ok(rule.trigger.as_str());
        }
        if self.emergency_exits.contains(to) {
            return Ok(EMERGENCY_EXIT_TRIGGER);
        }
        Err(format!("{} -> {} is not in the {} table", from, to, self.kind))
    }

    /// Reject tables that could strand or resurrect entities
    pub fn validate(&self) -> Result<()> {
        if self.kind.trim().is_empty() {
            return Err(Error::Config("transition table without kind".to_string()));
        }
        if self.is_terminal(&self.initial) {
            return Err(Error::Config(format!("{}: initial state is terminal", self.kind)));
        }
        if let Some(rule) = self.transitions.iter().find(|r| self.is_terminal(&r.from)) {
            return Err(Error::Config(format!(
                "{}: transition out of terminal state {}",
                self.kind, rule.from
            )));
        }
        Ok(())
    }

    /// Parse `[[table]]` entries from TOML
    pub fn from_toml(content: &str) -> Result<Vec<TransitionTable>> {
        let file: TableFile = toml::from_str(content)
            .map_err(|e| Error::Config(format!("Failed to parse transition tables: {}", e)))?;
        for table in &file.table {
            table.validate()?;
        }
        Ok(file.table)
    }
}

/// Transition tables by entity kind
#[derive(Debug, Default)]
pub struct TransitionRegistry {
    tables: RwLock<HashMap<String, Arc<TransitionTable>>>,
}

impl TransitionRegistry {
    /// Registry with the investment and journey tables
    pub fn with_builtin() -> Self {
        let registry = Self::default();
        {
            let mut tables = registry.tables.write();
            for table in [TransitionTable::investment(), TransitionTable::journey()] {
                tables.insert(table.kind.clone(), Arc::new(table));
            }
        }
        registry
    }

    /// Add or replace a table
    pub fn register(&self, table: TransitionTable) -> Result<()> {
        table.validate()?;
        info!(kind = %table.kind, rules = table.transitions.len(), "Transition table registered");
        self.tables.write().insert(table.kind.clone(), Arc::new(table));
        Ok(())
    }

    /// Load tables from a TOML file; returns how many were registered
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<usize> {
        let content = std::fs::read_to_string(path)?;
        let tables = TransitionTable::from_toml(&content)?;
        let count = tables.len();
        for table in tables {
            self.register(table)?;
        }
        Ok(count)
    }

    /// Table for a kind
    pub fn table(&self, kind: &str) -> Result<Arc<TransitionTable>> {
        self.tables
            .read()
            .get(kind)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("transition table {}", kind)))
    }
}

/// Typed view of a table-driven state
pub trait WorkflowState: Copy + Sized {
    /// Entity kind the table is registered under
    const KIND: &'static str;

    /// Name used in the table
    fn as_str(&self) -> &'static str;

    /// Parse a table name
    fn parse(state: &str) -> Option<Self>;
}

/// Investment status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InvestmentStatus {
    /// Created, not started
    Pending,
    /// Purchase running
    Processing,
    /// Purchase committed
    Completed,
    /// Purchase rejected; may be retried
    Failed,
    /// Abandoned before starting
    Cancelled,
}

impl WorkflowState for InvestmentStatus {
    const KIND: &'static str = "investment";

    fn as_str(&self) -> &'static str {
        match self {
            InvestmentStatus::Pending => "pending",
            InvestmentStatus::Processing => "processing",
            InvestmentStatus::Completed => "completed",
            InvestmentStatus::Failed => "failed",
            InvestmentStatus::Cancelled => "cancelled",
        }
    }

    fn parse(state: &str) -> Option<Self> {
        match state {
            "pending" => Some(InvestmentStatus::Pending),
            "processing" => Some(InvestmentStatus::Processing),
            "completed" => Some(InvestmentStatus::Completed),
            "failed" => Some(InvestmentStatus::Failed),
            "cancelled" => Some(InvestmentStatus::Cancelled),
            _ => None,
        }
    }
}

/// Investor journey step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JourneyState {
    /// Journey opened
    Initiated,
    /// Viewing the offering
    Viewing,
    /// Acknowledging risk and terms
    Acknowledging,
    /// Reviewing the order
    Reviewing,
    /// Confirming the order
    Confirming,
    /// Payment and allocation running
    Processing,
    /// Shares allocated
    Invested,
    /// Stopped by the platform
    Blocked,
    /// Left by the investor
    Abandoned,
}

impl WorkflowState for JourneyState {
    const KIND: &'static str = "journey";

    fn as_str(&self) -> &'static str {
        match self {
            JourneyState::Initiated => "initiated",
            JourneyState::Viewing => "viewing",
            JourneyState::Acknowledging => "acknowledging",
            JourneyState::Reviewing => "reviewing",
            JourneyState::Confirming => "confirming",
            JourneyState::Processing => "processing",
            JourneyState::Invested => "invested",
            JourneyState::Blocked => "blocked",
            JourneyState::Abandoned => "abandoned",
        }
    }

    fn parse(state: &str) -> Option<Self> {
        match state {
            "initiated" => Some(JourneyState::Initiated),
            "viewing" => Some(JourneyState::Viewing),
            "acknowledging" => Some(JourneyState::Acknowledging),
            "reviewing" => Some(JourneyState::Reviewing),
            "confirming" => Some(JourneyState::Confirming),
            "processing" => Some(JourneyState::Processing),
            "invested" => Some(JourneyState::Invested),
            "blocked" => Some(JourneyState::Blocked),
            "abandoned" => Some(JourneyState::Abandoned),
            _ => None,
        }
    }
}

/// Current state of one entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityState {
    /// Entity kind
    pub kind: String,
    /// Entity id
    pub entity_id: String,
    /// Current state
    pub state: String,
    /// Number of transitions applied
    pub version: u64,
    /// Snapshot bound by the latest transition that carried one
    pub snapshot_id: Option<SnapshotId>,
    /// Last change
    pub updated_at: DateTime<Utc>,
}

impl EntityState {
    /// Typed state
    pub fn typed<S: WorkflowState>(&self) -> Result<S> {
        S::parse(&self.state).ok_or_else(|| {
            Error::InvariantViolation(format!(
                "{} {} holds unknown state {}",
                self.kind, self.entity_id, self.state
            ))
        })
    }
}

/// Transition log row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRecord {
    /// Entity kind
    pub kind: String,
    /// Entity id
    pub entity_id: String,
    /// Entity version after the transition
    pub version: u64,
    /// Previous state
    pub from: String,
    /// New state
    pub to: String,
    /// Trigger from the table
    pub trigger: String,
    /// Who caused it
    pub actor: ActorRef,
    /// Snapshot the transition was bound to
    pub snapshot_id: Option<SnapshotId>,
    /// Timestamp
    pub at: DateTime<Utc>,
}

/// One requested transition
#[derive(Debug, Clone)]
pub struct TransitionRequest<'a> {
    /// Entity kind
    pub kind: &'a str,
    /// Entity id
    pub entity_id: &'a str,
    /// State the caller believes the entity is in
    pub from: &'a str,
    /// Target state
    pub to: &'a str,
    /// Actor
    pub actor: &'a ActorRef,
    /// Snapshot to bind, if any
    pub snapshot_id: Option<SnapshotId>,
}

fn state_key(kind: &str, entity_id: &str) -> Result<Vec<u8>> {
    Ok(keys::join(&[&keys::text(kind)?, &keys::text(entity_id)?]))
}

/// State machine service
#[derive(Debug)]
pub struct StateMachine {
    storage: Arc<Storage>,
    registry: Arc<TransitionRegistry>,
    outbox: Outbox,
}

impl StateMachine {
    /// Create service
    pub fn new(storage: Arc<Storage>, registry: Arc<TransitionRegistry>, outbox: Outbox) -> Self {
        Self { storage, registry, outbox }
    }

    /// Registry
    pub fn registry(&self) -> &TransitionRegistry {
        &self.registry
    }

    /// Create an entity in its table's initial state
    pub fn create(&self, kind: &str, entity_id: &str) -> Result<EntityState> {
        let txn = self.storage.begin();
        let state = self.stage_create(&txn, kind, entity_id)?;
        txn.commit()?;
        Ok(state)
    }

    pub(crate) fn stage_create(&self, txn: &WriteTxn<'_>, kind: &str, entity_id: &str) -> Result<EntityState> {
        let table = self.registry.table(kind)?;
        let state = EntityState {
            kind: kind.to_string(),
            entity_id: entity_id.to_string(),
            state: table.initial.clone(),
            version: 0,
            snapshot_id: None,
            updated_at: Utc::now(),
        };
        txn.insert(cf::ENTITY_STATES, &state_key(kind, entity_id)?, &state)?;
        Ok(state)
    }

    /// Validate and apply one transition atomically
    pub fn transition(&self, request: TransitionRequest<'_>) -> Result<EntityState> {
        let mut events = Vec::new();
        let result: Result<EntityState> = (|| {
            let txn = self.storage.begin();
            let state = self.stage_transition(&txn, &request, &mut events)?;
            self.outbox.commit(txn, std::mem::take(&mut events))?;
            Ok(state)
        })();
        self.outbox.metrics().observe(result)
    }

    /// Typed transition
    pub fn transition_typed<S: WorkflowState>(
        &self,
        entity_id: &str,
        from: S,
        to: S,
        actor: &ActorRef,
        snapshot_id: Option<SnapshotId>,
    ) -> Result<EntityState> {
        self.transition(TransitionRequest {
            kind: S::KIND,
            entity_id,
            from: from.as_str(),
            to: to.as_str(),
            actor,
            snapshot_id,
        })
    }

    /// Lock the entity row for the rest of the unit and return it
    pub(crate) fn lock_state(&self, txn: &WriteTxn<'_>, kind: &str, entity_id: &str) -> Result<EntityState> {
        txn.lock(cf::ENTITY_STATES, &state_key(kind, entity_id)?)?
            .ok_or_else(|| Error::NotFound(format!("{} {}", kind, entity_id)))
    }

    pub(crate) fn stage_transition(
        &self,
        txn: &WriteTxn<'_>,
        request: &TransitionRequest<'_>,
        events: &mut Vec<EngineEvent>,
    ) -> Result<EntityState> {
        let table = self.registry.table(request.kind)?;
        let current = self.lock_state(txn, request.kind, request.entity_id)?;

        let illegal = |reason: String| Error::IllegalTransition {
            kind: request.kind.to_string(),
            entity_id: request.entity_id.to_string(),
            from: current.state.clone(),
            to: request.to.to_string(),
            reason,
        };

        if current.state != request.from {
            warn!(
                kind = request.kind,
                entity_id = request.entity_id,
                expected = request.from,
                actual = %current.state,
                "Stale transition refused"
            );
            return Err(illegal(format!("expected {}, entity is {}", request.from, current.state)));
        }
        let trigger = match table.check(&current.state, request.to) {
            Ok(trigger) => trigger.to_string(),
            Err(reason) => {
                warn!(
                    kind = request.kind,
                    entity_id = request.entity_id,
                    from = %current.state,
                    to = request.to,
                    %reason,
                    "Illegal transition refused"
                );
                return Err(illegal(reason));
            }
        };

        let now = Utc::now();
        let version = current.version + 1;
        let snapshot_id = request.snapshot_id.or(current.snapshot_id);
        let record = TransitionRecord {
            kind: request.kind.to_string(),
            entity_id: request.entity_id.to_string(),
            version,
            from: current.state.clone(),
            to: request.to.to_string(),
            trigger: trigger.clone(),
            actor: request.actor.clone(),
            snapshot_id: request.snapshot_id,
            at: now,
        };
        txn.insert(
            cf::TRANSITIONS,
            &keys::join(&[&state_key(request.kind, request.entity_id)?, &keys::seq(version)]),
            &record,
        )?;

        let next = EntityState {
            state: request.to.to_string(),
            version,
            snapshot_id,
            updated_at: now,
            ..current
        };
        txn.put(cf::ENTITY_STATES, &state_key(request.kind, request.entity_id)?, &next)?;

        info!(
            kind = request.kind,
            entity_id = request.entity_id,
            from = %record.from,
            to = %record.to,
            trigger = %trigger,
            "State transition staged"
        );
        events.push(EngineEvent::StateTransitioned {
            kind: record.kind,
            entity_id: record.entity_id,
            from: record.from,
            to: record.to,
            trigger,
        });
        Ok(next)
    }

    /// Current state
    pub fn current(&self, kind: &str, entity_id: &str) -> Result<EntityState> {
        self.storage.require(
            cf::ENTITY_STATES,
            &state_key(kind, entity_id)?,
            &format!("{} {}", kind, entity_id),
        )
    }

    /// Typed current state
    pub fn state_of<S: WorkflowState>(&self, entity_id: &str) -> Result<S> {
        self.current(S::KIND, entity_id)?.typed()
    }

    /// Transition log of one entity, oldest first
    pub fn history(&self, kind: &str, entity_id: &str) -> Result<Vec<TransitionRecord>> {
        Ok(self
            .storage
            .scan_prefix::<TransitionRecord>(cf::TRANSITIONS, &state_key(kind, entity_id)?)?
            .into_iter()
            .map(|(_, record)| record)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::open_store;

    fn machine() -> (StateMachine, tempfile::TempDir) {
        let (storage, outbox, temp) = open_store();
        let registry = Arc::new(TransitionRegistry::with_builtin());
        (StateMachine::new(storage, registry, outbox), temp)
    }

    #[test]
    fn test_table_lookup() {
        let table = TransitionTable::investment();
        assert_eq!(table.check("pending", "processing"), Ok("start"));
        assert_eq!(table.check("failed", "pending"), Ok("retry"));
        assert!(table.check("pending", "completed").is_err());
        assert!(table.check("completed", "completed").is_err());

        let journey = TransitionTable::journey();
        assert_eq!(journey.check("reviewing", "blocked"), Ok(EMERGENCY_EXIT_TRIGGER));
        assert!(journey.check("viewing", "reviewing").is_err());
        assert!(journey.check("abandoned", "blocked").is_err());
        assert!(journey.check("invested", "abandoned").is_err());
    }

    #[test]
    fn test_builtin_tables_are_valid() {
        assert!(TransitionTable::investment().validate().is_ok());
        assert!(TransitionTable::journey().validate().is_ok());
        assert_eq!(TransitionTable::journey().states().len(), 9);
    }

    #[test]
    fn test_transition_writes_state_and_log() {
        let (machine, _temp) = machine();
        let actor = ActorRef::system();
        machine.create(InvestmentStatus::KIND, "inv-1").unwrap();

        let state = machine
            .transition_typed("inv-1", InvestmentStatus::Pending, InvestmentStatus::Processing, &actor, None)
            .unwrap();
        assert_eq!(state.version, 1);
        assert_eq!(
            machine.state_of::<InvestmentStatus>("inv-1").unwrap(),
            InvestmentStatus::Processing
        );

        let history = machine.history(InvestmentStatus::KIND, "inv-1").unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].trigger, "start");
    }

    #[test]
    fn test_stale_and_illegal_transitions_rejected() {
        let (machine, _temp) = machine();
        let actor = ActorRef::system();
        machine.create(InvestmentStatus::KIND, "inv-2").unwrap();

        let skip = machine.transition_typed(
            "inv-2",
            InvestmentStatus::Pending,
            InvestmentStatus::Completed,
            &actor,
            None,
        );
        assert!(matches!(skip, Err(Error::IllegalTransition { .. })));

        let stale = machine.transition_typed(
            "inv-2",
            InvestmentStatus::Processing,
            InvestmentStatus::Completed,
            &actor,
            None,
        );
        assert!(matches!(stale, Err(Error::IllegalTransition { .. })));
        assert!(machine.history(InvestmentStatus::KIND, "inv-2").unwrap().is_empty());
    }

    #[test]
    fn test_terminal_rejects_noop() {
        let (machine, _temp) = machine();
        let actor = ActorRef::system();
        machine.create(InvestmentStatus::KIND, "inv-3").unwrap();
        machine
            .transition_typed("inv-3", InvestmentStatus::Pending, InvestmentStatus::Cancelled, &actor, None)
            .unwrap();

        let noop = machine.transition_typed(
            "inv-3",
            InvestmentStatus::Cancelled,
            InvestmentStatus::Cancelled,
            &actor,
            None,
        );
        assert!(matches!(noop, Err(Error::IllegalTransition { .. })));
    }

    #[test]
    fn test_emergency_exit_from_any_non_terminal() {
        let (machine, _temp) = machine();
        let actor = ActorRef::investor("i-1");
        machine.create(JourneyState::KIND, "j-1").unwrap();
        machine
            .transition_typed("j-1", JourneyState::Initiated, JourneyState::Viewing, &actor, None)
            .unwrap();
        let state = machine
            .transition_typed("j-1", JourneyState::Viewing, JourneyState::Abandoned, &actor, None)
            .unwrap();
        assert_eq!(state.state, "abandoned");

        let history = machine.history(JourneyState::KIND, "j-1").unwrap();
        assert_eq!(history.last().unwrap().trigger, EMERGENCY_EXIT_TRIGGER);
    }

    #[test]
    fn test_table_from_toml() {
        let tables = TransitionTable::from_toml(
            r#"
            [[table]]
            kind = "disclosure"
            initial = "draft"
            terminal = ["published", "withdrawn"]
            emergency_exits = ["withdrawn"]

            [[table.transitions]]
            from = "draft"
            to = "submitted"
            trigger = "submit"

            [[table.transitions]]
            from = "submitted"
            to = "published"
            trigger = "approve"
            "#,
        )
        .unwrap();
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].check("draft", "submitted"), Ok("submit"));
        assert_eq!(tables[0].check("submitted", "withdrawn"), Ok(EMERGENCY_EXIT_TRIGGER));

        let (machine, _temp) = machine();
        machine.registry().register(tables[0].clone()).unwrap();
        machine.create("disclosure", "d-1").unwrap();
        machine
            .transition(TransitionRequest {
                kind: "disclosure",
                entity_id: "d-1",
                from: "draft",
                to: "submitted",
                actor: &ActorRef::company_user("c-1"),
                snapshot_id: None,
            })
            .unwrap();
    }

    #[test]
    fn test_table_with_exit_from_terminal_rejected() {
        let bad = TransitionTable::new("x", "a").allow("b", "a", "revive").terminal(&["b"]);
        assert!(matches!(bad.validate(), Err(Error::Config(_))));
    }
}
