//! Blackboard: the API agents use to share who is working on what and what they found.
//!
//! Every mutation is recorded in the event log; every read replays it. Nothing
//! here keeps authoritative in-memory state, so a new instance on the same
//! root sees everything any earlier (possibly dead) instance acknowledged.

use crate::core::claims::{Claim, ClaimChain};
use crate::core::config::BoardConfig;
use crate::core::error::BoardError;
use crate::core::events::{EventLog, IncrementalReplayer};
use crate::core::fold::{Agent, BoardState, Event, Finding, FindingType, Mutation, ReplayReport};
use crate::core::store::Store;
use crate::core::time;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

/// Receives every event this instance commits, after it is durable.
///
/// This is the push seam for dashboards and other viewers. Observers only see
/// this process's writes; cross-process viewers poll [`EventLog::events_since`].
pub trait BoardObserver: Send + Sync {
    fn on_event(&self, event: &Event);
}

pub struct Blackboard {
    log: EventLog,
    claims: ClaimChain,
    cache: Mutex<IncrementalReplayer>,
    observers: Vec<Arc<dyn BoardObserver>>,
}

impl Blackboard {
    pub fn new(store: Store, config: BoardConfig) -> Self {
        let log = EventLog::new(store.clone(), config.clone());
        let cache = Mutex::new(log.incremental());
        Self {
            log,
            claims: ClaimChain::new(store, config),
            cache,
            observers: Vec::new(),
        }
    }

    /// Opens the blackboard rooted at `root`, reading `agentboard.toml` and env overrides.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, BoardError> {
        let store = Store::new(root);
        let config = BoardConfig::load(&store)?;
        Ok(Self::new(store, config))
    }

    pub fn store(&self) -> &Store {
        self.log.store()
    }

    pub fn event_log(&self) -> &EventLog {
        &self.log
    }

    pub fn claims(&self) -> &ClaimChain {
        &self.claims
    }

    pub fn add_observer(&mut self, observer: Arc<dyn BoardObserver>) {
        self.observers.push(observer);
    }

    /// Records that `agent_id` works on `task`. Re-registering updates the task.
    ///
    /// Needs no claim: the append is atomic, so concurrent registrations of the
    /// same id are ordered by `seq` and the last one wins.
    pub fn register_agent(&self, agent_id: &str, task: &str) -> Result<Event, BoardError> {
        require_non_empty("agent id", agent_id)?;
        let mutation = Mutation::RegisterAgent {
            agent_id: agent_id.to_string(),
            task: task.to_string(),
            at: time::now_epoch_z(),
        };
        let ev = self.record(&mutation)?;
        info!(agent = agent_id, seq = ev.seq, "agent registered");
        Ok(ev)
    }

    /// Posts a finding. The agent does not have to be registered (yet).
    pub fn add_finding(
        &self,
        agent_id: &str,
        finding_type: impl Into<FindingType>,
        content: &str,
    ) -> Result<Event, BoardError> {
        require_non_empty("agent id", agent_id)?;
        require_non_empty("finding content", content)?;
        let mutation = Mutation::AddFinding {
            agent_id: agent_id.to_string(),
            finding_type: finding_type.into(),
            content: content.to_string(),
            at: time::now_epoch_z(),
        };
        let ev = self.record(&mutation)?;
        info!(agent = agent_id, seq = ev.seq, "finding added");
        Ok(ev)
    }

    /// Current `{agents, findings}` replayed from storage. Empty for a never-written root.
    pub fn get_full_state(&self) -> Result<BoardState, BoardError> {
        self.log.get_current_state()
    }

    /// Same view as [`Self::get_full_state`], served from an incremental cache
    /// that re-reads only what was appended since the last call.
    pub fn cached_state(&self) -> Result<BoardState, BoardError> {
        let mut cache = self
            .cache
            .lock()
            .map_err(|_| BoardError::ValidationError("state cache lock poisoned".into()))?;
        cache.state()
    }

    pub fn replay_report(&self) -> Result<ReplayReport, BoardError> {
        self.log.replay()
    }

    pub fn agent(&self, agent_id: &str) -> Result<Option<Agent>, BoardError> {
        Ok(self.get_full_state()?.agents.remove(agent_id))
    }

    pub fn findings_for(&self, agent_id: &str) -> Result<Vec<Finding>, BoardError> {
        Ok(self
            .get_full_state()?
            .findings_for(agent_id)
            .cloned()
            .collect())
    }

    /// Exclusive claim on an arbitrary shared resource for `agent_id`.
    pub fn claim_resource(
        &self,
        resource_key: &str,
        agent_id: &str,
        timeout: Duration,
    ) -> Result<Claim, BoardError> {
        self.claims.claim(resource_key, agent_id, timeout)
    }

    pub fn release_resource(&self, resource_key: &str, agent_id: &str) -> Result<bool, BoardError> {
        self.claims.release(resource_key, agent_id)
    }

    fn record(&self, mutation: &Mutation) -> Result<Event, BoardError> {
        let ev = self.log.append_with_ts(
            mutation.agent_id(),
            mutation.event_type(),
            mutation.payload(),
            Some(mutation.at().to_string()),
        )?;
        self.notify(&ev);
        Ok(ev)
    }

    fn notify(&self, ev: &Event) {
        for observer in &self.observers {
            if catch_unwind(AssertUnwindSafe(|| observer.on_event(ev))).is_err() {
                warn!(seq = ev.seq, event_type = %ev.event_type, "board observer panicked");
            }
        }
    }
}

/// Holder identity for claims taken on behalf of a single operation.
///
/// Distinct from the bare agent id so that an operation never renews (and then
/// releases) a claim the agent took explicitly, and two concurrent operations
/// for the same agent still exclude each other.
pub(crate) fn operation_holder(agent_id: &str) -> String {
    format!("{}/op-{}", agent_id, time::new_event_id())
}

pub(crate) fn require_non_empty(what: &str, value: &str) -> Result<(), BoardError> {
    if value.trim().is_empty() {
        return Err(BoardError::ValidationError(format!("{} must not be empty", what)));
    }
    Ok(())
}

pub fn schema() -> serde_json::Value {
    serde_json::json!({
        "name": "blackboard",
        "version": "0.1.0",
        "description": "Shared agent registry and findings, event-sourced",
        "commands": [
            { "name": "register", "parameters": ["agent", "task"] },
            { "name": "finding", "parameters": ["agent", "type", "content"] },
            { "name": "state", "parameters": ["cached"] },
            { "name": "events", "parameters": ["since"] },
            { "name": "claim", "parameters": ["resource", "agent", "timeout_ms"] },
            { "name": "release", "parameters": ["resource", "agent"] },
            { "name": "claims", "parameters": [] },
            { "name": "reap", "parameters": [] }
        ],
        "storage": ["events.jsonl", "events.lock", "claims/"]
    })
}
