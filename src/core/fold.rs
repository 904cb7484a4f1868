//! Event model and the deterministic fold from events to board state.
//!
//! Every logical change is a [`Mutation`]. A mutation is recorded as an
//! [`Event`] (tag + JSON payload) and folded back through a [`FoldRegistry`].
//! The legacy snapshot writer applies the same [`Mutation::apply`], so both
//! representations share one transition function.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

pub const AGENT_REGISTERED: &str = "agent.registered";
pub const FINDING_ADDED: &str = "finding.added";

/// One immutable, sequenced record of the event log.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Event {
    pub seq: u64,
    pub event_id: String,
    pub event_type: String,
    pub ts: String,
    pub ts_ms: u64,
    pub actor: String,
    pub payload: JsonValue,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Agent {
    pub agent_id: String,
    pub task: String,
    pub registered_at: String,
    pub updated_at: String,
}

/// Kind of observation an agent posts. Unknown tags are preserved verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FindingType {
    Fact,
    Hypothesis,
    Question,
    Decision,
    Warning,
    Other(String),
}

impl FindingType {
    pub fn as_str(&self) -> &str {
        match self {
            FindingType::Fact => "fact",
            FindingType::Hypothesis => "hypothesis",
            FindingType::Question => "question",
            FindingType::Decision => "decision",
            FindingType::Warning => "warning",
            FindingType::Other(tag) => tag,
        }
    }
}

impl From<String> for FindingType {
    fn from(raw: String) -> Self {
        let normalized = raw.trim().to_lowercase();
        match normalized.as_str() {
            "fact" => FindingType::Fact,
            "hypothesis" => FindingType::Hypothesis,
            "question" => FindingType::Question,
            "decision" => FindingType::Decision,
            "warning" => FindingType::Warning,
            _ => FindingType::Other(raw),
        }
    }
}

impl From<&str> for FindingType {
    fn from(raw: &str) -> Self {
        FindingType::from(raw.to_string())
    }
}

impl From<FindingType> for String {
    fn from(kind: FindingType) -> Self {
        kind.as_str().to_string()
    }
}

impl FromStr for FindingType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(FindingType::from(s))
    }
}

impl fmt::Display for FindingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    pub agent_id: String,
    pub finding_type: FindingType,
    pub content: String,
    pub created_at: String,
}

/// Derived view of the board. Never authoritative; always rebuildable from the log.
///
/// `agents` is a sorted map so serialization (and therefore digests) is stable.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct BoardState {
    pub agents: BTreeMap<String, Agent>,
    pub findings: Vec<Finding>,
}

impl BoardState {
    pub fn is_empty(&self) -> bool {
        self.agents.is_empty() && self.findings.is_empty()
    }

    pub fn findings_for<'a>(&'a self, agent_id: &'a str) -> impl Iterator<Item = &'a Finding> {
        self.findings.iter().filter(move |f| f.agent_id == agent_id)
    }
}

/// A logical change to the board, independent of how it is persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    RegisterAgent {
        agent_id: String,
        task: String,
        at: String,
    },
    AddFinding {
        agent_id: String,
        finding_type: FindingType,
        content: String,
        at: String,
    },
}

impl Mutation {
    pub fn event_type(&self) -> &'static str {
        match self {
            Mutation::RegisterAgent { .. } => AGENT_REGISTERED,
            Mutation::AddFinding { .. } => FINDING_ADDED,
        }
    }

    pub fn agent_id(&self) -> &str {
        match self {
            Mutation::RegisterAgent { agent_id, .. } | Mutation::AddFinding { agent_id, .. } => {
                agent_id
            }
        }
    }

    pub fn at(&self) -> &str {
        match self {
            Mutation::RegisterAgent { at, .. } | Mutation::AddFinding { at, .. } => at,
        }
    }

    pub fn payload(&self) -> JsonValue {
        match self {
            Mutation::RegisterAgent { agent_id, task, .. } => serde_json::json!({
                "agent_id": agent_id,
                "task": task,
            }),
            Mutation::AddFinding {
                agent_id,
                finding_type,
                content,
                ..
            } => serde_json::json!({
                "agent_id": agent_id,
                "finding_type": finding_type.as_str(),
                "content": content,
            }),
        }
    }

    /// Rebuilds the mutation an event recorded. `at` comes from the event envelope.
    pub fn from_event(ev: &Event) -> Result<Self, String> {
        let field = |name: &str| -> Result<String, String> {
            ev.payload
                .get(name)
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
                .ok_or_else(|| format!("{} missing string field '{}'", ev.event_type, name))
        };
        match ev.event_type.as_str() {
            AGENT_REGISTERED => Ok(Mutation::RegisterAgent {
                agent_id: field("agent_id")?,
                task: field("task")?,
                at: ev.ts.clone(),
            }),
            FINDING_ADDED => Ok(Mutation::AddFinding {
                agent_id: field("agent_id")?,
                finding_type: FindingType::from(field("finding_type")?),
                content: field("content")?,
                at: ev.ts.clone(),
            }),
            other => Err(format!("no mutation for event type '{}'", other)),
        }
    }

    pub fn apply(&self, state: &mut BoardState) {
        match self {
            Mutation::RegisterAgent { agent_id, task, at } => {
                state
                    .agents
                    .entry(agent_id.clone())
                    .and_modify(|agent| {
                        agent.task = task.clone();
                        agent.updated_at = at.clone();
                    })
                    .or_insert_with(|| Agent {
                        agent_id: agent_id.clone(),
                        task: task.clone(),
                        registered_at: at.clone(),
                        updated_at: at.clone(),
                    });
            }
            Mutation::AddFinding {
                agent_id,
                finding_type,
                content,
                at,
            } => state.findings.push(Finding {
                agent_id: agent_id.clone(),
                finding_type: finding_type.clone(),
                content: content.clone(),
                created_at: at.clone(),
            }),
        }
    }
}

/// Fold step for one event type. An `Err` drops only that event's effect.
pub type FoldFn = fn(&mut BoardState, &Event) -> Result<(), String>;

fn fold_mutation(state: &mut BoardState, ev: &Event) -> Result<(), String> {
    Mutation::from_event(ev)?.apply(state);
    Ok(())
}

/// Outcome of folding one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FoldOutcome {
    Applied,
    Unknown,
    Rejected(String),
}

/// Maps event type to fold function. Types without an entry are ignored.
#[derive(Clone)]
pub struct FoldRegistry {
    handlers: HashMap<String, FoldFn>,
}

impl Default for FoldRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(AGENT_REGISTERED, fold_mutation);
        registry.register(FINDING_ADDED, fold_mutation);
        registry
    }
}

impl FoldRegistry {
    pub fn empty() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn register(&mut self, event_type: &str, handler: FoldFn) {
        self.handlers.insert(event_type.to_string(), handler);
    }

    pub fn knows(&self, event_type: &str) -> bool {
        self.handlers.contains_key(event_type)
    }

    pub fn apply(&self, state: &mut BoardState, ev: &Event) -> FoldOutcome {
        match self.handlers.get(&ev.event_type) {
            None => FoldOutcome::Unknown,
            Some(handler) => match handler(state, ev) {
                Ok(()) => FoldOutcome::Applied,
                Err(reason) => FoldOutcome::Rejected(reason),
            },
        }
    }
}

/// A log line that could not contribute to the state.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct SkippedRecord {
    /// 1-based line number in the log file.
    pub line: u64,
    pub reason: String,
}

/// Result of a replay plus diagnostics about what it had to skip.
#[derive(Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayReport {
    pub state: BoardState,
    pub events_applied: u64,
    pub last_seq: u64,
    pub skipped: Vec<SkippedRecord>,
    pub unknown_types: BTreeMap<String, u64>,
}

impl ReplayReport {
    pub fn is_clean(&self) -> bool {
        self.skipped.is_empty() && self.unknown_types.is_empty()
    }

    /// Folds one decoded event into the report.
    pub fn absorb(&mut self, registry: &FoldRegistry, line: u64, ev: &Event) {
        self.last_seq = self.last_seq.max(ev.seq);
        match registry.apply(&mut self.state, ev) {
            FoldOutcome::Applied => self.events_applied += 1,
            FoldOutcome::Unknown => {
                *self.unknown_types.entry(ev.event_type.clone()).or_default() += 1;
            }
            FoldOutcome::Rejected(reason) => self.skipped.push(SkippedRecord { line, reason }),
        }
    }
}
