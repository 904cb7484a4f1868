//! Dual-write blackboard for migrating from the legacy snapshot file to the event log.
//!
//! Each mutation is committed to two independent writers while holding the
//! board-wide `board:commit` claim, so both see the same total order:
//! - [`EventLogWriter`]: the event log (authoritative).
//! - [`SnapshotWriter`]: `board.snapshot.json`, the folded view older readers consume.
//!
//! [`BlackboardV2::verify`] reconstructs both and compares digests;
//! [`BlackboardV2::repair_snapshot`] rewrites the snapshot from the log.

use crate::core::claims::ClaimChain;
use crate::core::config::BoardConfig;
use crate::core::error::BoardError;
use crate::core::events::EventLog;
use crate::core::fold::{BoardState, FindingType, Mutation};
use crate::core::store::Store;
use crate::core::time;
use crate::plugins::blackboard::{operation_holder, require_non_empty};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use tracing::{info, warn};

pub const COMMIT_RESOURCE: &str = "board:commit";

/// One persisted representation of the board.
pub trait BoardWriter: Send + Sync {
    fn name(&self) -> &'static str;
    fn apply(&self, mutation: &Mutation) -> Result<(), BoardError>;
    fn load(&self) -> Result<BoardState, BoardError>;
}

pub struct EventLogWriter {
    log: EventLog,
}

impl EventLogWriter {
    pub fn new(log: EventLog) -> Self {
        Self { log }
    }

    pub fn log(&self) -> &EventLog {
        &self.log
    }
}

impl BoardWriter for EventLogWriter {
    fn name(&self) -> &'static str {
        "event_log"
    }

    fn apply(&self, mutation: &Mutation) -> Result<(), BoardError> {
        self.log.append_with_ts(
            mutation.agent_id(),
            mutation.event_type(),
            mutation.payload(),
            Some(mutation.at().to_string()),
        )?;
        Ok(())
    }

    fn load(&self) -> Result<BoardState, BoardError> {
        self.log.get_current_state()
    }
}

/// Legacy whole-state snapshot. Callers serialize writes (read-modify-write).
pub struct SnapshotWriter {
    store: Store,
    fsync: bool,
}

impl SnapshotWriter {
    pub fn new(store: Store, fsync: bool) -> Self {
        Self { store, fsync }
    }

    pub fn path(&self) -> PathBuf {
        self.store.snapshot_path()
    }

    /// Missing file means empty board; an undecodable one is an error.
    pub fn read(&self) -> Result<BoardState, BoardError> {
        let bytes = match fs::read(self.path()) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BoardState::default()),
            Err(e) => return Err(BoardError::IoError(e)),
        };
        if bytes.iter().all(|b| b.is_ascii_whitespace()) {
            return Ok(BoardState::default());
        }
        serde_json::from_slice(&bytes).map_err(|e| {
            let path = self.path();
            BoardError::ValidationError(format!("corrupt snapshot {}: {}", path.display(), e))
        })
    }

    /// Temp file + rename, so readers see either the old or the new snapshot.
    pub fn write(&self, state: &BoardState) -> Result<(), BoardError> {
        self.store.ensure_root()?;
        let path = self.path();
        let tmp = path.with_extension(format!("{}.tmp", time::new_event_id()));
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp)
            .map_err(BoardError::IoError)?;
        let body = serde_json::to_vec_pretty(state)?;
        let written = file.write_all(&body).and_then(|_| {
            if self.fsync {
                file.sync_data()
            } else {
                Ok(())
            }
        });
        drop(file);
        if let Err(e) = written.and_then(|_| fs::rename(&tmp, &path)) {
            let _ = fs::remove_file(&tmp);
            return Err(BoardError::IoError(e));
        }
        Ok(())
    }
}

impl BoardWriter for SnapshotWriter {
    fn name(&self) -> &'static str {
        "snapshot"
    }

    fn apply(&self, mutation: &Mutation) -> Result<(), BoardError> {
        let mut state = self.read()?;
        mutation.apply(&mut state);
        self.write(&state)
    }

    fn load(&self) -> Result<BoardState, BoardError> {
        self.read()
    }
}

/// Which representation `get_full_state` reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadSource {
    #[default]
    EventLog,
    Snapshot,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct ConsistencyReport {
    pub consistent: bool,
    pub events_digest: String,
    pub snapshot_digest: String,
    pub agents: (usize, usize),
    pub findings: (usize, usize),
    pub differences: Vec<String>,
}

pub struct BlackboardV2 {
    claims: ClaimChain,
    events: EventLogWriter,
    snapshot: SnapshotWriter,
    read_source: ReadSource,
    claim_timeout: std::time::Duration,
}

impl BlackboardV2 {
    pub fn new(store: Store, config: BoardConfig) -> Self {
        Self {
            events: EventLogWriter::new(EventLog::new(store.clone(), config.clone())),
            snapshot: SnapshotWriter::new(store.clone(), config.fsync),
            claim_timeout: config.claim_timeout(),
            claims: ClaimChain::new(store, config),
            read_source: ReadSource::default(),
        }
    }

    pub fn open(root: impl Into<PathBuf>) -> Result<Self, BoardError> {
        let store = Store::new(root);
        let config = BoardConfig::load(&store)?;
        Ok(Self::new(store, config))
    }

    pub fn with_read_source(mut self, source: ReadSource) -> Self {
        self.read_source = source;
        self
    }

    pub fn event_writer(&self) -> &EventLogWriter {
        &self.events
    }

    pub fn snapshot_writer(&self) -> &SnapshotWriter {
        &self.snapshot
    }

    /// Applies `mutation` to both representations under the board-wide claim.
    ///
    /// The next snapshot is folded before anything is written, so a snapshot
    /// that cannot be read fails the commit with no side effects. The event
    /// log is then appended; if the snapshot write fails after that the error
    /// is returned and the snapshot stays behind until
    /// [`Self::repair_snapshot`] runs.
    pub fn commit(&self, mutation: &Mutation) -> Result<(), BoardError> {
        let holder = operation_holder(mutation.agent_id());
        self.claims
            .with_claim(COMMIT_RESOURCE, &holder, self.claim_timeout, |_| {
                let mut next = self
                    .snapshot
                    .read()
                    .inspect_err(|e| self.log_failure(&self.snapshot, mutation, e))?;
                mutation.apply(&mut next);
                self.events
                    .apply(mutation)
                    .inspect_err(|e| self.log_failure(&self.events, mutation, e))?;
                self.snapshot
                    .write(&next)
                    .inspect_err(|e| self.log_failure(&self.snapshot, mutation, e))
            })
    }

    fn log_failure(&self, writer: &dyn BoardWriter, mutation: &Mutation, error: &BoardError) {
        warn!(
            writer = writer.name(),
            event_type = mutation.event_type(),
            error = %error,
            "dual write failed"
        );
    }

    pub fn register_agent(&self, agent_id: &str, task: &str) -> Result<(), BoardError> {
        require_non_empty("agent id", agent_id)?;
        self.commit(&Mutation::RegisterAgent {
            agent_id: agent_id.to_string(),
            task: task.to_string(),
            at: time::now_epoch_z(),
        })
    }

    pub fn add_finding(
        &self,
        agent_id: &str,
        finding_type: impl Into<FindingType>,
        content: &str,
    ) -> Result<(), BoardError> {
        require_non_empty("agent id", agent_id)?;
        require_non_empty("finding content", content)?;
        self.commit(&Mutation::AddFinding {
            agent_id: agent_id.to_string(),
            finding_type: finding_type.into(),
            content: content.to_string(),
            at: time::now_epoch_z(),
        })
    }

    pub fn get_full_state(&self) -> Result<BoardState, BoardError> {
        match self.read_source {
            ReadSource::EventLog => self.events.load(),
            ReadSource::Snapshot => self.snapshot.load(),
        }
    }

    /// Reconstructs both representations and compares them.
    pub fn verify(&self) -> Result<ConsistencyReport, BoardError> {
        let from_events = self.events.load()?;
        let from_snapshot = self.snapshot.load()?;
        let events_digest = state_digest(&from_events)?;
        let snapshot_digest = state_digest(&from_snapshot)?;
        let differences = if events_digest == snapshot_digest {
            Vec::new()
        } else {
            describe_differences(&from_events, &from_snapshot)
        };
        Ok(ConsistencyReport {
            consistent: events_digest == snapshot_digest,
            events_digest,
            snapshot_digest,
            agents: (from_events.agents.len(), from_snapshot.agents.len()),
            findings: (from_events.findings.len(), from_snapshot.findings.len()),
            differences,
        })
    }

    /// Rewrites the snapshot from the event log. The log wins.
    pub fn repair_snapshot(&self) -> Result<ConsistencyReport, BoardError> {
        let holder = operation_holder("repair");
        self.claims
            .with_claim(COMMIT_RESOURCE, &holder, self.claim_timeout, |_| {
                let state = self.events.load()?;
                self.snapshot.write(&state)
            })?;
        info!(path = %self.snapshot.path().display(), "snapshot rebuilt from event log");
        self.verify()
    }

    /// One-time migration: seeds an empty event log from the legacy snapshot.
    /// Returns the number of events written.
    pub fn backfill_from_snapshot(&self) -> Result<u64, BoardError> {
        let holder = operation_holder("backfill");
        let written = self
            .claims
            .with_claim(COMMIT_RESOURCE, &holder, self.claim_timeout, |_| {
                if !self.events.log().read_events()?.is_empty() {
                    return Err(BoardError::ValidationError(
                        "event log already has events; backfill only seeds an empty log".into(),
                    ));
                }
                let legacy = self.snapshot.read()?;
                let mut written = 0u64;
                for mutation in mutations_for(&legacy) {
                    self.events.apply(&mutation)?;
                    written += 1;
                }
                Ok(written)
            })?;
        info!(events = written, "event log backfilled from snapshot");
        Ok(written)
    }
}

/// Mutations whose replay reproduces `state` exactly.
fn mutations_for(state: &BoardState) -> Vec<Mutation> {
    let mut out = Vec::new();
    for agent in state.agents.values() {
        out.push(Mutation::RegisterAgent {
            agent_id: agent.agent_id.clone(),
            task: agent.task.clone(),
            at: agent.registered_at.clone(),
        });
        if agent.updated_at != agent.registered_at {
            out.push(Mutation::RegisterAgent {
                agent_id: agent.agent_id.clone(),
                task: agent.task.clone(),
                at: agent.updated_at.clone(),
            });
        }
    }
    for finding in &state.findings {
        out.push(Mutation::AddFinding {
            agent_id: finding.agent_id.clone(),
            finding_type: finding.finding_type.clone(),
            content: finding.content.clone(),
            at: finding.created_at.clone(),
        });
    }
    out
}

/// SHA-256 over the canonical JSON of a state (agents are a sorted map).
pub fn state_digest(state: &BoardState) -> Result<String, BoardError> {
    let bytes = serde_json::to_vec(state)?;
    let digest = Sha256::digest(&bytes);
    Ok(format!("{:x}", digest))
}

fn describe_differences(events: &BoardState, snapshot: &BoardState) -> Vec<String> {
    let mut out = Vec::new();
    for (id, agent) in &events.agents {
        match snapshot.agents.get(id) {
            None => out.push(format!("agent '{}' missing from snapshot", id)),
            Some(other) if other != agent => out.push(format!("agent '{}' differs", id)),
            Some(_) => {}
        }
    }
    for id in snapshot.agents.keys() {
        if !events.agents.contains_key(id) {
            out.push(format!("agent '{}' missing from event log", id));
        }
    }
    if events.findings.len() != snapshot.findings.len() {
        out.push(format!(
            "finding count differs: event log {} vs snapshot {}",
            events.findings.len(),
            snapshot.findings.len()
        ));
    }
    if let Some(idx) = events
        .findings
        .iter()
        .zip(&snapshot.findings)
        .position(|(a, b)| a != b)
    {
        out.push(format!("findings diverge at index {}", idx));
    }
    out
}

pub fn schema() -> serde_json::Value {
    serde_json::json!({
        "name": "dual_write",
        "version": "0.1.0",
        "description": "Dual-write migration shim: event log + legacy snapshot",
        "commands": [
            { "name": "verify", "parameters": [] },
            { "name": "repair", "parameters": [] },
            { "name": "backfill", "parameters": [] }
        ],
        "storage": ["events.jsonl", "board.snapshot.json"]
    })
}
