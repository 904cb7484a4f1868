//! agentboard: a daemonless blackboard for concurrently running agents.
//!
//! Agents running as threads or as separate processes share one workspace
//! directory. Through it they
//!
//! - register themselves and the task they work on,
//! - post findings (facts, hypotheses, questions, decisions, warnings),
//! - take exclusive, lease-bounded claims on named resources.
//!
//! # Storage
//!
//! - `events.jsonl`: append-only event log, the only source of truth
//! - `events.lock`: advisory lock serializing appends
//! - `claims/`: one claim artifact plus one guard lock per resource
//! - `board.snapshot.json`: legacy whole-state snapshot (dual-write mode only)
//! - `agentboard.toml`: optional configuration
//!
//! State is never held authoritatively in memory. Every read replays the
//! log, so a fresh process sees exactly what earlier processes acknowledged,
//! including ones that crashed mid-write.
//!
//! # Modules
//!
//! - [`core`]: store layout, config, event log, fold, claim chain
//! - [`plugins::blackboard`]: the agent-facing API
//! - [`plugins::dual_write`]: event log + legacy snapshot migration path

pub mod cli;
pub mod core;
pub mod plugins;

use crate::cli::{Cli, Command, OutputFormat};
use crate::core::claims::{Claim, ClaimChain};
use crate::core::config::BoardConfig;
use crate::core::error::BoardError;
use crate::core::events::EventLog;
use crate::core::fold::{BoardState, Event, ReplayReport};
use crate::core::store::Store;
use crate::core::time;
use crate::plugins::blackboard::Blackboard;
use crate::plugins::dual_write::{BlackboardV2, ConsistencyReport};
use clap::Parser;
use colored::Colorize;
use serde_json::{Value as JsonValue, json};
use std::path::PathBuf;
use std::time::Duration;

pub const ROOT_ENV: &str = "AGENTBOARD_ROOT";
const DEFAULT_ROOT_DIR: &str = ".agentboard";

/// What a command produced, rendered by [`emit`] in the requested format.
struct Outcome {
    cmd: &'static str,
    status: &'static str,
    body: JsonValue,
    text: String,
}

impl Outcome {
    fn ok(cmd: &'static str, body: JsonValue, text: String) -> Self {
        Self {
            cmd,
            status: "ok",
            body,
            text,
        }
    }
}

pub fn run() -> Result<(), BoardError> {
    let cli = Cli::parse();
    crate::core::logging::init(cli.verbose);

    let store = Store::new(resolve_root(cli.root)?);
    let config = BoardConfig::load(&store)?;
    tracing::debug!(root = %store.root.display(), "workspace resolved");

    let outcome = match cli.command {
        Command::Register { agent, task } => {
            if cli.dual_write {
                BlackboardV2::new(store, config).register_agent(&agent, &task)?;
                Outcome::ok(
                    "register",
                    json!({ "agent_id": agent, "task": task, "dual_write": true }),
                    format!("{} {} ({})", "registered".green(), agent.bold(), task),
                )
            } else {
                let ev = Blackboard::new(store, config).register_agent(&agent, &task)?;
                Outcome::ok(
                    "register",
                    json!({ "event": ev }),
                    format!("{} {} ({}) seq={}", "registered".green(), agent.bold(), task, ev.seq),
                )
            }
        }
        Command::Finding {
            agent,
            finding_type,
            content,
        } => {
            if cli.dual_write {
                BlackboardV2::new(store, config).add_finding(
                    &agent,
                    finding_type.as_str(),
                    &content,
                )?;
                Outcome::ok(
                    "finding",
                    json!({ "agent_id": agent, "finding_type": finding_type, "dual_write": true }),
                    format!("{} [{}] {}", "posted".green(), finding_type, agent.bold()),
                )
            } else {
                let ev = Blackboard::new(store, config).add_finding(
                    &agent,
                    finding_type.as_str(),
                    &content,
                )?;
                Outcome::ok(
                    "finding",
                    json!({ "event": ev }),
                    format!(
                        "{} [{}] {} seq={}",
                        "posted".green(),
                        finding_type,
                        agent.bold(),
                        ev.seq
                    ),
                )
            }
        }
        Command::State { report } => {
            let replay = EventLog::new(store, config).replay()?;
            state_outcome(replay, report)
        }
        Command::Events { since } => {
            let events = EventLog::new(store, config).events_since(since)?;
            Outcome::ok(
                "events",
                json!({ "since": since, "count": events.len(), "events": events }),
                render_events(&events),
            )
        }
        Command::Claim {
            resource,
            agent,
            timeout_ms,
        } => {
            let claim = ClaimChain::new(store, config).claim(
                &resource,
                &agent,
                Duration::from_millis(timeout_ms),
            )?;
            Outcome::ok(
                "claim",
                json!({ "claim": claim }),
                format!(
                    "{} {} for {} until {}",
                    "claimed".green(),
                    claim.resource_key.bold(),
                    claim.holder,
                    time::epoch_z_from_millis(claim.expires_at_ms)
                ),
            )
        }
        Command::Release { resource, agent } => {
            let released = ClaimChain::new(store, config).release(&resource, &agent)?;
            let text = if released {
                format!("{} {}", "released".green(), resource.bold())
            } else {
                format!("{} {} is not held by {}", "noop".yellow(), resource, agent)
            };
            Outcome {
                cmd: "release",
                status: if released { "ok" } else { "noop" },
                body: json!({ "resource_key": resource, "agent_id": agent, "released": released }),
                text,
            }
        }
        Command::Claims => {
            let claims = ClaimChain::new(store, config).list()?;
            Outcome::ok(
                "claims",
                json!({ "count": claims.len(), "claims": claims }),
                render_claims(&claims),
            )
        }
        Command::Reap => {
            let reaped = ClaimChain::new(store, config).reap_expired()?;
            Outcome::ok(
                "reap",
                json!({ "reaped": reaped }),
                format!("reaped {} expired claim(s)", reaped),
            )
        }
        Command::Verify => {
            let report = BlackboardV2::new(store, config).verify()?;
            consistency_outcome("verify", report)
        }
        Command::Repair => {
            let report = BlackboardV2::new(store, config).repair_snapshot()?;
            consistency_outcome("repair", report)
        }
        Command::Backfill => {
            let written = BlackboardV2::new(store, config).backfill_from_snapshot()?;
            Outcome::ok(
                "backfill",
                json!({ "events_written": written }),
                format!("backfilled {} event(s) from snapshot", written),
            )
        }
        Command::Schema => {
            let body = json!({
                "plugins": [plugins::blackboard::schema(), plugins::dual_write::schema()]
            });
            let text = serde_json::to_string_pretty(&body)?;
            Outcome::ok("schema", body, text)
        }
    };

    emit(cli.format, outcome)
}

/// `--root`, then `$AGENTBOARD_ROOT`, then `./.agentboard`.
fn resolve_root(flag: Option<PathBuf>) -> Result<PathBuf, BoardError> {
    if let Some(root) = flag {
        return Ok(root);
    }
    if let Some(root) = std::env::var_os(ROOT_ENV).filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(root));
    }
    Ok(std::env::current_dir()?.join(DEFAULT_ROOT_DIR))
}

fn emit(format: OutputFormat, outcome: Outcome) -> Result<(), BoardError> {
    match format {
        OutputFormat::Json => {
            let envelope = time::command_envelope(outcome.cmd, outcome.status, outcome.body);
            println!("{}", serde_json::to_string_pretty(&envelope)?);
        }
        OutputFormat::Text => println!("{}", outcome.text),
    }
    Ok(())
}

fn state_outcome(replay: ReplayReport, with_report: bool) -> Outcome {
    let mut text = render_state(&replay.state);
    if with_report {
        text.push_str(&format!(
            "\n{} applied={} last_seq={} skipped={} unknown_types={}",
            "replay".cyan(),
            replay.events_applied,
            replay.last_seq,
            replay.skipped.len(),
            replay.unknown_types.len()
        ));
        for skipped in &replay.skipped {
            text.push_str(&format!("\n  line {}: {}", skipped.line, skipped.reason));
        }
    }
    let body = if with_report {
        json!({ "state": replay.state, "replay": {
            "events_applied": replay.events_applied,
            "last_seq": replay.last_seq,
            "skipped": replay.skipped,
            "unknown_types": replay.unknown_types,
        }})
    } else {
        json!({ "state": replay.state })
    };
    Outcome::ok("state", body, text)
}

fn consistency_outcome(cmd: &'static str, report: ConsistencyReport) -> Outcome {
    let mut text = if report.consistent {
        format!("{} digest={}", "consistent".green(), report.events_digest)
    } else {
        format!(
            "{} events={} snapshot={}",
            "diverged".red().bold(),
            report.events_digest,
            report.snapshot_digest
        )
    };
    for difference in &report.differences {
        text.push_str(&format!("\n  - {}", difference));
    }
    Outcome {
        cmd,
        status: if report.consistent { "ok" } else { "diverged" },
        body: json!({ "report": report }),
        text,
    }
}

fn render_state(state: &BoardState) -> String {
    if state.is_empty() {
        return "board is empty".dimmed().to_string();
    }
    let mut out = format!("{} ({})", "agents".bold(), state.agents.len());
    for agent in state.agents.values() {
        out.push_str(&format!("\n  {}  {}", agent.agent_id.cyan(), agent.task));
    }
    out.push_str(&format!("\n{} ({})", "findings".bold(), state.findings.len()));
    for finding in &state.findings {
        out.push_str(&format!(
            "\n  [{}] {}: {}",
            finding.finding_type.as_str().yellow(),
            finding.agent_id.cyan(),
            finding.content
        ));
    }
    out
}

fn render_events(events: &[Event]) -> String {
    if events.is_empty() {
        return "no events".dimmed().to_string();
    }
    events
        .iter()
        .map(|ev| format!("{:>6} {} {} {}", ev.seq, ev.ts, ev.event_type.cyan(), ev.actor))
        .collect::<Vec<_>>()
        .join("\n")
}

fn render_claims(claims: &[Claim]) -> String {
    if claims.is_empty() {
        return "no live claims".dimmed().to_string();
    }
    let now = time::now_epoch_millis();
    claims
        .iter()
        .map(|c| {
            format!(
                "{}  {}  expires in {}ms",
                c.resource_key.bold(),
                c.holder,
                c.expires_at_ms.saturating_sub(now)
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}
