//! CLI struct definitions for the agentboard command-line interface.
//!
//! All clap-derived types live here. Dispatch logic lives in `lib.rs`.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub(crate) enum OutputFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[clap(
    name = "agentboard",
    version = env!("CARGO_PKG_VERSION"),
    about = "Daemonless blackboard for concurrent agents: findings, claims, crash-safe replay."
)]
pub(crate) struct Cli {
    /// Workspace directory. Defaults to $AGENTBOARD_ROOT, then ./.agentboard.
    #[clap(long, global = true)]
    pub root: Option<PathBuf>,
    /// Output format for this command.
    #[clap(long, global = true, value_enum, default_value = "text")]
    pub format: OutputFormat,
    /// Also maintain the legacy snapshot (dual-write mode).
    #[clap(long, global = true)]
    pub dual_write: bool,
    /// Log verbosity (-v info, -vv debug). AGENTBOARD_LOG overrides.
    #[clap(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Command {
    /// Register an agent (or update its task).
    Register {
        #[clap(long)]
        agent: String,
        #[clap(long, default_value = "")]
        task: String,
    },
    /// Post a finding.
    Finding {
        #[clap(long)]
        agent: String,
        /// fact, hypothesis, question, decision, warning, or any custom tag
        #[clap(long = "type", default_value = "fact")]
        finding_type: String,
        #[clap(long)]
        content: String,
    },
    /// Show the replayed board state.
    State {
        /// Include replay diagnostics (skipped records, unknown event types).
        #[clap(long)]
        report: bool,
    },
    /// List events after a sequence number.
    Events {
        #[clap(long, default_value = "0")]
        since: u64,
    },
    /// Claim exclusive ownership of a resource.
    Claim {
        #[clap(long)]
        resource: String,
        #[clap(long)]
        agent: String,
        /// How long to wait for a contested resource (0 = single attempt).
        #[clap(long, default_value = "0")]
        timeout_ms: u64,
    },
    /// Release a claim held by the agent.
    Release {
        #[clap(long)]
        resource: String,
        #[clap(long)]
        agent: String,
    },
    /// List live claims.
    Claims,
    /// Remove expired claim artifacts.
    Reap,
    /// Compare the event log with the legacy snapshot.
    Verify,
    /// Rewrite the legacy snapshot from the event log.
    Repair,
    /// Seed an empty event log from the legacy snapshot.
    Backfill,
    /// Print the command/storage schema.
    Schema,
}
