//! Core primitives: storage layout, configuration, the event log and its
//! fold, and the claim chain.
//!
//! Nothing in here holds authoritative in-memory state; every module reads
//! and writes the workspace directory directly.

pub mod claims;
pub mod config;
pub mod error;
pub mod events;
pub mod fold;
pub mod lockfile;
pub mod logging;
pub mod store;
pub mod time;
