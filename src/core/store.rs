//! Store abstraction for a coordination workspace.
//!
//! One store is one directory shared by every agent working on the same task.
//! Everything that must survive a crash lives under its root; nothing else is
//! authoritative.

use crate::core::error::BoardError;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::PathBuf;
use std::sync::LazyLock;

pub const EVENTS_FILE: &str = "events.jsonl";
pub const EVENTS_LOCK_FILE: &str = "events.lock";
pub const SNAPSHOT_FILE: &str = "board.snapshot.json";
pub const CLAIMS_DIR: &str = "claims";
pub const CONFIG_FILE: &str = "agentboard.toml";

static UNSAFE_SEGMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^A-Za-z0-9_.-]+").expect("static regex"));

/// Store handle representing a coordination workspace.
///
/// Construction never touches the filesystem; directories are created lazily by
/// the first writer so that readers of a never-initialized store see empty state.
#[derive(Debug, Clone)]
pub struct Store {
    /// Path to the workspace root directory
    pub root: PathBuf,
}

impl Store {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn events_path(&self) -> PathBuf {
        self.root.join(EVENTS_FILE)
    }

    pub fn events_lock_path(&self) -> PathBuf {
        self.root.join(EVENTS_LOCK_FILE)
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.root.join(SNAPSHOT_FILE)
    }

    pub fn claims_dir(&self) -> PathBuf {
        self.root.join(CLAIMS_DIR)
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }

    /// Lock artifact for a resource: `claims/<slug>-<hash>.claim`.
    pub fn claim_path(&self, resource_key: &str) -> PathBuf {
        self.claims_dir()
            .join(format!("{}.claim", resource_file_stem(resource_key)))
    }

    /// Advisory guard lock serializing inspection/creation of one claim artifact.
    pub fn claim_guard_path(&self, resource_key: &str) -> PathBuf {
        self.claims_dir()
            .join(format!("{}.guard", resource_file_stem(resource_key)))
    }

    pub fn ensure_root(&self) -> Result<(), BoardError> {
        fs::create_dir_all(&self.root).map_err(BoardError::IoError)
    }

    pub fn ensure_claims_dir(&self) -> Result<(), BoardError> {
        fs::create_dir_all(self.claims_dir()).map_err(BoardError::IoError)
    }
}

/// Filesystem-safe, collision-free name for an arbitrary resource key.
///
/// The readable slug is truncated; the hash suffix keeps distinct keys distinct.
pub fn resource_file_stem(resource_key: &str) -> String {
    let slug = UNSAFE_SEGMENT.replace_all(resource_key, "_");
    let slug: String = slug.trim_matches('.').chars().take(48).collect();
    let digest = Sha256::digest(resource_key.as_bytes());
    let hash: String = digest.iter().take(8).map(|b| format!("{:02x}", b)).collect();
    if slug.is_empty() {
        hash
    } else {
        format!("{}-{}", slug, hash)
    }
}
