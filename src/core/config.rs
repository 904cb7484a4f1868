//! Workspace configuration.
//!
//! Resolution order: built-in defaults, then `<root>/agentboard.toml`, then
//! `AGENTBOARD_*` environment variables. A missing file is not an error.

use crate::core::error::BoardError;
use crate::core::store::Store;
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

pub const ENV_LEASE_MS: &str = "AGENTBOARD_LEASE_MS";
pub const ENV_CLAIM_POLL_MS: &str = "AGENTBOARD_CLAIM_POLL_MS";
pub const ENV_CLAIM_TIMEOUT_MS: &str = "AGENTBOARD_CLAIM_TIMEOUT_MS";
pub const ENV_APPEND_TIMEOUT_MS: &str = "AGENTBOARD_APPEND_TIMEOUT_MS";
pub const ENV_FSYNC: &str = "AGENTBOARD_FSYNC";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoardConfig {
    /// How long a claim stays live without renewal before others may reclaim it.
    pub lease_ms: u64,
    /// Sleep between attempts while waiting on a contested claim.
    pub claim_poll_ms: u64,
    /// Default wait used by blackboard operations that take a claim internally.
    pub claim_timeout_ms: u64,
    /// Upper bound on waiting for the event log append lock.
    pub append_timeout_ms: u64,
    /// `fsync` every appended record and snapshot before acknowledging it.
    pub fsync: bool,
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            lease_ms: 30_000,
            claim_poll_ms: 25,
            claim_timeout_ms: 10_000,
            append_timeout_ms: 10_000,
            fsync: true,
        }
    }
}

impl BoardConfig {
    /// Loads `<root>/agentboard.toml` (if present) and applies env overrides.
    pub fn load(store: &Store) -> Result<Self, BoardError> {
        let mut config = Self::from_file(store)?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(store: &Store) -> Result<Self, BoardError> {
        let path = store.config_path();
        if !path.is_file() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(&path).map_err(BoardError::IoError)?;
        toml::from_str(&content)
            .map_err(|e| BoardError::ConfigError(format!("{}: {}", path.display(), e)))
    }

    /// Applies overrides from any key lookup (the process environment in production).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), BoardError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let millis = |key: &str| -> Result<Option<u64>, BoardError> {
            match lookup(key) {
                None => Ok(None),
                Some(raw) => raw.trim().parse::<u64>().map(Some).map_err(|_| {
                    BoardError::ConfigError(format!("{} must be an integer, got '{}'", key, raw))
                }),
            }
        };

        if let Some(v) = millis(ENV_LEASE_MS)? {
            self.lease_ms = v;
        }
        if let Some(v) = millis(ENV_CLAIM_POLL_MS)? {
            self.claim_poll_ms = v;
        }
        if let Some(v) = millis(ENV_CLAIM_TIMEOUT_MS)? {
            self.claim_timeout_ms = v;
        }
        if let Some(v) = millis(ENV_APPEND_TIMEOUT_MS)? {
            self.append_timeout_ms = v;
        }
        if let Some(raw) = lookup(ENV_FSYNC) {
            self.fsync = match raw.trim() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" => false,
                other => {
                    return Err(BoardError::ConfigError(format!(
                        "{} must be a boolean, got '{}'",
                        ENV_FSYNC, other
                    )));
                }
            };
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<(), BoardError> {
        if self.lease_ms == 0 {
            return Err(BoardError::ConfigError("lease_ms must be > 0".into()));
        }
        Ok(())
    }

    pub fn claim_poll(&self) -> Duration {
        Duration::from_millis(self.claim_poll_ms.max(1))
    }

    pub fn claim_timeout(&self) -> Duration {
        Duration::from_millis(self.claim_timeout_ms)
    }

    pub fn append_timeout(&self) -> Duration {
        Duration::from_millis(self.append_timeout_ms)
    }
}
