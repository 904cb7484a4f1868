use std::fmt;
use std::io;
use thiserror::Error;

/// Contention on a claimed resource. Recoverable: retry, back off, or pick another resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockedError {
    pub resource: String,
    pub holder: String,
    pub expires_at_ms: u64,
}

impl fmt::Display for BlockedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "resource '{}' is held by '{}' (lease expires at {}ms)",
            self.resource, self.holder, self.expires_at_ms
        )
    }
}

impl std::error::Error for BlockedError {}

#[derive(Error, Debug)]
pub enum BoardError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Config error: {0}")]
    ConfigError(String),
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Blocked: {0}")]
    Blocked(#[from] BlockedError),
    #[error("Agent '{agent_id}' does not hold a claim on '{resource}'")]
    NotHolder { resource: String, agent_id: String },
}

impl BoardError {
    /// True for contention that the caller may retry.
    pub fn is_blocked(&self) -> bool {
        matches!(self, BoardError::Blocked(_))
    }
}
