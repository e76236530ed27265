//! Error types for AgentDeck.

use thiserror::Error;

/// Result alias used across the AgentDeck crates.
pub type Result<T> = std::result::Result<T, DeckError>;

#[derive(Debug, Error)]
pub enum DeckError {
    #[error("Config error: {0}")]
    Config(String),

    /// Backing store failure (connectivity, constraint, lock poisoning).
    #[error("Store error: {0}")]
    Store(String),

    /// Insert rejected because a record with the same idempotency key exists.
    #[error("Duplicate: {0}")]
    Duplicate(String),

    #[error("Timed out after {secs}s: {operation}")]
    Timeout { operation: String, secs: u64 },

    #[error("Invalid cron expression '{expression}': {reason}")]
    InvalidCron { expression: String, reason: String },

    #[error("Trigger not found: {0}")]
    TriggerNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DeckError {
    /// Whether this error means the record already exists.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate(_))
    }
}
