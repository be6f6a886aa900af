//! Common error types for Ledgerline.

use thiserror::Error;

/// Top-level error type for Ledgerline operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Network operation failed (transient, retryable).
    #[error("Network error: {0}")]
    Network(String),

    /// Network operation timed out (treated like a network failure).
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Remote store operation failed.
    #[error("Store error: {0}")]
    Store(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Server rejected the operation (non-retryable).
    #[error("Rejected: {0}")]
    Rejected(String),

    /// Sync engine invariant violated or unresolved conflict state.
    #[error("Conflict: {0}")]
    Conflict(String),
}

impl Error {
    /// Whether this error is transient and worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Network(_) | Error::Timeout(_) | Error::Io(_))
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
