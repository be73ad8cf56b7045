use thiserror::Error;

use crate::entity::KeyError;

/// Errors that can occur during backing-store operations.
///
/// These are propagated to callers unchanged; the cache layer never retries
/// them.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RepositoryError {
    #[error("{kind} not found: {key}")]
    NotFound { kind: String, key: String },
    #[error("{kind} already exists: {key}")]
    AlreadyExists { kind: String, key: String },
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Query failed: {0}")]
    QueryFailed(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Invalid data: {0}")]
    InvalidData(String),
    #[error("Invalid key: {0}")]
    InvalidKey(#[from] KeyError),
    #[error("Transaction conflict: {0}")]
    Conflict(String),
    #[error("Transaction {0} is no longer active")]
    TransactionClosed(String),
    #[error("Operation cancelled")]
    Cancelled,
}

/// Result type for repository operations.
pub type Result<T> = std::result::Result<T, RepositoryError>;
