//! Error types for the labgrid state store and table lock.

use std::time::Duration;

use thiserror::Error;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during state store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("invalid record: {0}")]
    Invalid(String),
}

/// Result type alias for table lock operations.
pub type LockResult<T> = Result<T, LockError>;

/// Errors raised by the resource table lock.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LockError {
    #[error("timed out after {0:?} waiting for the resource lock")]
    Timeout(Duration),

    #[error("resource lock is not held")]
    NotHeld,
}
