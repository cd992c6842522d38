//! Scheduler error types.

use std::time::Duration;

use labgrid_constraint::ConstraintError;
use labgrid_state::{LockError, StateError};
use thiserror::Error;

/// Errors that can occur during scheduling operations.
///
/// Finding no free resource is not an error: claims return `Ok(None)`.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("invalid constraint: {0}")]
    Constraint(#[from] ConstraintError),

    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    #[error("timed out after {0:?} waiting for the resource lock")]
    LockTimeout(Duration),

    #[error("resource lock is not held")]
    LockNotHeld,

    #[error("state store error: {0}")]
    State(#[from] StateError),

    /// A stored offer that no longer parses. Rows written through the store
    /// are validated, so this points at an outside writer.
    #[error("stored {kind} {name} is corrupt: {source}")]
    Corrupt {
        kind: &'static str,
        name: String,
        source: ConstraintError,
    },
}

impl From<LockError> for SchedulerError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Timeout(wait) => SchedulerError::LockTimeout(wait),
            LockError::NotHeld => SchedulerError::LockNotHeld,
        }
    }
}

impl SchedulerError {
    pub(crate) fn not_found(kind: &'static str, name: &str) -> Self {
        SchedulerError::NotFound {
            kind,
            name: name.to_string(),
        }
    }

    pub(crate) fn corrupt(kind: &'static str, name: &str, source: ConstraintError) -> Self {
        SchedulerError::Corrupt {
            kind,
            name: name.to_string(),
            source,
        }
    }

    /// True for errors caused by the caller's input.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            SchedulerError::Validation(_)
                | SchedulerError::Constraint(_)
                | SchedulerError::State(StateError::Invalid(_))
        )
    }
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
