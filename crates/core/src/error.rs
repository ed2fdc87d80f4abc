//! Domain error model.

use thiserror::Error;

use crate::state::{JobState, Transition};

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Keep this focused on deterministic failures (validation, illegal state
/// transitions). Storage and process failures belong to the crates that own
/// those concerns.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. malformed enqueue payload).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An identifier was invalid.
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A transition was attempted from a state it does not start from.
    #[error("cannot {transition} a job in state {from}")]
    InvalidTransition {
        transition: Transition,
        from: JobState,
    },

    /// A state name did not match any known state.
    #[error("unknown job state: {0}")]
    UnknownState(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}
