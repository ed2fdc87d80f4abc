//! Store error types.

use jobq_core::{DomainError, JobId, JobState, Transition};

/// Job store error.
#[derive(Debug, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("cannot {transition} job {id} in state {from}")]
    InvalidTransition {
        id: JobId,
        transition: Transition,
        from: JobState,
    },
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl JobStoreError {
    /// Failures of the backing store itself, as opposed to requests the
    /// store refused. Repeating the same call may succeed later.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Sqlite(_) | Self::Io(_))
    }

    /// Turn a rejected [`Transition::apply`] into a store error for `id`.
    pub(crate) fn from_domain(id: &JobId, err: DomainError) -> Self {
        match err {
            DomainError::InvalidTransition { transition, from } => Self::InvalidTransition {
                id: id.clone(),
                transition,
                from,
            },
            other => Self::Domain(other),
        }
    }
}

/// Configuration store error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(transparent)]
    Invalid(#[from] DomainError),
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}
