//! Job lifecycle state machine.
//!
//! ```text
//!             claim            complete
//!   pending ─────────► processing ─────────► completed
//!     ▲  ▲                 │   │
//!     │  │ sweep      fail │   │ dead_letter
//!     │  └───────── failed ◄┘   └──────► dead
//!     │                                   │
//!     └────────────── revive ─────────────┘
//! ```
//!
//! Every mutation a store performs is one of the [`Transition`]s below. Each
//! has exactly one source and one target state, so stores can guard their
//! writes with `WHERE state = <source>` and never apply anything else.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Current state of a job. Exactly one at any instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Waiting to be claimed (possibly not yet due).
    Pending,
    /// Claimed by a worker and executing.
    Processing,
    /// Finished with exit code 0.
    Completed,
    /// Failed, waiting for its backoff to elapse.
    Failed,
    /// Retries exhausted; only an operator can revive it.
    Dead,
}

impl JobState {
    pub const ALL: [JobState; 5] = [
        JobState::Pending,
        JobState::Processing,
        JobState::Completed,
        JobState::Failed,
        JobState::Dead,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Dead => "dead",
        }
    }

    /// No transition leaves this state without operator action.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Dead)
    }
}

impl core::fmt::Display for JobState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(JobState::Pending),
            "processing" => Ok(JobState::Processing),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "dead" => Ok(JobState::Dead),
            other => Err(DomainError::UnknownState(other.to_string())),
        }
    }
}

/// The closed set of allowed state changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    /// pending → processing
    Claim,
    /// processing → completed
    Complete,
    /// processing → failed
    Fail,
    /// processing → dead
    DeadLetter,
    /// failed → pending, once the backoff has elapsed
    Sweep,
    /// dead → pending, operator retry
    Revive,
}

impl Transition {
    pub const ALL: [Transition; 6] = [
        Transition::Claim,
        Transition::Complete,
        Transition::Fail,
        Transition::DeadLetter,
        Transition::Sweep,
        Transition::Revive,
    ];

    pub const fn from(self) -> JobState {
        match self {
            Transition::Claim => JobState::Pending,
            Transition::Complete | Transition::Fail | Transition::DeadLetter => {
                JobState::Processing
            }
            Transition::Sweep => JobState::Failed,
            Transition::Revive => JobState::Dead,
        }
    }

    pub const fn to(self) -> JobState {
        match self {
            Transition::Claim => JobState::Processing,
            Transition::Complete => JobState::Completed,
            Transition::Fail => JobState::Failed,
            Transition::DeadLetter => JobState::Dead,
            Transition::Sweep | Transition::Revive => JobState::Pending,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Transition::Claim => "claim",
            Transition::Complete => "complete",
            Transition::Fail => "fail",
            Transition::DeadLetter => "dead-letter",
            Transition::Sweep => "sweep",
            Transition::Revive => "revive",
        }
    }

    /// Apply the transition to `state`, rejecting it unless `state` is the
    /// transition's source.
    pub fn apply(self, state: JobState) -> Result<JobState, DomainError> {
        if state == self.from() {
            Ok(self.to())
        } else {
            Err(DomainError::InvalidTransition {
                transition: self,
                from: state,
            })
        }
    }

    /// Look up the transition between two states, if one exists.
    pub fn between(from: JobState, to: JobState) -> Option<Transition> {
        Transition::ALL
            .into_iter()
            .find(|t| t.from() == from && t.to() == to)
    }
}

impl core::fmt::Display for Transition {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn state_names_round_trip() {
        for state in JobState::ALL {
            assert_eq!(state.as_str().parse::<JobState>().unwrap(), state);
        }
        assert!("running".parse::<JobState>().is_err());
        assert_eq!(" DEAD ".parse::<JobState>().unwrap(), JobState::Dead);
    }

    #[test]
    fn allowed_edges_are_exactly_the_lifecycle() {
        let edges: Vec<(JobState, JobState)> =
            Transition::ALL.iter().map(|t| (t.from(), t.to())).collect();
        assert_eq!(
            edges,
            vec![
                (JobState::Pending, JobState::Processing),
                (JobState::Processing, JobState::Completed),
                (JobState::Processing, JobState::Failed),
                (JobState::Processing, JobState::Dead),
                (JobState::Failed, JobState::Pending),
                (JobState::Dead, JobState::Pending),
            ]
        );
    }

    #[test]
    fn completed_is_a_sink() {
        for t in Transition::ALL {
            assert!(t.apply(JobState::Completed).is_err());
        }
    }

    #[test]
    fn rejected_transition_reports_source_state() {
        let err = Transition::Revive.apply(JobState::Failed).unwrap_err();
        assert_eq!(
            err,
            DomainError::InvalidTransition {
                transition: Transition::Revive,
                from: JobState::Failed,
            }
        );
        assert_eq!(err.to_string(), "cannot revive a job in state failed");
    }

    fn any_state() -> impl Strategy<Value = JobState> {
        prop::sample::select(JobState::ALL.to_vec())
    }

    proptest! {
        /// Property: a transition applies iff its source matches, and
        /// `between` finds exactly the transitions that `apply` accepts.
        #[test]
        fn apply_and_between_agree(from in any_state(), to in any_state()) {
            let accepted: Vec<Transition> = Transition::ALL
                .into_iter()
                .filter(|t| t.apply(from).ok() == Some(to))
                .collect();
            match Transition::between(from, to) {
                Some(t) => prop_assert_eq!(accepted, vec![t]),
                None => prop_assert!(accepted.is_empty()),
            }
        }
    }
}
