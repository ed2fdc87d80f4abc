//! Retry/backoff policy.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::state::Transition;

/// Exponential backoff: a job that has failed `attempts` times waits
/// `backoff_base^attempts` seconds before it becomes eligible again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Base of the exponent, in seconds.
    pub backoff_base: u32,
    /// Optional cap on a single delay. `None` means unbounded.
    pub max_backoff_secs: Option<u64>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff_base: 2,
            max_backoff_secs: None,
        }
    }
}

/// What to do with a job whose execution just failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Park in `failed` until `next_run_at`.
    Retry { next_run_at: DateTime<Utc> },
    /// Retries exhausted.
    DeadLetter,
}

impl RetryDecision {
    pub fn transition(&self) -> Transition {
        match self {
            RetryDecision::Retry { .. } => Transition::Fail,
            RetryDecision::DeadLetter => Transition::DeadLetter,
        }
    }
}

impl RetryPolicy {
    pub fn exponential(backoff_base: u32) -> Self {
        Self {
            backoff_base,
            max_backoff_secs: None,
        }
    }

    pub fn with_max_backoff_secs(mut self, cap: u64) -> Self {
        self.max_backoff_secs = Some(cap);
        self
    }

    /// Delay in whole seconds for the given attempt count. Saturates instead
    /// of overflowing.
    pub fn delay_secs(&self, attempts: u32) -> u64 {
        let raw = u64::from(self.backoff_base)
            .checked_pow(attempts)
            .unwrap_or(u64::MAX);
        match self.max_backoff_secs {
            Some(cap) => raw.min(cap),
            None => raw,
        }
    }

    /// Decide the outcome of a failed execution. `attempts` already counts
    /// the execution that just failed.
    pub fn decide(&self, attempts: u32, max_retries: u32, now: DateTime<Utc>) -> RetryDecision {
        if attempts >= max_retries {
            return RetryDecision::DeadLetter;
        }
        let secs = i64::try_from(self.delay_secs(attempts)).unwrap_or(i64::MAX);
        let next_run_at = TimeDelta::try_seconds(secs)
            .and_then(|delta| now.checked_add_signed(delta))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        RetryDecision::Retry { next_run_at }
    }
}
