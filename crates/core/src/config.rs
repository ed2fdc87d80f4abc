//! Queue tunables.
//!
//! Values live as strings in a key-value store; this module owns the key
//! names, defaults, and parsing so every consumer reads them the same way.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::retry::RetryPolicy;

pub const POLL_INTERVAL_MS: &str = "poll_interval_ms";
pub const DEFAULT_TIMEOUT_SECS: &str = "default_timeout_secs";
pub const BACKOFF_BASE: &str = "backoff_base";
pub const MAX_RETRIES: &str = "max_retries";
pub const MAX_BACKOFF_SECS: &str = "max_backoff_secs";

/// Keys a caller may set.
pub const KNOWN_KEYS: [&str; 5] = [
    POLL_INTERVAL_MS,
    DEFAULT_TIMEOUT_SECS,
    BACKOFF_BASE,
    MAX_RETRIES,
    MAX_BACKOFF_SECS,
];

/// Typed view over the configuration store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Worker sleep between empty polls.
    pub poll_interval_ms: u64,
    /// Execution timeout when a job has none of its own.
    pub default_timeout_secs: u64,
    pub backoff_base: u32,
    /// Default for jobs enqueued without `max_retries`.
    pub max_retries: u32,
    /// Cap on a single backoff delay; unset = unbounded.
    pub max_backoff_secs: Option<u64>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            default_timeout_secs: 60,
            backoff_base: 2,
            max_retries: 3,
            max_backoff_secs: None,
        }
    }
}

impl QueueConfig {
    /// Build from stored pairs; missing keys keep their defaults, unknown
    /// keys are ignored.
    pub fn from_pairs<'a, I>(pairs: I) -> Result<Self, DomainError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut config = Self::default();
        for (key, value) in pairs {
            config.apply(key, value)?;
        }
        Ok(config)
    }

    /// Check that `value` is acceptable for `key` without keeping it.
    pub fn validate_entry(key: &str, value: &str) -> Result<(), DomainError> {
        if !KNOWN_KEYS.contains(&key) {
            return Err(DomainError::validation(format!(
                "unknown config key {key:?} (expected one of: {})",
                KNOWN_KEYS.join(", ")
            )));
        }
        Self::default().apply(key, value)
    }

    /// Default values as they are stored.
    pub fn default_pairs() -> Vec<(&'static str, String)> {
        let d = Self::default();
        vec![
            (POLL_INTERVAL_MS, d.poll_interval_ms.to_string()),
            (DEFAULT_TIMEOUT_SECS, d.default_timeout_secs.to_string()),
            (BACKOFF_BASE, d.backoff_base.to_string()),
            (MAX_RETRIES, d.max_retries.to_string()),
        ]
    }

    pub fn to_map(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        map.insert(POLL_INTERVAL_MS.to_string(), self.poll_interval_ms.to_string());
        map.insert(DEFAULT_TIMEOUT_SECS.to_string(), self.default_timeout_secs.to_string());
        map.insert(BACKOFF_BASE.to_string(), self.backoff_base.to_string());
        map.insert(MAX_RETRIES.to_string(), self.max_retries.to_string());
        if let Some(cap) = self.max_backoff_secs {
            map.insert(MAX_BACKOFF_SECS.to_string(), cap.to_string());
        }
        map
    }

    pub fn with_poll_interval_ms(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    pub fn with_default_timeout_secs(mut self, secs: u64) -> Self {
        self.default_timeout_secs = secs;
        self
    }

    pub fn with_backoff_base(mut self, base: u32) -> Self {
        self.backoff_base = base;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            backoff_base: self.backoff_base,
            max_backoff_secs: self.max_backoff_secs,
        }
    }

    fn apply(&mut self, key: &str, value: &str) -> Result<(), DomainError> {
        let value = value.trim();
        match key {
            POLL_INTERVAL_MS => self.poll_interval_ms = parse_positive(key, value)?,
            DEFAULT_TIMEOUT_SECS => self.default_timeout_secs = parse_positive(key, value)?,
            BACKOFF_BASE => {
                self.backoff_base = u32::try_from(parse_positive(key, value)?)
                    .map_err(|_| DomainError::validation(format!("{key} is too large")))?
            }
            MAX_RETRIES => {
                self.max_retries = value.parse().map_err(|_| {
                    DomainError::validation(format!("{key} must be a non-negative integer, got {value:?}"))
                })?
            }
            MAX_BACKOFF_SECS => {
                self.max_backoff_secs = if value.is_empty() {
                    None
                } else {
                    Some(parse_positive(key, value)?)
                }
            }
            _ => {}
        }
        Ok(())
    }
}

fn parse_positive(key: &str, value: &str) -> Result<u64, DomainError> {
    match value.parse::<u64>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(DomainError::validation(format!(
            "{key} must be a positive integer, got {value:?}"
        ))),
    }
}
