//! Time source for stores.
//!
//! Stores persist timestamps at millisecond precision, so every reading is
//! truncated to whole milliseconds before use.

use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, TimeDelta, Utc};

/// Shared, cloneable "now" provider.
#[derive(Clone)]
pub struct Clock {
    now: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>,
}

impl Clock {
    pub fn system() -> Self {
        Self::from_fn(Utc::now)
    }

    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn() -> DateTime<Utc> + Send + Sync + 'static,
    {
        Self { now: Arc::new(f) }
    }

    pub fn now(&self) -> DateTime<Utc> {
        truncate_ms((self.now)())
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::system()
    }
}

impl core::fmt::Debug for Clock {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Clock").field("now", &self.now()).finish()
    }
}

/// A clock that only moves when told to. Intended for tests.
#[derive(Debug, Clone)]
pub struct ManualClock {
    at: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            at: Arc::new(Mutex::new(truncate_ms(start))),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        *self.at.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn advance(&self, by: TimeDelta) {
        let mut at = self.at.lock().unwrap_or_else(PoisonError::into_inner);
        *at += by;
    }

    pub fn clock(&self) -> Clock {
        let at = self.at.clone();
        Clock::from_fn(move || *at.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

pub(crate) fn truncate_ms(at: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(at.timestamp_millis()).unwrap_or(at)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_moves_on_demand() {
        let start = DateTime::from_timestamp(1_700_000_000, 123_456_789).unwrap();
        let manual = ManualClock::new(start);
        let clock = manual.clock();
        assert_eq!(clock.now().timestamp_millis(), start.timestamp_millis());
        assert_eq!(clock.now().timestamp_subsec_nanos(), 123_000_000);

        manual.advance(TimeDelta::seconds(2));
        assert_eq!(clock.now().timestamp_millis(), start.timestamp_millis() + 2_000);
    }
}
