//! `jobq-store`: persistence for jobs, runs, and configuration.
//!
//! [`SqliteJobStore`] is the durable backend shared by every worker process;
//! [`InMemoryJobStore`] implements the same [`JobStore`] contract for tests.

pub mod clock;
pub mod config_store;
pub mod error;
pub mod memory;
mod schema;
pub mod sqlite;
pub mod store;

#[cfg(test)]
mod contract;

pub use clock::{Clock, ManualClock};
pub use config_store::ConfigStore;
pub use error::{ConfigError, JobStoreError};
pub use memory::InMemoryJobStore;
pub use sqlite::SqliteJobStore;
pub use store::{AttemptCount, JobStore};
