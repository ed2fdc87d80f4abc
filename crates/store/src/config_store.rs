//! Key-value configuration persisted next to the jobs.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use rusqlite::{Connection, OptionalExtension, params};
use tracing::info;

use jobq_core::QueueConfig;

use crate::error::ConfigError;
use crate::schema;

/// Reads and writes the `config` table. Defaults are seeded on open and
/// never overwrite values a user has set.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref().to_path_buf();
        schema::initialize(&path)?;
        let store = Self { path };
        let conn = store.conn()?;
        for (key, value) in QueueConfig::default_pairs() {
            conn.execute(
                "INSERT OR IGNORE INTO config (key, value) VALUES (?1, ?2)",
                params![key, value],
            )?;
        }
        Ok(store)
    }

    fn conn(&self) -> Result<Connection, ConfigError> {
        Ok(schema::connect(&self.path)?)
    }

    pub fn get(&self, key: &str) -> Result<Option<String>, ConfigError> {
        let value = self
            .conn()?
            .query_row(
                "SELECT value FROM config WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    /// Validate, then upsert.
    pub fn set(&self, key: &str, value: &str) -> Result<(), ConfigError> {
        QueueConfig::validate_entry(key, value)?;
        self.conn()?.execute(
            "INSERT INTO config (key, value) VALUES (?1, ?2) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value.trim()],
        )?;
        info!(key, value, "config updated");
        Ok(())
    }

    pub fn all(&self) -> Result<BTreeMap<String, String>, ConfigError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT key, value FROM config ORDER BY key")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        Ok(rows.collect::<rusqlite::Result<BTreeMap<String, String>>>()?)
    }

    /// Typed view of the stored values.
    pub fn load(&self) -> Result<QueueConfig, ConfigError> {
        let all = self.all()?;
        Ok(QueueConfig::from_pairs(
            all.iter().map(|(k, v)| (k.as_str(), v.as_str())),
        )?)
    }
}
