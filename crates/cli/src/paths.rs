//! On-disk layout of a `jobq` data directory.

use std::path::{Path, PathBuf};

use anyhow::Context;

use jobq_worker::LogLayout;

const DB_FILE: &str = "jobq.db";
const LOGS_DIR: &str = "logs";

/// Root holding the database and the per-job log directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Use `explicit` if given, else `<platform data dir>/jobq`.
    pub fn resolve(explicit: Option<PathBuf>) -> anyhow::Result<Self> {
        match explicit {
            Some(root) => Ok(Self::new(root)),
            None => dirs::data_dir()
                .map(|d| Self::new(d.join("jobq")))
                .context("no platform data directory; pass --data-dir or set JOBQ_HOME"),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn db_path(&self) -> PathBuf {
        self.root.join(DB_FILE)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join(LOGS_DIR)
    }

    pub fn log_layout(&self) -> LogLayout {
        LogLayout::new(self.logs_dir())
    }
}
