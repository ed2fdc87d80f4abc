//! Per-job log file layout.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use jobq_core::JobId;

/// Directory holding `<job_id>.stdout.log` / `<job_id>.stderr.log` pairs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLayout {
    dir: PathBuf,
}

/// The two log files of one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogPaths {
    pub stdout: PathBuf,
    pub stderr: PathBuf,
}

impl LogLayout {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn log_paths_for(&self, id: &JobId) -> LogPaths {
        LogPaths {
            stdout: self.dir.join(format!("{id}.stdout.log")),
            stderr: self.dir.join(format!("{id}.stderr.log")),
        }
    }

    pub fn ensure_dir(&self) -> io::Result<()> {
        fs::create_dir_all(&self.dir)
    }
}

impl LogPaths {
    /// Current sizes in bytes; a missing file counts as empty.
    pub fn sizes(&self) -> (u64, u64) {
        (file_len(&self.stdout), file_len(&self.stderr))
    }

    pub(crate) fn open_stdout(&self) -> io::Result<File> {
        open_append(&self.stdout)
    }

    pub(crate) fn open_stderr(&self) -> io::Result<File> {
        open_append(&self.stderr)
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

fn file_len(path: &Path) -> u64 {
    fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}
