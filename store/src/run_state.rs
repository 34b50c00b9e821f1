//! Run state file and the single-instance advisory lock.

use crate::{write_atomic, FsyncPolicy, StoreError};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

/// Lifecycle state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    /// Process is live and writing.
    Running,
    /// Process shut down cleanly.
    Stopped,
    /// Recovery stamped the previous run as crashed.
    Crashed,
}

/// Contents of `run_state.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStateFile {
    /// Run the state belongs to.
    pub run_id: String,
    /// Lifecycle state.
    pub state: RunState,
    /// UTC timestamp the file was last written.
    pub ts_utc: String,
    /// When the run started.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    /// When the run stopped, for clean shutdowns.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<String>,
    /// Ledger head at the time of writing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ledger_head: Option<String>,
}

impl RunStateFile {
    /// Load the run state, or `None` when absent or unparseable.
    pub fn load(data_dir: &Path) -> Option<RunStateFile> {
        let path = data_dir.join("run_state.json");
        let bytes = std::fs::read(path).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    /// Persist atomically to `data_dir/run_state.json`.
    pub fn store(&self, data_dir: &Path) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(self)?;
        write_atomic(&data_dir.join("run_state.json"), &bytes, FsyncPolicy::Always)
    }
}

/// Exclusive advisory lock on `data_dir/instance.lock`. Exactly one
/// process may hold it; a second boot fails instead of corrupting the
/// single-writer stores.
#[derive(Debug)]
pub struct InstanceLock {
    _file: File,
    path: PathBuf,
}

impl InstanceLock {
    /// Acquire the lock, failing fast when another process holds it.
    pub fn acquire(data_dir: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(data_dir)?;
        let path = data_dir.join("instance.lock");
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&path)?;
        file.try_lock_exclusive()
            .map_err(|_| StoreError::InstanceLocked { path: path.clone() })?;
        Ok(InstanceLock { _file: file, path })
    }

    /// Lock file path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}
