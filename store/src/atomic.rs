//! Atomic file writes with a configurable fsync policy.

use crate::StoreError;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

/// Durability policy applied by the stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsyncPolicy {
    /// Never fsync; rely on the OS cache.
    None,
    /// Fsync once per batch of appends.
    Batch,
    /// Fsync after every write.
    Always,
}

impl FsyncPolicy {
    /// Parse the configuration string form (`none|batch|always`); unknown
    /// values fall back to `none`.
    pub fn parse(text: &str) -> Self {
        match text.trim().to_ascii_lowercase().as_str() {
            "always" => FsyncPolicy::Always,
            "batch" => FsyncPolicy::Batch,
            _ => FsyncPolicy::None,
        }
    }
}

/// Write `bytes` to `path` via a temp file and rename on the same
/// filesystem. The rename makes the new content visible atomically.
pub fn write_atomic(path: &Path, bytes: &[u8], policy: FsyncPolicy) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)?;
        file.write_all(bytes)?;
        if policy != FsyncPolicy::None {
            file.sync_data()?;
        }
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Sync an append handle according to policy after a batch boundary.
pub(crate) fn sync_batch(file: &File, policy: FsyncPolicy) -> std::io::Result<()> {
    match policy {
        FsyncPolicy::None => Ok(()),
        FsyncPolicy::Batch | FsyncPolicy::Always => file.sync_data(),
    }
}
