//! Append-only audit log (`audit.ndjson`): mode changes, force stops,
//! fixture overrides, and plugin capability invocations.

use crate::StoreError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

/// One audit row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Action name, e.g. `runtime.force_stop` or `plugin.exec`.
    pub action: String,
    /// Component that performed the action.
    pub actor: String,
    /// Outcome: `ok`, `warn`, `noop`, or `error`.
    pub outcome: String,
    /// UTC timestamp (RFC 3339).
    pub ts_utc: String,
    /// Action-specific details.
    pub details: Value,
}

/// Single-writer audit appender.
pub struct AuditLog {
    path: PathBuf,
    file: Mutex<BufWriter<File>>,
}

impl AuditLog {
    /// Open (or create) the audit log.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(AuditLog {
            path: path.to_path_buf(),
            file: Mutex::new(BufWriter::new(file)),
        })
    }

    /// Append one row.
    pub fn append(
        &self,
        action: &str,
        actor: &str,
        outcome: &str,
        details: Value,
    ) -> Result<(), StoreError> {
        let event = AuditEvent {
            action: action.to_string(),
            actor: actor.to_string(),
            outcome: outcome.to_string(),
            ts_utc: autocap_spec::now_utc(),
            details,
        };
        let mut file = self.file.lock();
        file.write_all(serde_json::to_string(&event)?.as_bytes())?;
        file.write_all(b"\n")?;
        file.flush()?;
        Ok(())
    }

    /// Read every parseable row back.
    pub fn read_all(&self) -> Result<Vec<AuditEvent>, StoreError> {
        let mut out = Vec::new();
        if !self.path.exists() {
            return Ok(out);
        }
        for line in BufReader::new(File::open(&self.path)?).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            if let Ok(event) = serde_json::from_str(&line) {
                out.push(event);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn append_and_read_rows() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::open(&dir.path().join("audit.ndjson")).unwrap();
        log.append("runtime.mode_change", "runtime.conductor", "ok", json!({"mode": "IDLE_DRAIN"}))
            .unwrap();
        log.append("runtime.force_stop", "runtime.scheduler", "ok", json!({"removed_jobs": 2}))
            .unwrap();
        let rows = log.read_all().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].action, "runtime.force_stop");
    }
}
