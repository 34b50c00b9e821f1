//! Append-only journal: newline-delimited canonical JSON events.

use crate::atomic::sync_batch;
use crate::{FsyncPolicy, StoreError};
use autocap_spec::JournalEvent;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Single-writer journal over `journal.ndjson`.
pub struct JournalWriter {
    path: PathBuf,
    policy: FsyncPolicy,
    file: Mutex<BufWriter<File>>,
}

impl JournalWriter {
    /// Open (or create) the journal file for appending. A partial
    /// trailing line from a crash is newline-terminated so later appends
    /// never merge into it.
    pub fn open(path: &Path, policy: FsyncPolicy) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        terminate_partial_line(path)?;
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(JournalWriter {
            path: path.to_path_buf(),
            policy,
            file: Mutex::new(BufWriter::new(file)),
        })
    }

    /// Append one event. Flushes the line; fsyncs under `always`.
    pub fn append(&self, event: &JournalEvent) -> Result<(), StoreError> {
        let span = tracing::info_span!("journal_append", event_type = %event.event_type);
        let _guard = span.enter();
        let mut writer = self.file.lock();
        writer.write_all(event.to_line().as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        if self.policy == FsyncPolicy::Always {
            writer.get_ref().sync_data()?;
        }
        Ok(())
    }

    /// Append a batch of events with a single fsync boundary.
    pub fn append_batch(&self, events: &[JournalEvent]) -> Result<(), StoreError> {
        let mut writer = self.file.lock();
        for event in events {
            writer.write_all(event.to_line().as_bytes())?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        sync_batch(writer.get_ref(), self.policy)?;
        Ok(())
    }

    /// Read every parseable event back. Partial trailing lines (from a
    /// crash mid-append) are skipped, not errors.
    pub fn read_all(&self) -> Result<Vec<JournalEvent>, StoreError> {
        read_events(&self.path)
    }

    /// Journal file path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Newline-terminate a file whose last byte is not `\n` (crash residue).
pub(crate) fn terminate_partial_line(path: &Path) -> std::io::Result<()> {
    if !path.exists() {
        return Ok(());
    }
    let metadata = std::fs::metadata(path)?;
    if metadata.len() == 0 {
        return Ok(());
    }
    let mut file = OpenOptions::new().read(true).append(true).open(path)?;
    use std::io::{Read, Seek, SeekFrom};
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    if last[0] != b'\n' {
        file.write_all(b"\n")?;
    }
    Ok(())
}

/// Read events from a journal file without taking the writer lock.
pub fn read_events(path: &Path) -> Result<Vec<JournalEvent>, StoreError> {
    let mut out = Vec::new();
    if !path.exists() {
        return Ok(out);
    }
    let reader = BufReader::new(File::open(path)?);
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<JournalEvent>(&line) {
            Ok(event) => out.push(event),
            Err(err) => tracing::warn!(error = %err, "skipping unparseable journal line"),
        }
    }
    Ok(out)
}
