//! Boot-time recovery: archive orphaned `.tmp` spool files, reconcile
//! segment seals against the ledger, sweep content digests, and detect
//! crash loops.

use crate::{EventBuilder, MediaStore, MetadataStore, StoreError};
use autocap_spec::{prefixed_id, with_payload_hash};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Counts produced by a recovery pass.
#[derive(Debug, Default, Clone, Serialize)]
pub struct RecoveryReport {
    /// `.tmp` files moved under `recovery/archived_tmp/`.
    pub archived_tmp_count: usize,
    /// Segments whose missing seal was synthesized.
    pub sealed_count: usize,
    /// Segment records whose media blob is gone.
    pub missing_media_count: usize,
    /// Records whose stored digest no longer matches their blob.
    pub stale_count: usize,
    /// Sample ids for the summary event.
    pub archived_samples: Vec<String>,
    /// Sample ids of synthesized seals.
    pub sealed_samples: Vec<String>,
    /// Sample ids of missing-media records.
    pub missing_media_samples: Vec<String>,
}

impl RecoveryReport {
    fn any(&self) -> bool {
        self.archived_tmp_count > 0
            || self.sealed_count > 0
            || self.missing_media_count > 0
            || self.stale_count > 0
    }
}

/// Run the full recovery pass. `roots` are the storage directories to scan
/// for orphaned `.tmp` files; archived files land under
/// `data_dir/recovery/archived_tmp/<ts>/` and are never deleted.
pub fn run_recovery(
    data_dir: &Path,
    roots: &[PathBuf],
    metadata: &MetadataStore,
    media: &MediaStore,
    builder: &EventBuilder,
) -> Result<RecoveryReport, StoreError> {
    let mut report = RecoveryReport::default();
    let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S").to_string();
    let archive_root = data_dir.join("recovery").join("archived_tmp").join(&stamp);

    let mut unique_roots: Vec<&PathBuf> = roots.iter().collect();
    unique_roots.sort();
    unique_roots.dedup();
    for root in unique_roots {
        if !root.exists() {
            continue;
        }
        archive_tmp_files(root, root, &archive_root, data_dir, &mut report)?;
    }

    let sealed = sealed_segment_ids(builder)?;
    let mut unavailable_seq = 0u64;
    for (segment_id, record) in metadata.records_of_type("evidence.capture.segment")? {
        if sealed.contains(&segment_id) {
            continue;
        }
        if !media.exists(&segment_id) {
            report.missing_media_count += 1;
            if report.missing_media_samples.len() < 5 {
                report.missing_media_samples.push(segment_id.clone());
            }
            write_unavailable(
                metadata,
                builder,
                &segment_id,
                "missing_media",
                &mut unavailable_seq,
            )?;
            continue;
        }
        let ts_utc = record
            .get("ts_end_utc")
            .or_else(|| record.get("ts_utc"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(autocap_spec::now_utc);
        let seal_payload = json!({
            "event": "segment.sealed",
            "segment_id": segment_id,
            "content_hash": record.get("content_hash").cloned().unwrap_or(Value::Null),
            "payload_hash": record.get("payload_hash").cloned().unwrap_or(Value::Null),
            "recovered": true,
        });
        builder.journal_event_at("segment.sealed", seal_payload.clone(), &ts_utc, None)?;
        builder.ledger_entry_at(
            "segment.seal",
            vec![segment_id.clone()],
            vec![],
            seal_payload,
            &ts_utc,
        )?;
        report.sealed_count += 1;
        if report.sealed_samples.len() < 5 {
            report.sealed_samples.push(segment_id.clone());
        }
    }

    // Integrity sweep: recompute digests for everything that claims one.
    for encoded in metadata.keys()? {
        let Some(mut record) = metadata.get_encoded(&encoded)? else {
            continue;
        };
        let Some(expected) = record.get("content_hash").and_then(Value::as_str) else {
            continue;
        };
        let record_id = record
            .get("segment_id")
            .or_else(|| record.get("record_id"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or(encoded.clone());
        if !media.exists(&record_id) {
            continue;
        }
        let actual = media.digest(&record_id)?;
        if actual != expected {
            tracing::warn!(record_id = %record_id, "content digest mismatch; marking stale");
            report.stale_count += 1;
            if let Some(map) = record.as_object_mut() {
                map.insert("stale".to_string(), Value::Bool(true));
            }
            metadata.put_replace(&record_id, &record)?;
            write_unavailable(
                metadata,
                builder,
                &record_id,
                "checksum_mismatch",
                &mut unavailable_seq,
            )?;
        }
    }

    if report.any() {
        let mut payload = json!({"event": "storage.recovery"});
        let map = payload.as_object_mut().unwrap_or_else(|| unreachable!());
        if report.archived_tmp_count > 0 {
            map.insert("archived_tmp_count".into(), json!(report.archived_tmp_count));
            map.insert("archived_samples".into(), json!(report.archived_samples));
        }
        if report.sealed_count > 0 {
            map.insert("sealed_count".into(), json!(report.sealed_count));
            map.insert("sealed_samples".into(), json!(report.sealed_samples));
        }
        if report.missing_media_count > 0 {
            map.insert("missing_media_count".into(), json!(report.missing_media_count));
            map.insert(
                "missing_media_samples".into(),
                json!(report.missing_media_samples),
            );
        }
        if report.stale_count > 0 {
            map.insert("stale_count".into(), json!(report.stale_count));
        }
        let ts = autocap_spec::now_utc();
        builder.journal_event_at("storage.recovery", payload.clone(), &ts, None)?;
        builder.ledger_entry_at("storage.recovery", vec![], vec![], payload, &ts)?;
    }
    Ok(report)
}

fn sealed_segment_ids(builder: &EventBuilder) -> Result<HashSet<String>, StoreError> {
    let mut sealed = HashSet::new();
    for entry in crate::ledger::read_entries(builder.ledger_path())? {
        let Some(payload) = entry.payload.as_object() else {
            continue;
        };
        if payload.get("event").and_then(Value::as_str) == Some("segment.sealed") {
            if let Some(segment_id) = payload.get("segment_id").and_then(Value::as_str) {
                sealed.insert(segment_id.to_string());
            }
        }
    }
    Ok(sealed)
}

fn archive_tmp_files(
    root: &Path,
    dir: &Path,
    archive_root: &Path,
    data_dir: &Path,
    report: &mut RecoveryReport,
) -> Result<(), StoreError> {
    let recovery_dir = data_dir.join("recovery");
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.starts_with(&recovery_dir) {
            continue;
        }
        if path.is_dir() {
            archive_tmp_files(root, &path, archive_root, data_dir, report)?;
            continue;
        }
        if path.extension().and_then(|ext| ext.to_str()) != Some("tmp") {
            continue;
        }
        let rel = path
            .strip_prefix(root)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err))?;
        let root_name = root
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "root".to_string());
        let dest = archive_root.join(root_name).join(rel);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::rename(&path, &dest)?;
        report.archived_tmp_count += 1;
        if report.archived_samples.len() < 5 {
            report
                .archived_samples
                .push(path.to_string_lossy().into_owned());
        }
    }
    Ok(())
}

fn write_unavailable(
    metadata: &MetadataStore,
    builder: &EventBuilder,
    parent_id: &str,
    reason: &str,
    seq: &mut u64,
) -> Result<(), StoreError> {
    let record_id = prefixed_id(builder.run_id(), "evidence.capture.unavailable", *seq);
    *seq += 1;
    let record = with_payload_hash(json!({
        "record_type": "evidence.capture.unavailable",
        "record_id": record_id,
        "parent_evidence_id": parent_id,
        "reason": reason,
        "ts_utc": autocap_spec::now_utc(),
    }))
    .map_err(|_| StoreError::Missing(parent_id.to_string()))?;
    match metadata.put_new(&record_id, &record) {
        Ok(()) => Ok(()),
        Err(StoreError::AlreadyExists(_)) => Ok(()),
        Err(err) => Err(err),
    }
}

/// Persistent crash counter: a boot that finds run state `running` records
/// a crash; too many crashes inside the window force safe mode.
#[derive(Debug, Serialize, Deserialize, Default)]
pub struct CrashLoopDetector {
    crashes: Vec<String>,
}

impl CrashLoopDetector {
    /// Load the crash history from `data_dir/crash_history.json`.
    pub fn load(data_dir: &Path) -> Self {
        let path = Self::path(data_dir);
        std::fs::read(path)
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .unwrap_or_default()
    }

    /// Record a crash at `now` and persist.
    pub fn record_crash(&mut self, data_dir: &Path, now_utc: &str) -> Result<(), StoreError> {
        self.crashes.push(now_utc.to_string());
        let bytes = serde_json::to_vec(self)?;
        crate::write_atomic(&Self::path(data_dir), &bytes, crate::FsyncPolicy::Always)
    }

    /// Whether `max_crashes` or more crashes happened within `window_s`
    /// before `now`.
    pub fn is_crash_loop(&self, now_utc: &str, window_s: i64, max_crashes: usize) -> bool {
        let Ok(now) = chrono::DateTime::parse_from_rfc3339(now_utc) else {
            return false;
        };
        let recent = self
            .crashes
            .iter()
            .filter_map(|ts| chrono::DateTime::parse_from_rfc3339(ts).ok())
            .filter(|ts| (now - *ts).num_seconds() <= window_s)
            .count();
        recent >= max_crashes
    }

    fn path(data_dir: &Path) -> PathBuf {
        data_dir.join("crash_history.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FsyncPolicy, JournalWriter, LedgerWriter};
    use std::sync::Arc;

    fn fixture(dir: &Path) -> (EventBuilder, MetadataStore, MediaStore) {
        let journal = Arc::new(
            JournalWriter::open(&dir.join("journal.ndjson"), FsyncPolicy::None).unwrap(),
        );
        let ledger =
            Arc::new(LedgerWriter::open(&dir.join("ledger.ndjson"), FsyncPolicy::None).unwrap());
        let builder = EventBuilder::new("run-r".into(), journal, ledger, None, 64, &json!({}));
        let metadata = MetadataStore::open(&dir.join("metadata"), FsyncPolicy::None).unwrap();
        let media = MediaStore::open(&dir.join("media"), FsyncPolicy::None).unwrap();
        (builder, metadata, media)
    }

    #[test]
    fn tmp_files_are_archived_not_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let (builder, metadata, media) = fixture(dir.path());
        let spool = dir.path().join("spool");
        std::fs::create_dir_all(&spool).unwrap();
        std::fs::write(spool.join("segment_0.avi.tmp"), b"partial").unwrap();

        let report = run_recovery(dir.path(), &[spool.clone()], &metadata, &media, &builder).unwrap();
        assert_eq!(report.archived_tmp_count, 1);
        assert!(!spool.join("segment_0.avi.tmp").exists());
        let archived: Vec<_> = walkdir(&dir.path().join("recovery"));
        assert_eq!(archived.len(), 1);
        assert!(archived[0].ends_with("segment_0.avi.tmp"));
    }

    #[test]
    fn unsealed_segment_with_media_gets_recovered_seal() {
        let dir = tempfile::tempdir().unwrap();
        let (builder, metadata, media) = fixture(dir.path());
        let segment_id = "run-r/evidence.capture.segment/0";
        let digest = media.put(segment_id, b"media-bytes").unwrap();
        metadata
            .put_new(
                segment_id,
                &json!({
                    "record_type": "evidence.capture.segment",
                    "segment_id": segment_id,
                    "content_hash": digest,
                    "ts_end_utc": "2026-01-01T00:00:00+00:00",
                }),
            )
            .unwrap();
        let report = run_recovery(dir.path(), &[], &metadata, &media, &builder).unwrap();
        assert_eq!(report.sealed_count, 1);
        let entries = builder_entries(&builder);
        let seal = entries
            .iter()
            .find(|entry| entry.stage == "segment.seal")
            .unwrap();
        assert_eq!(seal.payload["recovered"], json!(true));
    }

    #[test]
    fn missing_media_yields_unavailable_record() {
        let dir = tempfile::tempdir().unwrap();
        let (builder, metadata, media) = fixture(dir.path());
        let segment_id = "run-r/evidence.capture.segment/1";
        metadata
            .put_new(
                segment_id,
                &json!({"record_type": "evidence.capture.segment", "segment_id": segment_id}),
            )
            .unwrap();
        let report = run_recovery(dir.path(), &[], &metadata, &media, &builder).unwrap();
        assert_eq!(report.missing_media_count, 1);
        let unavailable = metadata.records_of_type("evidence.capture.unavailable").unwrap();
        assert_eq!(unavailable.len(), 1);
        assert_eq!(unavailable[0].1["parent_evidence_id"], json!(segment_id));
    }

    #[test]
    fn crash_loop_triggers_at_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let mut detector = CrashLoopDetector::load(dir.path());
        let now = "2026-01-01T00:10:00+00:00";
        detector.record_crash(dir.path(), "2026-01-01T00:01:00+00:00").unwrap();
        detector.record_crash(dir.path(), "2026-01-01T00:05:00+00:00").unwrap();
        assert!(!detector.is_crash_loop(now, 600, 3));
        detector.record_crash(dir.path(), "2026-01-01T00:09:00+00:00").unwrap();
        assert!(detector.is_crash_loop(now, 600, 3));
        // Old crashes age out of the window.
        assert!(!detector.is_crash_loop("2026-01-01T02:00:00+00:00", 600, 3));
    }

    fn builder_entries(builder: &EventBuilder) -> Vec<autocap_spec::LedgerEntry> {
        crate::ledger::read_entries(builder.ledger_path()).unwrap()
    }

    fn walkdir(root: &Path) -> Vec<String> {
        let mut out = Vec::new();
        if !root.exists() {
            return out;
        }
        let mut stack = vec![root.to_path_buf()];
        while let Some(dir) = stack.pop() {
            for entry in std::fs::read_dir(dir).unwrap() {
                let path = entry.unwrap().path();
                if path.is_dir() {
                    stack.push(path);
                } else {
                    out.push(path.to_string_lossy().into_owned());
                }
            }
        }
        out
    }
}
