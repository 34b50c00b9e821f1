//! Event builder: assembles canonical journal events and ledger entries
//! with run-scoped sequence ids, and anchors the ledger head on a cadence.

use crate::{AnchorWriter, JournalWriter, LedgerWriter, StoreError};
use autocap_spec::{prefixed_id, sha256_canonical, JournalEvent};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Builder shared by every subsystem that records evidence.
pub struct EventBuilder {
    run_id: String,
    tzid: String,
    offset_minutes: i32,
    journal: Arc<JournalWriter>,
    ledger: Arc<LedgerWriter>,
    anchor: Option<Arc<AnchorWriter>>,
    anchor_interval: u64,
    policy_snapshot_hash: String,
    seqs: Mutex<HashMap<String, u64>>,
}

impl EventBuilder {
    /// Wire a builder over the journal, ledger, and optional anchor store.
    pub fn new(
        run_id: String,
        journal: Arc<JournalWriter>,
        ledger: Arc<LedgerWriter>,
        anchor: Option<Arc<AnchorWriter>>,
        anchor_interval: u64,
        policy_snapshot: &Value,
    ) -> Self {
        let offset = chrono::Local::now().offset().local_minus_utc() / 60;
        EventBuilder {
            run_id,
            tzid: host_tzid(),
            offset_minutes: offset,
            journal,
            ledger,
            anchor,
            anchor_interval: anchor_interval.max(1),
            policy_snapshot_hash: sha256_canonical(policy_snapshot),
            seqs: Mutex::new(HashMap::new()),
        }
    }

    /// Run this builder writes for.
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Hash of the effective policy subtree, stamped into capture records.
    pub fn policy_snapshot_hash(&self) -> &str {
        &self.policy_snapshot_hash
    }

    /// Append a journal event with a fresh run-scoped event id.
    pub fn journal_event(&self, event_type: &str, payload: Value) -> Result<String, StoreError> {
        let ts = autocap_spec::now_utc();
        self.journal_event_at(event_type, payload, &ts, None)
    }

    /// Append a journal event with an explicit timestamp and optional
    /// caller-supplied event id (used by segment sealing so the event id
    /// equals the segment id).
    pub fn journal_event_at(
        &self,
        event_type: &str,
        payload: Value,
        ts_utc: &str,
        event_id: Option<&str>,
    ) -> Result<String, StoreError> {
        let event_id = match event_id {
            Some(id) => id.to_string(),
            None => {
                let seq = self.next_seq(event_type);
                prefixed_id(&self.run_id, event_type, seq)
            }
        };
        let event = JournalEvent {
            event_id: event_id.clone(),
            event_type: event_type.to_string(),
            ts_utc: ts_utc.to_string(),
            payload,
            run_id: self.run_id.clone(),
            tzid: self.tzid.clone(),
            offset_minutes: self.offset_minutes,
        };
        self.journal.append(&event)?;
        Ok(event_id)
    }

    /// Append a ledger entry bound to the current head; anchors the head
    /// every `anchor_interval` entries when an anchor store is wired.
    pub fn ledger_entry(
        &self,
        stage: &str,
        inputs: Vec<String>,
        outputs: Vec<String>,
        payload: Value,
    ) -> Result<String, StoreError> {
        let ts = autocap_spec::now_utc();
        self.ledger_entry_at(stage, inputs, outputs, payload, &ts)
    }

    /// Append a ledger entry with an explicit timestamp.
    pub fn ledger_entry_at(
        &self,
        stage: &str,
        inputs: Vec<String>,
        outputs: Vec<String>,
        payload: Value,
        ts_utc: &str,
    ) -> Result<String, StoreError> {
        let hash = self.ledger.append(stage, inputs, outputs, payload, ts_utc)?;
        if let Some(anchor) = &self.anchor {
            if self.ledger.entries_since_anchor() >= self.anchor_interval {
                match anchor.record(&hash, ts_utc) {
                    Ok(_) => self.ledger.mark_anchored(),
                    Err(err) => tracing::warn!(error = %err, "anchor attestation failed"),
                }
            }
        }
        Ok(hash)
    }

    /// Current ledger head.
    pub fn ledger_head(&self) -> Option<String> {
        self.ledger.head()
    }

    /// Path of the underlying ledger file (read-side consumers).
    pub fn ledger_path(&self) -> &std::path::Path {
        self.ledger.path()
    }

    /// Path of the underlying journal file (read-side consumers).
    pub fn journal_path(&self) -> &std::path::Path {
        self.journal.path()
    }

    fn next_seq(&self, event_type: &str) -> u64 {
        let mut seqs = self.seqs.lock();
        let seq = seqs.entry(event_type.to_string()).or_insert(0);
        let current = *seq;
        *seq += 1;
        current
    }
}

// Host timezone id from the environment; UTC when unset.
fn host_tzid() -> String {
    std::env::var("TZ").unwrap_or_else(|_| "UTC".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FsyncPolicy;
    use serde_json::json;

    fn builder(dir: &std::path::Path) -> EventBuilder {
        let journal =
            Arc::new(JournalWriter::open(&dir.join("journal.ndjson"), FsyncPolicy::None).unwrap());
        let ledger =
            Arc::new(LedgerWriter::open(&dir.join("ledger.ndjson"), FsyncPolicy::None).unwrap());
        EventBuilder::new(
            "run-test".into(),
            journal,
            ledger,
            None,
            64,
            &json!({"privacy": {}}),
        )
    }

    #[test]
    fn sequences_are_per_event_type() {
        let dir = tempfile::tempdir().unwrap();
        let builder = builder(dir.path());
        let a = builder.journal_event("capture.drop", json!({})).unwrap();
        let b = builder.journal_event("capture.drop", json!({})).unwrap();
        let c = builder.journal_event("disk.pressure", json!({})).unwrap();
        assert_eq!(a, "run-test/capture.drop/0");
        assert_eq!(b, "run-test/capture.drop/1");
        assert_eq!(c, "run-test/disk.pressure/0");
    }

    #[test]
    fn ledger_entries_chain_through_builder() {
        let dir = tempfile::tempdir().unwrap();
        let builder = builder(dir.path());
        let first = builder
            .ledger_entry("system", vec![], vec![], json!({"event": "system.start"}))
            .unwrap();
        let second = builder
            .ledger_entry("capture", vec![], vec![], json!({}))
            .unwrap();
        assert_ne!(first, second);
        assert_eq!(builder.ledger_head(), Some(second));
    }

    #[test]
    fn anchor_fires_on_interval() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Arc::new(
            JournalWriter::open(&dir.path().join("journal.ndjson"), FsyncPolicy::None).unwrap(),
        );
        let ledger = Arc::new(
            LedgerWriter::open(&dir.path().join("ledger.ndjson"), FsyncPolicy::None).unwrap(),
        );
        let anchor_path = dir.path().join("outside").join("anchors.ndjson");
        let anchor = Arc::new(AnchorWriter::open(&anchor_path).unwrap());
        let builder = EventBuilder::new("run".into(), journal, ledger, Some(anchor), 2, &json!({}));
        builder.ledger_entry("system", vec![], vec![], json!({})).unwrap();
        builder.ledger_entry("system", vec![], vec![], json!({})).unwrap();
        let lines = std::fs::read_to_string(anchor_path).unwrap();
        assert_eq!(lines.lines().count(), 1);
    }
}
