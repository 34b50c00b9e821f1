//! Lossless screenshot frames (`evidence.capture.frame`).
//!
//! Frames arrive already PNG-encoded from a platform source plugin. Each
//! stored frame is content addressed, carries a pixel hash and dedupe
//! marks, and is journaled. Under `mark_only`, duplicates are annotated
//! but never dropped.

use crate::dedupe::{DedupePolicy, FrameDeduper};
use crate::CaptureError;
use autocap_spec::{prefixed_id, with_payload_hash};
use autocap_store::{EventBuilder, MediaStore, MetadataStore};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;

/// Writes screenshot frames as evidence records.
pub struct FrameRecorder {
    media: Arc<MediaStore>,
    metadata: Arc<MetadataStore>,
    builder: Arc<EventBuilder>,
    deduper: FrameDeduper,
    seq: u64,
}

/// Outcome of recording one frame.
#[derive(Debug, Clone)]
pub struct FrameOutcome {
    /// Record id when the frame was stored; `None` when dedupe dropped it.
    pub record_id: Option<String>,
    /// Whether the frame matched the previous fingerprint.
    pub duplicate: bool,
}

impl FrameRecorder {
    /// Recorder over the storage capabilities.
    pub fn new(
        media: Arc<MediaStore>,
        metadata: Arc<MetadataStore>,
        builder: Arc<EventBuilder>,
        deduper: FrameDeduper,
    ) -> Self {
        FrameRecorder {
            media,
            metadata,
            builder,
            deduper,
            seq: 0,
        }
    }

    /// Store one PNG frame. `pixel_bytes` are the raw decoded pixels used
    /// for the pixel hash; the PNG bytes are what lands in media storage.
    pub fn record(
        &mut self,
        png_bytes: &[u8],
        pixel_bytes: &[u8],
        width: u32,
        height: u32,
    ) -> Result<FrameOutcome, CaptureError> {
        let now = Instant::now();
        let decision = self.deduper.decide(png_bytes, now);
        if !decision.store {
            // Only drop_exact reaches here; mark_only always stores.
            return Ok(FrameOutcome {
                record_id: None,
                duplicate: true,
            });
        }
        let record_id = prefixed_id(self.builder.run_id(), "evidence.capture.frame", self.seq);
        self.seq += 1;

        let write_start = Instant::now();
        let content_hash = self.media.put(&record_id, png_bytes)?;
        let write_ms = write_start.elapsed().as_millis() as u64;

        let ts_utc = autocap_spec::now_utc();
        let record = with_payload_hash(json!({
            "record_type": "evidence.capture.frame",
            "record_id": record_id,
            "ts_utc": ts_utc,
            "width": width,
            "height": height,
            "format": "png",
            "content_hash": content_hash,
            "pixel_hash": autocap_spec::sha256_hex(pixel_bytes),
            "dedupe": {
                "enabled": self.deduper.enabled(),
                "hash": decision.fingerprint,
                "duplicate": decision.duplicate,
                "policy": match self.deduper.policy() {
                    DedupePolicy::MarkOnly => "mark_only",
                    DedupePolicy::DropExact => "drop_exact",
                },
            },
            "write_ms": write_ms,
        }))
        .map_err(|err| CaptureError::Container(err.to_string()))?;
        self.metadata.put_new(&record_id, &record)?;
        self.builder
            .journal_event_at("capture.frame", record, &ts_utc, Some(&record_id))?;
        Ok(FrameOutcome {
            record_id: Some(record_id),
            duplicate: decision.duplicate,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedupe::FingerprintAlgo;
    use autocap_store::{FsyncPolicy, JournalWriter, LedgerWriter};
    use std::path::Path;

    fn recorder(dir: &Path, policy: DedupePolicy) -> (FrameRecorder, Arc<MetadataStore>) {
        let journal = Arc::new(
            JournalWriter::open(&dir.join("journal.ndjson"), FsyncPolicy::None).unwrap(),
        );
        let ledger =
            Arc::new(LedgerWriter::open(&dir.join("ledger.ndjson"), FsyncPolicy::None).unwrap());
        let builder = Arc::new(EventBuilder::new(
            "run-f".into(),
            journal,
            ledger,
            None,
            64,
            &json!({}),
        ));
        let media = Arc::new(MediaStore::open(&dir.join("media"), FsyncPolicy::None).unwrap());
        let metadata =
            Arc::new(MetadataStore::open(&dir.join("metadata"), FsyncPolicy::None).unwrap());
        let deduper = FrameDeduper::new(true, FingerprintAlgo::Blake3, policy, 0, 0.0);
        (
            FrameRecorder::new(media, Arc::clone(&metadata), builder, deduper),
            metadata,
        )
    }

    #[test]
    fn mark_only_stores_duplicates_with_marks() {
        let dir = tempfile::tempdir().unwrap();
        let (mut recorder, metadata) = recorder(dir.path(), DedupePolicy::MarkOnly);
        let first = recorder.record(b"png-bytes", b"pixels", 1, 1).unwrap();
        let second = recorder.record(b"png-bytes", b"pixels", 1, 1).unwrap();
        assert!(!first.duplicate);
        assert!(second.duplicate);
        assert!(second.record_id.is_some());
        let frames = metadata.records_of_type("evidence.capture.frame").unwrap();
        assert_eq!(frames.len(), 2);
        let marked = frames
            .iter()
            .filter(|(_, record)| record["dedupe"]["duplicate"] == json!(true))
            .count();
        assert_eq!(marked, 1);
    }

    #[test]
    fn drop_exact_skips_duplicate_storage() {
        let dir = tempfile::tempdir().unwrap();
        let (mut recorder, metadata) = recorder(dir.path(), DedupePolicy::DropExact);
        recorder.record(b"png-bytes", b"pixels", 1, 1).unwrap();
        let second = recorder.record(b"png-bytes", b"pixels", 1, 1).unwrap();
        assert!(second.record_id.is_none());
        assert_eq!(
            metadata.records_of_type("evidence.capture.frame").unwrap().len(),
            1
        );
    }

    #[test]
    fn frame_records_carry_both_hashes() {
        let dir = tempfile::tempdir().unwrap();
        let (mut recorder, metadata) = recorder(dir.path(), DedupePolicy::MarkOnly);
        let outcome = recorder.record(b"png-bytes", b"raw-pixels", 2, 2).unwrap();
        let record = metadata.get(&outcome.record_id.unwrap()).unwrap().unwrap();
        assert_eq!(
            record["content_hash"].as_str().unwrap(),
            autocap_spec::sha256_hex(b"png-bytes")
        );
        assert_eq!(
            record["pixel_hash"].as_str().unwrap(),
            autocap_spec::sha256_hex(b"raw-pixels")
        );
        assert!(autocap_spec::records::payload_hash_valid(&record));
    }
}
