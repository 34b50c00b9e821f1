//! Journal event and ledger entry schema.
//!
//! Ledger entries are hash chained: each entry's `hash` is the SHA-256 of
//! the canonical JSON of the entry with the `hash` field omitted, and
//! `prev_hash` binds to the previous chain head. Journal events carry the
//! local timezone metadata alongside the UTC timestamp so downstream
//! temporal aggregation can reconstruct local days.

use crate::canonical::canonical_json;
use crate::hashing::{sha256_canonical, sha256_text};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Errors raised while assembling records.
#[derive(Debug, Error)]
pub enum RecordError {
    /// A record body was not a JSON object.
    #[error("record payload must be a JSON object")]
    NotAnObject,
}

/// Errors raised while validating a ledger chain.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChainError {
    /// Stored hash does not match the recomputed canonical hash.
    #[error("entry {index}: stored hash does not match canonical hash")]
    HashMismatch {
        /// Zero-based index of the offending entry.
        index: usize,
    },
    /// `prev_hash` does not bind to the prior entry.
    #[error("entry {index}: prev_hash broken")]
    BrokenLink {
        /// Zero-based index of the offending entry.
        index: usize,
    },
}

/// One append-only journal event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JournalEvent {
    /// Run-scoped event id.
    pub event_id: String,
    /// Dotted event type, e.g. `capture.segment`.
    pub event_type: String,
    /// UTC timestamp (RFC 3339).
    pub ts_utc: String,
    /// Free-form JSON payload.
    pub payload: Value,
    /// Run the event belongs to.
    pub run_id: String,
    /// IANA timezone id of the host at event time.
    pub tzid: String,
    /// UTC offset of the host at event time, in minutes.
    pub offset_minutes: i32,
}

impl JournalEvent {
    /// Canonical NDJSON line for this event (no trailing newline).
    pub fn to_line(&self) -> String {
        let value = serde_json::to_value(self).unwrap_or(Value::Null);
        canonical_json(&value)
    }
}

/// One hash-chained ledger entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerEntry {
    /// Pipeline stage that produced the entry, e.g. `segment.seal`.
    pub stage: String,
    /// Record ids consumed by the stage.
    pub inputs: Vec<String>,
    /// Record ids produced by the stage.
    pub outputs: Vec<String>,
    /// Stage payload.
    pub payload: Value,
    /// UTC timestamp (RFC 3339).
    pub ts_utc: String,
    /// Hash of the previous chain head, if any.
    pub prev_hash: Option<String>,
    /// SHA-256 over the canonical JSON of this entry with `hash` omitted.
    pub hash: String,
}

impl LedgerEntry {
    /// Assemble an entry, computing its chain hash against `prev_hash`.
    pub fn build(
        stage: impl Into<String>,
        inputs: Vec<String>,
        outputs: Vec<String>,
        payload: Value,
        ts_utc: impl Into<String>,
        prev_hash: Option<String>,
    ) -> Self {
        let mut entry = LedgerEntry {
            stage: stage.into(),
            inputs,
            outputs,
            payload,
            ts_utc: ts_utc.into(),
            prev_hash,
            hash: String::new(),
        };
        entry.hash = entry.canonical_hash();
        entry
    }

    /// Recompute the canonical hash (entry with `hash` omitted).
    pub fn canonical_hash(&self) -> String {
        let mut value = serde_json::to_value(self).unwrap_or(Value::Null);
        if let Value::Object(ref mut map) = value {
            map.remove("hash");
        }
        sha256_text(&canonical_json(&value))
    }

    /// Canonical NDJSON line for this entry (no trailing newline).
    pub fn to_line(&self) -> String {
        let value = serde_json::to_value(self).unwrap_or(Value::Null);
        canonical_json(&value)
    }
}

/// Verify a ledger chain end to end: every stored hash matches its
/// canonical recomputation and every `prev_hash` binds to its predecessor.
pub fn verify_chain(entries: &[LedgerEntry]) -> Result<(), ChainError> {
    let mut prev: Option<&str> = None;
    for (index, entry) in entries.iter().enumerate() {
        if entry.canonical_hash() != entry.hash {
            return Err(ChainError::HashMismatch { index });
        }
        if entry.prev_hash.as_deref() != prev {
            return Err(ChainError::BrokenLink { index });
        }
        prev = Some(entry.hash.as_str());
    }
    Ok(())
}

/// Stamp `payload_hash` into a record object: SHA-256 of the canonical
/// JSON of the object with any existing `payload_hash` removed.
pub fn with_payload_hash(mut record: Value) -> Result<Value, RecordError> {
    let Value::Object(ref mut map) = record else {
        return Err(RecordError::NotAnObject);
    };
    map.remove("payload_hash");
    let hash = sha256_canonical(&Value::Object(map.clone()));
    map.insert("payload_hash".to_string(), Value::String(hash));
    Ok(record)
}

/// Assemble a derived-artifact record. Every derived record binds its
/// parent evidence and the exact extractor provenance (`method`,
/// `provider_id`, `model_id`, `model_digest`) before the payload-hash
/// stamp.
#[allow(clippy::too_many_arguments)]
pub fn derived_record(
    record_type: &str,
    record_id: &str,
    parent_evidence_id: &str,
    method: &str,
    provider_id: &str,
    model_id: &str,
    model_digest: &str,
    ts_utc: &str,
    payload: Value,
) -> Result<Value, RecordError> {
    with_payload_hash(serde_json::json!({
        "record_type": record_type,
        "record_id": record_id,
        "parent_evidence_id": parent_evidence_id,
        "method": method,
        "provider_id": provider_id,
        "model_id": model_id,
        "model_digest": model_digest,
        "ts_utc": ts_utc,
        "payload": payload,
    }))
}

/// Check the `payload_hash` law on a record object.
pub fn payload_hash_valid(record: &Value) -> bool {
    let Value::Object(map) = record else {
        return false;
    };
    let Some(Value::String(stored)) = map.get("payload_hash") else {
        return false;
    };
    let mut stripped: Map<String, Value> = map.clone();
    stripped.remove("payload_hash");
    sha256_canonical(&Value::Object(stripped)) == *stored
}
