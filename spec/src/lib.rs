//! Record specification for the capture engine: canonical JSON, content
//! hashing, run-scoped record identifiers, and the journal/ledger schema
//! with hash-chain validation.
#![deny(missing_docs)]

/// Canonical JSON emitter shared by hashing and persistence.
pub mod canonical;
/// SHA-256 / BLAKE3 helpers over bytes, text, files, and directories.
pub mod hashing;
/// Run-scoped record identifiers.
pub mod ids;
/// Journal event and ledger entry schema plus chain validation.
pub mod records;
/// JSON-schema-subset validation for configuration and plugin settings.
pub mod schema;

pub use canonical::{canonical_json, float_token};
pub use hashing::{
    blake3_hex, sha256_canonical, sha256_dir, sha256_file, sha256_hex, sha256_text,
};
pub use ids::{encode_component, prefixed_id, RunId};
pub use records::{
    derived_record, verify_chain, with_payload_hash, ChainError, JournalEvent, LedgerEntry,
    RecordError,
};

/// Hex-encoded SHA-256 digest.
pub type HexDigest = String;

/// Current UTC timestamp in RFC 3339 form.
pub fn now_utc() -> String {
    chrono::Utc::now().to_rfc3339()
}
