//! Append-only storage for the capture engine: journal, hash-chained
//! ledger, anchor attestations, content-addressed media, encrypted blobs,
//! metadata documents, run state, boot recovery, and the telemetry
//! snapshot store.
//!
//! Every store has exactly one writer. Mutation goes through atomic
//! temp-then-rename writes or a single append handle behind a lock, with
//! the fsync policy fixed at construction rather than per call site.

/// Zip archive export, verification, and safe import.
pub mod archive;
/// Append-only audit log.
pub mod audit;
/// Atomic writes and fsync policy.
pub mod atomic;
/// Canonical event and ledger-entry assembly.
pub mod events;
/// Journal writer (`journal.ndjson`).
pub mod journal;
/// Hash-chained ledger writer (`ledger.ndjson`) and anchor attestations.
pub mod ledger;
/// Content-addressed media store and encrypted blob store.
pub mod media;
/// Directory-backed metadata document store.
pub mod metadata;
/// Boot-time recovery, integrity sweep, and crash-loop detection.
pub mod recovery;
/// Run state file and the process instance lock.
pub mod run_state;
/// In-process telemetry snapshot store.
pub mod telemetry;

pub use atomic::{write_atomic, FsyncPolicy};
pub use audit::{AuditEvent, AuditLog};
pub use events::EventBuilder;
pub use journal::JournalWriter;
pub use ledger::{AnchorWriter, LedgerWriter};
pub use media::{BlobStore, MediaStore};
pub use metadata::MetadataStore;
pub use recovery::{run_recovery, CrashLoopDetector, RecoveryReport};
pub use run_state::{InstanceLock, RunState, RunStateFile};
pub use telemetry::TelemetryStore;

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the storage layer.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying filesystem failure.
    #[error("storage io: {0}")]
    Io(#[from] std::io::Error),
    /// Record serialization failure.
    #[error("storage encode: {0}")]
    Encode(#[from] serde_json::Error),
    /// `put_new` refused to overwrite an existing record.
    #[error("record already exists: {0}")]
    AlreadyExists(String),
    /// A referenced record or blob is missing.
    #[error("missing record: {0}")]
    Missing(String),
    /// Stored digest does not match recomputed content.
    #[error("checksum mismatch for {0}")]
    ChecksumMismatch(String),
    /// Another process holds the instance lock.
    #[error("instance lock held at {path}")]
    InstanceLocked {
        /// Lock file path.
        path: PathBuf,
    },
    /// Archive member failed a safety or integrity check.
    #[error("archive rejected: {0}")]
    ArchiveRejected(String),
    /// Zip container failure.
    #[error("archive io: {0}")]
    Archive(#[from] zip::result::ZipError),
    /// Blob crypto failure.
    #[error(transparent)]
    Vault(#[from] autocap_vault::VaultError),
}
