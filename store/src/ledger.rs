//! Hash-chained ledger writer plus periodic anchor attestations.
//!
//! Every entry binds the previous chain head through `prev_hash`; the
//! anchor writer signs the current head with an ed25519 key into a store
//! that lives outside `data_dir` so tampering with the data directory
//! cannot rewrite history and its attestation at once.

use crate::atomic::sync_batch;
use crate::{FsyncPolicy, StoreError};
use autocap_spec::{verify_chain, ChainError, LedgerEntry};
use ed25519_dalek::{Signer, SigningKey};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

struct LedgerInner {
    file: BufWriter<File>,
    head: Option<String>,
    entries_since_anchor: u64,
}

/// Single-writer hash-chained ledger over `ledger.ndjson`.
pub struct LedgerWriter {
    path: PathBuf,
    policy: FsyncPolicy,
    inner: Mutex<LedgerInner>,
}

impl LedgerWriter {
    /// Open (or create) the ledger, recovering the chain head by scanning
    /// existing entries.
    pub fn open(path: &Path, policy: FsyncPolicy) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        crate::journal::terminate_partial_line(path)?;
        let head = read_entries(path)?.last().map(|entry| entry.hash.clone());
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(LedgerWriter {
            path: path.to_path_buf(),
            policy,
            inner: Mutex::new(LedgerInner {
                file: BufWriter::new(file),
                head,
                entries_since_anchor: 0,
            }),
        })
    }

    /// Append a new entry bound to the current head; returns its hash.
    pub fn append(
        &self,
        stage: &str,
        inputs: Vec<String>,
        outputs: Vec<String>,
        payload: Value,
        ts_utc: &str,
    ) -> Result<String, StoreError> {
        let span = tracing::info_span!("ledger_append", stage = %stage);
        let _guard = span.enter();
        let mut inner = self.inner.lock();
        let entry = LedgerEntry::build(stage, inputs, outputs, payload, ts_utc, inner.head.clone());
        inner.file.write_all(entry.to_line().as_bytes())?;
        inner.file.write_all(b"\n")?;
        inner.file.flush()?;
        sync_batch(inner.file.get_ref(), self.policy)?;
        inner.head = Some(entry.hash.clone());
        inner.entries_since_anchor += 1;
        Ok(entry.hash)
    }

    /// Current chain head hash, if any entry exists.
    pub fn head(&self) -> Option<String> {
        self.inner.lock().head.clone()
    }

    /// Entries appended since the last [`LedgerWriter::mark_anchored`].
    pub fn entries_since_anchor(&self) -> u64 {
        self.inner.lock().entries_since_anchor
    }

    /// Reset the anchor counter after a successful attestation.
    pub fn mark_anchored(&self) {
        self.inner.lock().entries_since_anchor = 0;
    }

    /// Read every entry in order.
    pub fn read_all(&self) -> Result<Vec<LedgerEntry>, StoreError> {
        read_entries(&self.path)
    }

    /// Replay the chain and verify every hash and link.
    pub fn verify(&self) -> Result<Result<(), ChainError>, StoreError> {
        Ok(verify_chain(&self.read_all()?))
    }

    /// Ledger file path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Read ledger entries from disk. Partial trailing lines are skipped.
pub fn read_entries(path: &Path) -> Result<Vec<LedgerEntry>, StoreError> {
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
        match serde_json::from_str::<LedgerEntry>(&line) {
            Ok(entry) => out.push(entry),
            Err(err) => tracing::warn!(error = %err, "skipping unparseable ledger line"),
        }
    }
    Ok(out)
}

/// One signed attestation of a ledger head.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnchorRecord {
    /// Ledger head hash being attested.
    pub head: String,
    /// UTC timestamp (RFC 3339).
    pub ts_utc: String,
    /// Hex-encoded ed25519 public key of the signer.
    pub signer: String,
    /// Hex-encoded signature over `head|ts_utc`.
    pub signature: String,
}

/// Appends signed head attestations to a file outside `data_dir`.
pub struct AnchorWriter {
    path: PathBuf,
    key: SigningKey,
}

impl AnchorWriter {
    /// Open the anchor store, creating the signing key on first use next
    /// to the anchor file.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let key_path = path.with_extension("key");
        let key = if key_path.exists() {
            let bytes = std::fs::read(&key_path)?;
            let array: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
                StoreError::ChecksumMismatch(key_path.display().to_string())
            })?;
            SigningKey::from_bytes(&array)
        } else {
            let key = SigningKey::generate(&mut rand::rngs::OsRng);
            std::fs::write(&key_path, key.to_bytes())?;
            key
        };
        Ok(AnchorWriter {
            path: path.to_path_buf(),
            key,
        })
    }

    /// Sign and append an attestation of `head`.
    pub fn record(&self, head: &str, ts_utc: &str) -> Result<AnchorRecord, StoreError> {
        let message = format!("{head}|{ts_utc}");
        let signature = self.key.sign(message.as_bytes());
        let record = AnchorRecord {
            head: head.to_string(),
            ts_utc: ts_utc.to_string(),
            signer: hex::encode(self.key.verifying_key().to_bytes()),
            signature: hex::encode(signature.to_bytes()),
        };
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(serde_json::to_string(&record)?.as_bytes())?;
        file.write_all(b"\n")?;
        file.sync_data()?;
        tracing::debug!(head = %head, "ledger head anchored");
        Ok(record)
    }

    /// Verify an attestation signature.
    pub fn verify(record: &AnchorRecord) -> bool {
        let Ok(pk_bytes) = hex::decode(&record.signer) else {
            return false;
        };
        let Ok(pk_array) = <[u8; 32]>::try_from(pk_bytes.as_slice()) else {
            return false;
        };
        let Ok(pk) = ed25519_dalek::VerifyingKey::from_bytes(&pk_array) else {
            return false;
        };
        let Ok(sig_bytes) = hex::decode(&record.signature) else {
            return false;
        };
        let Ok(sig_array) = <[u8; 64]>::try_from(sig_bytes.as_slice()) else {
            return false;
        };
        let signature = ed25519_dalek::Signature::from_bytes(&sig_array);
        let message = format!("{}|{}", record.head, record.ts_utc);
        pk.verify_strict(message.as_bytes(), &signature).is_ok()
    }
}
