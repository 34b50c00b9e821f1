//! Directory-backed metadata store: one canonical-JSON document per
//! record id. SQL backends live behind plugins; this is the built-in.

use crate::{write_atomic, FsyncPolicy, StoreError};
use serde_json::Value;
use std::path::{Path, PathBuf};

/// Metadata documents under `metadata/`, one file per record.
pub struct MetadataStore {
    dir: PathBuf,
    policy: FsyncPolicy,
}

impl MetadataStore {
    /// Open (or create) the metadata directory.
    pub fn open(dir: &Path, policy: FsyncPolicy) -> Result<Self, StoreError> {
        std::fs::create_dir_all(dir)?;
        Ok(MetadataStore {
            dir: dir.to_path_buf(),
            policy,
        })
    }

    /// Write a new record; refuses to overwrite.
    pub fn put_new(&self, record_id: &str, record: &Value) -> Result<(), StoreError> {
        let path = self.path_for(record_id);
        if path.exists() {
            return Err(StoreError::AlreadyExists(record_id.to_string()));
        }
        self.write(&path, record)
    }

    /// Write or replace a record.
    pub fn put_replace(&self, record_id: &str, record: &Value) -> Result<(), StoreError> {
        self.write(&self.path_for(record_id), record)
    }

    /// Fetch a record, or `None` when absent.
    pub fn get(&self, record_id: &str) -> Result<Option<Value>, StoreError> {
        let path = self.path_for(record_id);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = std::fs::read(path)?;
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    /// All record ids, decoded back from filesystem names.
    ///
    /// Record types never contain `/`, so only the first and last
    /// underscore-separated groups are rejoined when decoding.
    pub fn keys(&self) -> Result<Vec<String>, StoreError> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) == Some("json") {
                if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                    out.push(stem.to_string());
                }
            }
        }
        out.sort();
        Ok(out)
    }

    /// Fetch a record by its encoded (filesystem) id.
    pub fn get_encoded(&self, encoded: &str) -> Result<Option<Value>, StoreError> {
        let path = self.dir.join(format!("{encoded}.json"));
        if !path.exists() {
            return Ok(None);
        }
        let bytes = std::fs::read(path)?;
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    /// Number of stored records.
    pub fn count(&self) -> Result<usize, StoreError> {
        Ok(self.keys()?.len())
    }

    /// Iterate all records matching a `record_type` field value.
    pub fn records_of_type(&self, record_type: &str) -> Result<Vec<(String, Value)>, StoreError> {
        let mut out = Vec::new();
        for encoded in self.keys()? {
            if let Some(record) = self.get_encoded(&encoded)? {
                if record.get("record_type").and_then(Value::as_str) == Some(record_type) {
                    let id = record
                        .get("segment_id")
                        .or_else(|| record.get("record_id"))
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .unwrap_or(encoded.clone());
                    out.push((id, record));
                }
            }
        }
        Ok(out)
    }

    /// Root directory of the store.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn write(&self, path: &Path, record: &Value) -> Result<(), StoreError> {
        let body = autocap_spec::canonical_json(record);
        write_atomic(path, body.as_bytes(), self.policy)
    }

    fn path_for(&self, record_id: &str) -> PathBuf {
        self.dir
            .join(format!("{}.json", autocap_spec::encode_component(record_id)))
    }
}
