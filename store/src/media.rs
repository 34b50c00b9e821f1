//! Content-addressed media store and the encrypted blob store layered on
//! top of it.

use crate::{write_atomic, FsyncPolicy, StoreError};
use autocap_vault::BlobCipher;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// Media blobs keyed by record id; the SHA-256 of the stored bytes is
/// computed while streaming so sealing never re-reads the file.
pub struct MediaStore {
    dir: PathBuf,
    policy: FsyncPolicy,
}

impl MediaStore {
    /// Open (or create) the media directory.
    pub fn open(dir: &Path, policy: FsyncPolicy) -> Result<Self, StoreError> {
        std::fs::create_dir_all(dir)?;
        Ok(MediaStore {
            dir: dir.to_path_buf(),
            policy,
        })
    }

    /// Stream `reader` into the store under `record_id`, hashing along the
    /// way. Returns `(hex_digest, bytes_written)`.
    pub fn put_stream(
        &self,
        record_id: &str,
        reader: &mut dyn Read,
    ) -> Result<(String, u64), StoreError> {
        let final_path = self.path_for(record_id);
        let tmp = final_path.with_extension("tmp");
        let mut hasher = Sha256::new();
        let mut written: u64 = 0;
        {
            let mut out = File::create(&tmp)?;
            let mut buf = [0u8; 64 * 1024];
            loop {
                let read = reader.read(&mut buf)?;
                if read == 0 {
                    break;
                }
                hasher.update(&buf[..read]);
                out.write_all(&buf[..read])?;
                written += read as u64;
            }
            if self.policy != FsyncPolicy::None {
                out.sync_data()?;
            }
        }
        std::fs::rename(&tmp, &final_path)?;
        Ok((hex::encode(hasher.finalize()), written))
    }

    /// Store raw bytes under `record_id`. Returns the hex digest.
    pub fn put(&self, record_id: &str, bytes: &[u8]) -> Result<String, StoreError> {
        write_atomic(&self.path_for(record_id), bytes, self.policy)?;
        Ok(autocap_spec::sha256_hex(bytes))
    }

    /// Fetch bytes by record id.
    pub fn get(&self, record_id: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.path_for(record_id);
        if !path.exists() {
            return Err(StoreError::Missing(record_id.to_string()));
        }
        Ok(std::fs::read(path)?)
    }

    /// Whether a blob exists for the record id.
    pub fn exists(&self, record_id: &str) -> bool {
        self.path_for(record_id).exists()
    }

    /// Recompute the digest of a stored blob.
    pub fn digest(&self, record_id: &str) -> Result<String, StoreError> {
        let path = self.path_for(record_id);
        if !path.exists() {
            return Err(StoreError::Missing(record_id.to_string()));
        }
        Ok(autocap_spec::sha256_file(&path)?)
    }

    /// Delete a blob (retention sweep only; callers log the deletion).
    pub fn remove(&self, record_id: &str) -> Result<(), StoreError> {
        let path = self.path_for(record_id);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    /// All record ids currently stored.
    pub fn keys(&self) -> Result<Vec<String>, StoreError> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            if entry.path().is_file() {
                out.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        out.sort();
        Ok(out)
    }

    /// Number of stored blobs.
    pub fn count(&self) -> Result<usize, StoreError> {
        Ok(self.keys()?.len())
    }

    /// Filesystem path for a record id.
    pub fn path_for(&self, record_id: &str) -> PathBuf {
        self.dir.join(autocap_spec::encode_component(record_id))
    }

    /// Root directory of the store.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// Encrypted blob store: every payload is sealed with AES-256-GCM before
/// it reaches disk, with the record id as associated data.
pub struct BlobStore {
    media: MediaStore,
    cipher: BlobCipher,
}

impl BlobStore {
    /// Open the blob directory with the given cipher.
    pub fn open(dir: &Path, policy: FsyncPolicy, cipher: BlobCipher) -> Result<Self, StoreError> {
        Ok(BlobStore {
            media: MediaStore::open(dir, policy)?,
            cipher,
        })
    }

    /// Seal and store plaintext bytes.
    pub fn put(&self, record_id: &str, plaintext: &[u8]) -> Result<(), StoreError> {
        let sealed = self.cipher.seal(record_id, plaintext)?;
        self.media.put(record_id, &sealed)?;
        Ok(())
    }

    /// Fetch and open a sealed blob.
    pub fn get(&self, record_id: &str) -> Result<Vec<u8>, StoreError> {
        let sealed = self.media.get(record_id)?;
        Ok(self.cipher.open(record_id, &sealed)?)
    }

    /// Whether a sealed blob exists.
    pub fn exists(&self, record_id: &str) -> bool {
        self.media.exists(record_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use autocap_vault::KeyRing;

    #[test]
    fn put_stream_digest_matches_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let store = MediaStore::open(dir.path(), FsyncPolicy::None).unwrap();
        let payload = b"segment-bytes".to_vec();
        let (digest, written) = store
            .put_stream("run/segment/0", &mut payload.as_slice())
            .unwrap();
        assert_eq!(written, payload.len() as u64);
        assert_eq!(digest, autocap_spec::sha256_hex(&payload));
        assert_eq!(store.digest("run/segment/0").unwrap(), digest);
        assert_eq!(store.get("run/segment/0").unwrap(), payload);
    }

    #[test]
    fn blob_store_roundtrip_is_encrypted_at_rest() {
        let dir = tempfile::tempdir().unwrap();
        let mut ring = KeyRing::load(&dir.path().join("vault")).unwrap();
        let (key_id, key) = ring.active_key("blob_store").unwrap();
        let store = BlobStore::open(
            &dir.path().join("blobs"),
            FsyncPolicy::None,
            BlobCipher::new(key_id, &key),
        )
        .unwrap();
        store.put("run/blob/0", b"secret text").unwrap();
        assert_eq!(store.get("run/blob/0").unwrap(), b"secret text");
        let raw = std::fs::read(dir.path().join("blobs").join("run_blob_0")).unwrap();
        assert!(!raw.windows(6).any(|w| w == b"secret"));
    }
}
