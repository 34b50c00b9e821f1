//! Key management for the capture engine: a root key on disk, HKDF
//! purpose-derived keys tracked in a keyring file, and AEAD sealing for
//! blob storage. All secret material is zeroized on drop.
#![deny(missing_docs)]

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use zeroize::{Zeroize, Zeroizing};

/// Domain label prefix for purpose key derivation.
const DERIVE_DOMAIN: &str = "autocap:key";
/// AEAD nonce length in bytes.
const NONCE_LEN: usize = 12;

/// Errors raised by the vault.
#[derive(Debug, Error)]
pub enum VaultError {
    /// Root key file exists but has the wrong length.
    #[error("root key at {path} is not 32 bytes")]
    BadRootKey {
        /// Offending path.
        path: PathBuf,
    },
    /// Keyring file could not be parsed.
    #[error("keyring parse failed: {0}")]
    KeyringParse(#[from] serde_json::Error),
    /// Underlying filesystem failure.
    #[error("vault io: {0}")]
    Io(#[from] std::io::Error),
    /// AEAD open failed (tampered or wrong key).
    #[error("blob decryption failed")]
    Decrypt,
    /// Requested purpose has no active key.
    #[error("no active key for purpose {0}")]
    UnknownPurpose(String),
}

/// 32-byte secret wrapped for zeroization.
pub struct SecretKey(Zeroizing<[u8; 32]>);

impl SecretKey {
    /// Expose the raw bytes to a crypto primitive.
    pub fn expose(&self) -> &[u8; 32] {
        &self.0
    }
}

/// One purpose entry in the keyring file.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PurposeEntry {
    active: u32,
    rotated_at: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct KeyringFile {
    schema_version: u32,
    purposes: BTreeMap<String, PurposeEntry>,
}

/// Root key plus the keyring of per-purpose derivations.
pub struct KeyRing {
    root: Zeroizing<[u8; 32]>,
    keyring_path: PathBuf,
    file: KeyringFile,
}

impl KeyRing {
    /// Load (or initialize) the vault under `vault_dir`. A missing root key
    /// is created from the OS RNG; a missing keyring file starts empty.
    pub fn load(vault_dir: &Path) -> Result<Self, VaultError> {
        fs::create_dir_all(vault_dir)?;
        let root_path = vault_dir.join("root.key");
        let root = if root_path.exists() {
            let bytes = fs::read(&root_path)?;
            let Ok(array) = <[u8; 32]>::try_from(bytes.as_slice()) else {
                return Err(VaultError::BadRootKey { path: root_path });
            };
            Zeroizing::new(array)
        } else {
            let mut fresh = [0u8; 32];
            rand::thread_rng().fill_bytes(&mut fresh);
            fs::write(&root_path, fresh)?;
            tracing::info!(path = %root_path.display(), "root key created");
            let root = Zeroizing::new(fresh);
            fresh.zeroize();
            root
        };
        let keyring_path = vault_dir.join("keyring.json");
        let file = if keyring_path.exists() {
            serde_json::from_slice(&fs::read(&keyring_path)?)?
        } else {
            KeyringFile {
                schema_version: 1,
                purposes: BTreeMap::new(),
            }
        };
        Ok(KeyRing {
            root,
            keyring_path,
            file,
        })
    }

    /// Derive the active key for a purpose, registering the purpose in the
    /// keyring file on first use. Returns `(key_id, key)`.
    pub fn active_key(&mut self, purpose: &str) -> Result<(u32, SecretKey), VaultError> {
        let key_id = match self.file.purposes.get(purpose) {
            Some(entry) => entry.active,
            None => {
                self.file.purposes.insert(
                    purpose.to_string(),
                    PurposeEntry {
                        active: 1,
                        rotated_at: None,
                    },
                );
                self.persist()?;
                1
            }
        };
        Ok((key_id, self.derive(purpose, key_id)))
    }

    /// Derive a specific key generation for a purpose. Older generations
    /// stay derivable so previously sealed blobs remain readable.
    pub fn key_for(&self, purpose: &str, key_id: u32) -> SecretKey {
        self.derive(purpose, key_id)
    }

    /// Rotate the purpose to a fresh key generation and return it.
    pub fn rotate(&mut self, purpose: &str) -> Result<(u32, SecretKey), VaultError> {
        let next = self
            .file
            .purposes
            .get(purpose)
            .map(|entry| entry.active + 1)
            .unwrap_or(1);
        self.file.purposes.insert(
            purpose.to_string(),
            PurposeEntry {
                active: next,
                rotated_at: Some(autocap_spec::now_utc()),
            },
        );
        self.persist()?;
        tracing::info!(purpose, key_id = next, "key rotated");
        Ok((next, self.derive(purpose, next)))
    }

    /// Purposes currently tracked by the keyring, with active generations.
    pub fn purposes(&self) -> Vec<(String, u32)> {
        self.file
            .purposes
            .iter()
            .map(|(name, entry)| (name.clone(), entry.active))
            .collect()
    }

    fn derive(&self, purpose: &str, key_id: u32) -> SecretKey {
        let hk = Hkdf::<Sha256>::new(None, self.root.as_slice());
        let info = format!("{DERIVE_DOMAIN}:{purpose}:{key_id}:v1");
        let mut out = [0u8; 32];
        // 32 bytes is always a valid HKDF-SHA256 output length.
        hk.expand(info.as_bytes(), &mut out)
            .unwrap_or_else(|_| unreachable!("32-byte hkdf expansion cannot fail"));
        let key = SecretKey(Zeroizing::new(out));
        out.zeroize();
        key
    }

    fn persist(&self) -> Result<(), VaultError> {
        let bytes = serde_json::to_vec_pretty(&self.file)?;
        let tmp = self.keyring_path.with_extension("json.writing");
        fs::write(&tmp, &bytes)?;
        fs::rename(&tmp, &self.keyring_path)?;
        Ok(())
    }
}

/// AEAD cipher for blob storage. The record id is the associated data so a
/// ciphertext cannot be replayed under a different id.
pub struct BlobCipher {
    key_id: u32,
    cipher: Aes256Gcm,
}

impl BlobCipher {
    /// Build a cipher from a derived key.
    pub fn new(key_id: u32, key: &SecretKey) -> Self {
        let cipher = Aes256Gcm::new_from_slice(key.expose())
            .unwrap_or_else(|_| unreachable!("32-byte key is valid for AES-256-GCM"));
        BlobCipher { key_id, cipher }
    }

    /// Key generation this cipher was built from.
    pub fn key_id(&self) -> u32 {
        self.key_id
    }

    /// Seal plaintext under the record id; nonce is prefixed to the output.
    pub fn seal(&self, record_id: &str, plaintext: &[u8]) -> Result<Vec<u8>, VaultError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let sealed = self
            .cipher
            .encrypt(
                nonce,
                Payload {
                    msg: plaintext,
                    aad: record_id.as_bytes(),
                },
            )
            .map_err(|_| VaultError::Decrypt)?;
        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    /// Open a sealed blob produced by [`BlobCipher::seal`].
    pub fn open(&self, record_id: &str, sealed: &[u8]) -> Result<Vec<u8>, VaultError> {
        if sealed.len() < NONCE_LEN {
            return Err(VaultError::Decrypt);
        }
        let (nonce_bytes, body) = sealed.split_at(NONCE_LEN);
        self.cipher
            .decrypt(
                Nonce::from_slice(nonce_bytes),
                Payload {
                    msg: body,
                    aad: record_id.as_bytes(),
                },
            )
            .map_err(|_| VaultError::Decrypt)
    }
}
