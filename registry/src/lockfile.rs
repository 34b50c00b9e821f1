//! Contract and plugin lockfiles.
//!
//! The contract lock pins every tracked schema/contract file by SHA-256
//! and is verified before anything else at boot; a mismatch is fatal.
//! The plugin lock pins each plugin's manifest and directory hash; a
//! mismatched plugin is rejected while the rest continue loading.

use crate::RegistryError;
use autocap_spec::{sha256_dir, sha256_file};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;

/// Contract lockfile: relative path → SHA-256.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ContractLock {
    /// Tracked contract files.
    #[serde(default)]
    pub files: BTreeMap<String, String>,
}

/// One plugin's lock record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PluginLockRecord {
    /// SHA-256 of `plugin.json`.
    pub manifest_sha256: String,
    /// SHA-256 over the plugin directory in sorted order.
    pub artifact_sha256: String,
    /// Software bill of materials, carried opaque.
    #[serde(default)]
    pub sbom: Value,
}

/// Plugin lockfile: plugin id → lock record.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PluginLocks {
    /// Locked plugins.
    #[serde(default)]
    pub plugins: BTreeMap<String, PluginLockRecord>,
}

impl PluginLocks {
    /// Load the lockfile; a missing file is an empty lock set.
    pub fn load(path: &Path) -> Result<PluginLocks, RegistryError> {
        if !path.exists() {
            return Ok(PluginLocks::default());
        }
        let bytes = std::fs::read(path)?;
        serde_json::from_slice(&bytes)
            .map_err(|err| RegistryError::ContractViolation(format!("plugin lockfile: {err}")))
    }

    /// Verify one plugin against its lock record. Returns the mismatch
    /// labels (`missing_lock`, `manifest_hash`, `artifact_hash`).
    pub fn verify(
        &self,
        plugin_id: &str,
        manifest_path: &Path,
        plugin_dir: &Path,
    ) -> Result<Vec<String>, RegistryError> {
        let Some(expected) = self.plugins.get(plugin_id) else {
            return Ok(vec![format!("missing_lock:{plugin_id}")]);
        };
        let mut mismatches = Vec::new();
        let manifest_hash = sha256_file(manifest_path)?;
        if manifest_hash != expected.manifest_sha256 {
            mismatches.push(format!("manifest_hash:{plugin_id}"));
        }
        let artifact_hash = sha256_dir(plugin_dir)?;
        if artifact_hash != expected.artifact_sha256 {
            mismatches.push(format!("artifact_hash:{plugin_id}"));
        }
        Ok(mismatches)
    }

    /// Build a lock record for a plugin directory (lockfile generation).
    pub fn record_for(
        manifest_path: &Path,
        plugin_dir: &Path,
        sbom: Value,
    ) -> Result<PluginLockRecord, RegistryError> {
        Ok(PluginLockRecord {
            manifest_sha256: sha256_file(manifest_path)?,
            artifact_sha256: sha256_dir(plugin_dir)?,
            sbom,
        })
    }
}

/// Verify the contract lockfile: every tracked file must exist with the
/// pinned hash. Fatal on any mismatch.
pub fn verify_contract_lock(lock_path: &Path, root: &Path) -> Result<(), RegistryError> {
    if !lock_path.exists() {
        return Err(RegistryError::ContractViolation(format!(
            "missing contract lockfile {}",
            lock_path.display()
        )));
    }
    let bytes = std::fs::read(lock_path)?;
    let lock: ContractLock = serde_json::from_slice(&bytes)
        .map_err(|err| RegistryError::ContractViolation(format!("contract lockfile: {err}")))?;
    let mut mismatches = Vec::new();
    for (rel, expected) in &lock.files {
        let path = root.join(rel);
        if !path.exists() {
            mismatches.push(format!("missing:{rel}"));
            continue;
        }
        if sha256_file(&path)? != *expected {
            mismatches.push(format!("hash_mismatch:{rel}"));
        }
    }
    if mismatches.is_empty() {
        Ok(())
    } else {
        mismatches.truncate(5);
        Err(RegistryError::ContractViolation(format!(
            "contract lock mismatch: {}",
            mismatches.join(", ")
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn contract_lock_detects_tampering() {
        let dir = tempfile::tempdir().unwrap();
        let contracts = dir.path().join("contracts");
        std::fs::create_dir_all(&contracts).unwrap();
        let schema = contracts.join("config_schema.json");
        std::fs::write(&schema, b"{}").unwrap();
        let lock = ContractLock {
            files: BTreeMap::from([(
                "contracts/config_schema.json".to_string(),
                autocap_spec::sha256_hex(b"{}"),
            )]),
        };
        let lock_path = dir.path().join("contracts/lock.json");
        std::fs::write(&lock_path, serde_json::to_vec(&lock).unwrap()).unwrap();
        verify_contract_lock(&lock_path, dir.path()).unwrap();

        std::fs::write(&schema, b"{\"tampered\": true}").unwrap();
        let err = verify_contract_lock(&lock_path, dir.path()).unwrap_err();
        assert!(matches!(err, RegistryError::ContractViolation(_)));
    }

    #[test]
    fn missing_contract_lock_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let err =
            verify_contract_lock(&dir.path().join("contracts/lock.json"), dir.path()).unwrap_err();
        assert!(matches!(err, RegistryError::ContractViolation(_)));
    }

    #[test]
    fn plugin_lock_roundtrip_and_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let plugin_dir = dir.path().join("builtin.example");
        std::fs::create_dir_all(&plugin_dir).unwrap();
        let manifest_path = plugin_dir.join("plugin.json");
        std::fs::write(
            &manifest_path,
            serde_json::to_vec(&json!({"plugin_id": "builtin.example", "version": "1"})).unwrap(),
        )
        .unwrap();
        let record =
            PluginLocks::record_for(&manifest_path, &plugin_dir, json!({"packages": []})).unwrap();
        let locks = PluginLocks {
            plugins: BTreeMap::from([("builtin.example".to_string(), record)]),
        };
        assert!(locks
            .verify("builtin.example", &manifest_path, &plugin_dir)
            .unwrap()
            .is_empty());

        std::fs::write(plugin_dir.join("extra.bin"), b"drift").unwrap();
        let mismatches = locks
            .verify("builtin.example", &manifest_path, &plugin_dir)
            .unwrap();
        assert_eq!(mismatches, vec!["artifact_hash:builtin.example".to_string()]);

        assert_eq!(
            locks
                .verify("builtin.unknown", &manifest_path, &plugin_dir)
                .unwrap(),
            vec!["missing_lock:builtin.unknown".to_string()]
        );
    }
}
