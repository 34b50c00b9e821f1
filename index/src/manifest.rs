//! Versioned index manifests (`<index>.manifest.json`).
//!
//! `version` increments on every successful mutation; `digest` is the
//! SHA-256 of the index file, recomputed lazily when the file's mtime
//! changes. Readers caching by `(path, version, digest)` invalidate on
//! any content change.

use crate::IndexError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Manifest schema version.
pub const SCHEMA_VERSION: u32 = 1;

/// One index manifest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexManifest {
    /// Manifest schema version.
    pub schema_version: u32,
    /// Index name (`lexical` or `vector`).
    pub index_name: String,
    /// Monotone mutation counter.
    pub version: u64,
    /// SHA-256 of the index file after the last mutation.
    pub digest: Option<String>,
    /// When the manifest last changed.
    pub updated_at: Option<String>,
}

/// Sidecar path for an index file.
pub fn manifest_path(index_path: &Path) -> PathBuf {
    let mut name = index_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push_str(".manifest.json");
    index_path.with_file_name(name)
}

/// Load the manifest, defaulting to version 0 when absent or corrupt.
pub fn load_manifest(index_path: &Path, index_name: &str) -> IndexManifest {
    let path = manifest_path(index_path);
    if path.exists() {
        if let Ok(bytes) = std::fs::read(&path) {
            if let Ok(manifest) = serde_json::from_slice::<IndexManifest>(&bytes) {
                return manifest;
            }
        }
    }
    IndexManifest {
        schema_version: SCHEMA_VERSION,
        index_name: index_name.to_string(),
        version: 0,
        digest: None,
        updated_at: None,
    }
}

/// Bump the version after a successful mutation.
pub fn bump_manifest(index_path: &Path, index_name: &str) -> Result<IndexManifest, IndexError> {
    let current = load_manifest(index_path, index_name);
    let updated = IndexManifest {
        schema_version: SCHEMA_VERSION,
        index_name: index_name.to_string(),
        version: current.version + 1,
        digest: current.digest,
        updated_at: Some(autocap_spec::now_utc()),
    };
    write_manifest(index_path, &updated)?;
    Ok(updated)
}

/// Refresh the digest without bumping the version. No-op when the digest
/// is unchanged.
pub fn update_manifest_digest(
    index_path: &Path,
    index_name: &str,
    digest: Option<String>,
) -> Result<IndexManifest, IndexError> {
    let current = load_manifest(index_path, index_name);
    if current.digest == digest {
        return Ok(current);
    }
    let updated = IndexManifest {
        digest,
        updated_at: Some(autocap_spec::now_utc()),
        ..current
    };
    write_manifest(index_path, &updated)?;
    Ok(updated)
}

fn write_manifest(index_path: &Path, manifest: &IndexManifest) -> Result<(), IndexError> {
    let path = manifest_path(index_path);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.writing");
    std::fs::write(&tmp, serde_json::to_vec_pretty(manifest)?)?;
    std::fs::rename(&tmp, &path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versions_increase_monotonically() {
        let dir = tempfile::tempdir().unwrap();
        let index = dir.path().join("lexical.idx");
        let first = bump_manifest(&index, "lexical").unwrap();
        let second = bump_manifest(&index, "lexical").unwrap();
        assert_eq!(first.version, 1);
        assert_eq!(second.version, 2);
    }

    #[test]
    fn digest_update_does_not_bump_version() {
        let dir = tempfile::tempdir().unwrap();
        let index = dir.path().join("vector.idx");
        bump_manifest(&index, "vector").unwrap();
        let updated =
            update_manifest_digest(&index, "vector", Some("abc123".to_string())).unwrap();
        assert_eq!(updated.version, 1);
        assert_eq!(updated.digest.as_deref(), Some("abc123"));
        // Same digest again: untouched.
        let again = update_manifest_digest(&index, "vector", Some("abc123".to_string())).unwrap();
        assert_eq!(again, updated);
    }

    #[test]
    fn sidecar_name_appends_full_suffix() {
        let path = manifest_path(Path::new("data/lexical.idx"));
        assert_eq!(path, Path::new("data/lexical.idx.manifest.json"));
    }
}
