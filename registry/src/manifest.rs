//! Plugin manifest schema (`plugin.json`) and discovery.

use crate::RegistryError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};

/// One declared entrypoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Entrypoint {
    /// Entrypoint kind, e.g. `capability`.
    pub kind: String,
    /// Capability or hook id the entrypoint provides.
    pub id: String,
    /// Artifact path relative to the plugin directory.
    #[serde(default)]
    pub path: String,
    /// Callable symbol within the artifact.
    #[serde(default)]
    pub callable: String,
}

/// Declared plugin permissions. Everything defaults to denied.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Permissions {
    /// Filesystem access beyond the plugin sandbox.
    #[serde(default)]
    pub filesystem: bool,
    /// GPU access.
    #[serde(default)]
    pub gpu: bool,
    /// Raw input hooks.
    #[serde(default)]
    pub raw_input: bool,
    /// Outbound network.
    #[serde(default)]
    pub network: bool,
}

/// Compatibility predicates.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Compat {
    /// Minimum kernel version (inclusive), `major.minor.patch`.
    #[serde(default)]
    pub requires_kernel: Option<String>,
    /// Schema versions the plugin understands.
    #[serde(default)]
    pub requires_schema_versions: Vec<u32>,
}

/// Expected hashes from the manifest itself (cross-checked with the
/// lockfile).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct HashLock {
    /// SHA-256 of `plugin.json`.
    #[serde(default)]
    pub manifest_sha256: Option<String>,
    /// SHA-256 over the plugin directory contents.
    #[serde(default)]
    pub artifact_sha256: Option<String>,
}

/// Parsed `plugin.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PluginManifest {
    /// Stable plugin id, e.g. `builtin.extract.ocr`.
    pub plugin_id: String,
    /// Plugin version string.
    pub version: String,
    /// Entrypoints the plugin exposes.
    #[serde(default)]
    pub entrypoints: Vec<Entrypoint>,
    /// Permission grants.
    #[serde(default)]
    pub permissions: Permissions,
    /// Capabilities the plugin needs from the kernel.
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    /// Compatibility predicates.
    #[serde(default)]
    pub compat: Compat,
    /// Plugins that must instantiate first.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Manifest-declared hashes.
    #[serde(default)]
    pub hash_lock: HashLock,
    /// Dotted settings paths the plugin may read.
    #[serde(default)]
    pub settings_paths: Vec<String>,
    /// Schema validating the plugin's settings subtree.
    #[serde(default)]
    pub settings_schema: Option<Value>,
    /// Free-form capability tags.
    #[serde(default)]
    pub capability_tags: Vec<String>,
    /// Capability names the plugin registers.
    #[serde(default)]
    pub provides: Vec<String>,
}

/// A manifest found on disk.
#[derive(Debug, Clone)]
pub struct DiscoveredPlugin {
    /// Parsed manifest.
    pub manifest: PluginManifest,
    /// Path of `plugin.json`.
    pub manifest_path: PathBuf,
    /// Plugin directory (the artifact root).
    pub dir: PathBuf,
}

/// Walk the search paths for `plugin.json` manifests. Unparseable
/// manifests are returned as errors in the second list so one broken
/// plugin never hides the others.
pub fn discover_manifests(
    search_paths: &[PathBuf],
) -> (Vec<DiscoveredPlugin>, Vec<RegistryError>) {
    let mut found = Vec::new();
    let mut errors = Vec::new();
    for root in search_paths {
        if !root.exists() {
            continue;
        }
        walk(root, &mut found, &mut errors);
    }
    found.sort_by(|a, b| a.manifest.plugin_id.cmp(&b.manifest.plugin_id));
    (found, errors)
}

fn walk(dir: &Path, found: &mut Vec<DiscoveredPlugin>, errors: &mut Vec<RegistryError>) {
    let manifest_path = dir.join("plugin.json");
    if manifest_path.is_file() {
        match parse_manifest(&manifest_path) {
            Ok(manifest) => found.push(DiscoveredPlugin {
                manifest,
                manifest_path,
                dir: dir.to_path_buf(),
            }),
            Err(err) => errors.push(err),
        }
        return;
    }
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.filter_map(|entry| entry.ok()) {
        let path = entry.path();
        if path.is_dir() {
            walk(&path, found, errors);
        }
    }
}

fn parse_manifest(path: &Path) -> Result<PluginManifest, RegistryError> {
    let bytes = std::fs::read(path).map_err(|err| RegistryError::Manifest {
        path: path.to_path_buf(),
        message: err.to_string(),
    })?;
    serde_json::from_slice(&bytes).map_err(|err| RegistryError::Manifest {
        path: path.to_path_buf(),
        message: err.to_string(),
    })
}

/// Compare `kernel_version` against the manifest's minimum requirement.
pub fn kernel_compatible(requires: Option<&str>, kernel_version: &str) -> bool {
    let Some(minimum) = requires else {
        return true;
    };
    match (parse_version(minimum), parse_version(kernel_version)) {
        (Some(min), Some(kernel)) => kernel >= min,
        _ => false,
    }
}

fn parse_version(text: &str) -> Option<(u32, u32, u32)> {
    let mut parts = text.trim().trim_start_matches(">=").trim().split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next().unwrap_or("0").parse().ok()?;
    let patch = parts.next().unwrap_or("0").parse().ok()?;
    Some((major, minor, patch))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    pub(crate) fn write_plugin(root: &Path, plugin_id: &str, manifest: Value) -> PathBuf {
        let dir = root.join(plugin_id);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("plugin.json"),
            serde_json::to_vec_pretty(&manifest).unwrap(),
        )
        .unwrap();
        dir
    }

    #[test]
    fn discovery_finds_nested_manifests() {
        let root = tempfile::tempdir().unwrap();
        write_plugin(
            root.path(),
            "builtin.capture.screen",
            json!({"plugin_id": "builtin.capture.screen", "version": "1.0.0"}),
        );
        write_plugin(
            root.path(),
            "builtin.extract.ocr",
            json!({
                "plugin_id": "builtin.extract.ocr",
                "version": "0.3.1",
                "permissions": {"gpu": true},
                "depends_on": ["builtin.capture.screen"],
            }),
        );
        let (found, errors) = discover_manifests(&[root.path().to_path_buf()]);
        assert!(errors.is_empty());
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].manifest.plugin_id, "builtin.capture.screen");
        assert!(found[1].manifest.permissions.gpu);
        assert!(!found[1].manifest.permissions.network);
    }

    #[test]
    fn broken_manifest_is_isolated() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("broken");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("plugin.json"), b"{not json").unwrap();
        write_plugin(
            root.path(),
            "builtin.ok",
            json!({"plugin_id": "builtin.ok", "version": "1.0.0"}),
        );
        let (found, errors) = discover_manifests(&[root.path().to_path_buf()]);
        assert_eq!(found.len(), 1);
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn kernel_compat_is_a_minimum_bound() {
        assert!(kernel_compatible(None, "1.2.3"));
        assert!(kernel_compatible(Some("1.0.0"), "1.2.3"));
        assert!(kernel_compatible(Some(">=1.2.0"), "1.2.0"));
        assert!(!kernel_compatible(Some("2.0.0"), "1.9.9"));
        assert!(!kernel_compatible(Some("not-a-version"), "1.0.0"));
    }
}
