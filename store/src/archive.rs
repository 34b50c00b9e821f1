//! Archive export/verify/import over the data directory.
//!
//! Archives are deterministic zips: members are added in sorted relative
//! order with fixed timestamps and 0644 permissions, and a `manifest.json`
//! of per-member SHA-256 digests is appended last. Import verifies the
//! manifest first and rejects zip-slip, absolute, parent-traversal,
//! drive-prefixed, and symlink members.

use crate::StoreError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// Archive manifest: relative member path to SHA-256.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveManifest {
    /// Manifest schema version.
    pub schema_version: u32,
    /// Member digests keyed by relative path.
    pub files: BTreeMap<String, String>,
}

const MANIFEST_NAME: &str = "manifest.json";

fn member_options() -> FileOptions {
    FileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .unix_permissions(0o644)
        .last_modified_time(zip::DateTime::default())
}

/// Export `source_dir` into a zip archive at `output`.
pub fn create_archive(source_dir: &Path, output: &Path) -> Result<ArchiveManifest, StoreError> {
    let mut members = Vec::new();
    collect(source_dir, source_dir, &mut members)?;
    members.sort();
    let mut files = BTreeMap::new();
    let mut writer = ZipWriter::new(File::create(output)?);
    for rel in &members {
        let data = std::fs::read(source_dir.join(rel))?;
        files.insert(rel.clone(), autocap_spec::sha256_hex(&data));
        writer.start_file(rel.clone(), member_options())?;
        writer.write_all(&data)?;
    }
    let manifest = ArchiveManifest {
        schema_version: 1,
        files,
    };
    writer.start_file(MANIFEST_NAME, member_options())?;
    writer.write_all(serde_json::to_vec_pretty(&manifest)?.as_slice())?;
    writer.finish()?;
    Ok(manifest)
}

/// Verify an archive against its embedded manifest. Returns the list of
/// issues; an empty list means the archive is intact.
pub fn verify_archive(path: &Path) -> Result<Vec<String>, StoreError> {
    let mut archive = ZipArchive::new(File::open(path)?)?;
    let manifest: ArchiveManifest = {
        let mut member = match archive.by_name(MANIFEST_NAME) {
            Ok(member) => member,
            Err(_) => return Ok(vec!["manifest_missing".to_string()]),
        };
        let mut bytes = Vec::new();
        member.read_to_end(&mut bytes)?;
        match serde_json::from_slice(&bytes) {
            Ok(manifest) => manifest,
            Err(_) => return Ok(vec!["manifest_invalid".to_string()]),
        }
    };
    let mut issues = Vec::new();
    for (rel, expected) in &manifest.files {
        if !is_safe_member(rel) {
            issues.push(format!("unsafe_member:{rel}"));
            continue;
        }
        let mut member = match archive.by_name(rel) {
            Ok(member) => member,
            Err(_) => {
                issues.push(format!("missing_member:{rel}"));
                continue;
            }
        };
        let mut bytes = Vec::new();
        member.read_to_end(&mut bytes)?;
        if autocap_spec::sha256_hex(&bytes) != *expected {
            issues.push(format!("hash_mismatch:{rel}"));
        }
    }
    Ok(issues)
}

/// Import an archive into `target_dir` after verification. Rejects unsafe
/// and symlink members before writing anything.
pub fn import_archive(path: &Path, target_dir: &Path) -> Result<(), StoreError> {
    let issues = verify_archive(path)?;
    if !issues.is_empty() {
        return Err(StoreError::ArchiveRejected(issues.join(", ")));
    }
    let mut archive = ZipArchive::new(File::open(path)?)?;
    let target = target_dir.to_path_buf();
    std::fs::create_dir_all(&target)?;

    // Full safety pass before any byte lands on disk.
    for idx in 0..archive.len() {
        let member = archive.by_index(idx)?;
        let name = member.name().to_string();
        if !is_safe_member(&name) {
            return Err(StoreError::ArchiveRejected(format!("unsafe_zip_member:{name}")));
        }
        if is_symlink(member.unix_mode()) {
            return Err(StoreError::ArchiveRejected(format!("unsafe_zip_symlink:{name}")));
        }
        let out = target.join(&name);
        if !out.starts_with(&target) {
            return Err(StoreError::ArchiveRejected(format!("zip_slip:{name}")));
        }
    }
    for idx in 0..archive.len() {
        let mut member = archive.by_index(idx)?;
        let name = member.name().to_string();
        if name == MANIFEST_NAME {
            // The manifest describes the tree; it is not part of it.
            continue;
        }
        let out = target.join(&name);
        if member.is_dir() {
            std::fs::create_dir_all(&out)?;
            continue;
        }
        if let Some(parent) = out.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = File::create(&out)?;
        std::io::copy(&mut member, &mut file)?;
    }
    Ok(())
}

fn is_safe_member(name: &str) -> bool {
    if name.is_empty() {
        return false;
    }
    let normalized = name.replace('\\', "/");
    if normalized.starts_with('/') {
        return false;
    }
    let parts: Vec<&str> = normalized.split('/').collect();
    if parts.iter().any(|part| part.is_empty() || *part == "." || *part == "..") {
        return false;
    }
    if parts[0].contains(':') {
        return false;
    }
    true
}

fn is_symlink(unix_mode: Option<u32>) -> bool {
    matches!(unix_mode, Some(mode) if mode & 0o170000 == 0o120000)
}

fn collect(root: &Path, dir: &Path, out: &mut Vec<String>) -> Result<(), StoreError> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect(root, &path, out)?;
        } else if path.is_file() {
            let rel = path
                .strip_prefix(root)
                .map_err(|err| StoreError::ArchiveRejected(err.to_string()))?;
            out.push(rel.to_string_lossy().replace('\\', "/"));
        }
    }
    Ok(())
}

/// Convenience for tests and the CLI: export then import must produce a
/// byte-identical tree.
pub fn roundtrip_dirs_equal(left: &Path, right: &Path) -> Result<bool, StoreError> {
    let mut left_files = Vec::new();
    collect(left, left, &mut left_files)?;
    let mut right_files = Vec::new();
    collect(right, right, &mut right_files)?;
    left_files.sort();
    right_files.sort();
    if left_files != right_files {
        return Ok(false);
    }
    for rel in &left_files {
        if std::fs::read(left.join(rel))? != std::fs::read(right.join(rel))? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Path helper for exports; the zip sits next to the data dir by default.
pub fn default_archive_path(data_dir: &Path) -> PathBuf {
    data_dir.with_extension("archive.zip")
}
