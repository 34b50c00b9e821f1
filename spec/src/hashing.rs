//! Content hashing helpers. All persisted content hashes are SHA-256;
//! BLAKE3 is reserved for fast frame fingerprints.

use crate::canonical::canonical_json;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

/// SHA-256 of raw bytes, hex encoded.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// SHA-256 of a UTF-8 string, hex encoded.
pub fn sha256_text(text: &str) -> String {
    sha256_hex(text.as_bytes())
}

/// SHA-256 of the canonical JSON form of a value.
pub fn sha256_canonical(value: &Value) -> String {
    sha256_text(&canonical_json(value))
}

/// SHA-256 of a file, streamed in 64 KiB chunks.
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// SHA-256 over a directory tree: every file in sorted relative-path order
/// contributes `<relpath>\n` followed by its bytes. Used for plugin
/// artifact hashes, so the walk order must stay stable across platforms.
pub fn sha256_dir(root: &Path) -> io::Result<String> {
    let mut files = Vec::new();
    collect_files(root, root, &mut files)?;
    files.sort();
    let mut hasher = Sha256::new();
    for rel in files {
        hasher.update(rel.as_bytes());
        hasher.update(b"\n");
        let mut file = File::open(root.join(&rel))?;
        let mut buf = [0u8; 64 * 1024];
        loop {
            let read = file.read(&mut buf)?;
            if read == 0 {
                break;
            }
            hasher.update(&buf[..read]);
        }
    }
    Ok(hex::encode(hasher.finalize()))
}

/// BLAKE3 of raw bytes, hex encoded. Fast path for frame dedupe.
pub fn blake3_hex(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<String>) -> io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_files(root, &path, out)?;
        } else if path.is_file() {
            let rel = path
                .strip_prefix(root)
                .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;
            out.push(rel.to_string_lossy().replace('\\', "/"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sha256_matches_known_vector() {
        assert_eq!(
            sha256_text("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn canonical_hash_is_order_insensitive() {
        let a = json!({"x": 1, "y": 2});
        let b = json!({"y": 2, "x": 1});
        assert_eq!(sha256_canonical(&a), sha256_canonical(&b));
    }

    #[test]
    fn directory_hash_is_stable_across_write_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.txt"), b"two").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/a.txt"), b"one").unwrap();
        let first = sha256_dir(dir.path()).unwrap();

        let dir2 = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir2.path().join("sub")).unwrap();
        std::fs::write(dir2.path().join("sub/a.txt"), b"one").unwrap();
        std::fs::write(dir2.path().join("b.txt"), b"two").unwrap();
        assert_eq!(first, sha256_dir(dir2.path()).unwrap());
    }
}
