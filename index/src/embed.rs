//! Deterministic embedders. The hash embedder is the default: identical
//! text yields identical vectors bit for bit, which keeps vector index
//! digests reproducible. External embedder bundles plug in through the
//! same trait with their identity recorded for provenance.

use serde_json::{json, Value};
use sha2::{Digest, Sha256};

/// Text embedder.
pub trait Embedder: Send + Sync {
    /// Embed text into a fixed-dimension vector.
    fn embed(&self, text: &str) -> Vec<f32>;
    /// Vector dimensionality.
    fn dims(&self) -> usize;
    /// Identity payload recorded into index provenance.
    fn identity(&self) -> Value;
}

/// SHA-256 token-bin embedder, L2 normalized.
pub struct HashEmbedder {
    dims: usize,
    bundle: Option<BundleIdentity>,
}

/// External bundle identity attached when a model bundle was selected.
#[derive(Debug, Clone)]
pub struct BundleIdentity {
    /// Bundle id from `bundle.json`.
    pub bundle_id: String,
    /// Bundle version.
    pub version: String,
    /// Bundle directory.
    pub path: String,
}

impl HashEmbedder {
    /// Embedder with the default 384 dimensions.
    pub fn new(dims: usize) -> Self {
        HashEmbedder {
            dims: dims.max(1),
            bundle: None,
        }
    }

    /// Attach a discovered bundle's identity (dims come from the bundle).
    pub fn with_bundle(dims: usize, bundle: BundleIdentity) -> Self {
        HashEmbedder {
            dims: dims.max(1),
            bundle: Some(bundle),
        }
    }

    /// Discover an embedder bundle under `bundle_dir` (a directory with
    /// `bundle.json` declaring `{bundle_id, version, dims}`); falls back
    /// to the plain hash embedder.
    pub fn discover(bundle_dir: Option<&std::path::Path>, default_dims: usize) -> Self {
        let Some(dir) = bundle_dir else {
            return HashEmbedder::new(default_dims);
        };
        let manifest = dir.join("bundle.json");
        let Ok(bytes) = std::fs::read(&manifest) else {
            return HashEmbedder::new(default_dims);
        };
        let Ok(payload) = serde_json::from_slice::<Value>(&bytes) else {
            return HashEmbedder::new(default_dims);
        };
        let dims = payload
            .get("dims")
            .and_then(Value::as_u64)
            .map(|dims| dims as usize)
            .unwrap_or(default_dims);
        let bundle = BundleIdentity {
            bundle_id: payload
                .get("bundle_id")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
            version: payload
                .get("version")
                .and_then(Value::as_str)
                .unwrap_or("0")
                .to_string(),
            path: dir.to_string_lossy().into_owned(),
        };
        HashEmbedder::with_bundle(dims, bundle)
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        HashEmbedder::new(384)
    }
}

impl Embedder for HashEmbedder {
    fn embed(&self, text: &str) -> Vec<f32> {
        let mut vec = vec![0.0f32; self.dims];
        for token in tokens(text) {
            let mut hasher = Sha256::new();
            hasher.update(token.as_bytes());
            let digest = hasher.finalize();
            let bin = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]) as usize
                % self.dims;
            vec[bin] += 1.0;
        }
        let norm = vec.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for value in &mut vec {
                *value /= norm;
            }
        }
        vec
    }

    fn dims(&self) -> usize {
        self.dims
    }

    fn identity(&self) -> Value {
        let mut payload = json!({"backend": "hash", "dims": self.dims});
        if let Some(bundle) = &self.bundle {
            payload["bundle_id"] = json!(bundle.bundle_id);
            payload["bundle_version"] = json!(bundle.version);
            payload["bundle_path"] = json!(bundle.path);
        }
        payload
    }
}

fn tokens(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        if ch.is_ascii_alphanumeric() || ch == '_' {
            current.push(ch.to_ascii_lowercase());
        } else if !current.is_empty() {
            out.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedding_is_bit_for_bit_deterministic() {
        let embedder = HashEmbedder::default();
        let first = embedder.embed("hello world from the capture engine");
        let second = embedder.embed("hello world from the capture engine");
        assert_eq!(first, second);
        assert_eq!(first.len(), 384);
    }

    #[test]
    fn vectors_are_l2_normalized() {
        let embedder = HashEmbedder::new(64);
        let vec = embedder.embed("some text with tokens");
        let norm: f32 = vec.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn empty_text_is_a_zero_vector() {
        let embedder = HashEmbedder::new(16);
        assert!(embedder.embed("").iter().all(|v| *v == 0.0));
    }

    #[test]
    fn bundle_identity_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("bundle.json"),
            serde_json::to_vec(&json!({"bundle_id": "minilm", "version": "2", "dims": 128}))
                .unwrap(),
        )
        .unwrap();
        let embedder = HashEmbedder::discover(Some(dir.path()), 384);
        assert_eq!(embedder.dims(), 128);
        let identity = embedder.identity();
        assert_eq!(identity["bundle_id"], json!("minilm"));
    }
}
