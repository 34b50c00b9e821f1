//! Cosine vector index with int16-quantized export.

use crate::embed::Embedder;
use crate::manifest::{bump_manifest, load_manifest, manifest_path, update_manifest_digest};
use crate::IndexError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const INDEX_NAME: &str = "vector";
const QUANT_MAX: f32 = 32767.0;

#[derive(Debug, Default, Serialize, Deserialize)]
struct VectorFile {
    vectors: BTreeMap<String, Vec<f32>>,
}

/// One scored vector hit.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorHit {
    /// Document id.
    pub doc_id: String,
    /// Cosine similarity; higher is better.
    pub score: f64,
}

/// The vector index.
pub struct VectorIndex {
    path: PathBuf,
    embedder: Arc<dyn Embedder>,
    state: Mutex<VectorFile>,
}

impl VectorIndex {
    /// Open (or create) the index at `path` with an embedder.
    pub fn open(path: &Path, embedder: Arc<dyn Embedder>) -> Result<Self, IndexError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let state = if path.exists() {
            serde_json::from_slice(&std::fs::read(path)?)?
        } else {
            VectorFile::default()
        };
        Ok(VectorIndex {
            path: path.to_path_buf(),
            embedder,
            state: Mutex::new(state),
        })
    }

    /// Embed and index (or replace) a document.
    pub fn index(&self, doc_id: &str, text: &str) -> Result<(), IndexError> {
        let vector = self.embedder.embed(text);
        {
            let mut state = self.state.lock();
            state.vectors.insert(doc_id.to_string(), vector);
            self.persist(&state)?;
        }
        bump_manifest(&self.path, INDEX_NAME)?;
        Ok(())
    }

    /// Index only when the embedded vector changed.
    pub fn index_if_changed(&self, doc_id: &str, text: &str) -> Result<bool, IndexError> {
        let vector = self.embedder.embed(text);
        {
            let state = self.state.lock();
            if state.vectors.get(doc_id) == Some(&vector) {
                return Ok(false);
            }
        }
        {
            let mut state = self.state.lock();
            state.vectors.insert(doc_id.to_string(), vector);
            self.persist(&state)?;
        }
        bump_manifest(&self.path, INDEX_NAME)?;
        Ok(true)
    }

    /// Number of indexed vectors.
    pub fn count(&self) -> usize {
        self.state.lock().vectors.len()
    }

    /// Cosine query; ties break by lexicographic doc id.
    pub fn query(&self, text: &str, limit: usize) -> Vec<VectorHit> {
        let query_vec = self.embedder.embed(text);
        let state = self.state.lock();
        let mut hits: Vec<VectorHit> = state
            .vectors
            .iter()
            .map(|(doc_id, vector)| VectorHit {
                doc_id: doc_id.clone(),
                score: cosine(&query_vec, vector),
            })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.doc_id.cmp(&b.doc_id))
        });
        hits.truncate(limit);
        hits
    }

    /// Export as int16-quantized JSON: `{schema_version, dims, scale,
    /// doc_ids, vectors}`. Values beyond the scale clamp with a warning.
    pub fn export_json(&self, path: &Path) -> Result<Value, IndexError> {
        let state = self.state.lock();
        let doc_ids: Vec<String> = state.vectors.keys().cloned().collect();
        let dims = state
            .vectors
            .values()
            .next()
            .map(Vec::len)
            .unwrap_or(self.embedder.dims());
        let max_abs = state
            .vectors
            .values()
            .flat_map(|vector| vector.iter())
            .fold(0.0f32, |acc, value| acc.max(value.abs()));
        let scale = if max_abs > 0.0 { max_abs / QUANT_MAX } else { 1.0 };
        let mut quantized: Vec<Vec<i16>> = Vec::with_capacity(doc_ids.len());
        for doc_id in &doc_ids {
            let vector = &state.vectors[doc_id];
            let mut row = Vec::with_capacity(vector.len());
            for value in vector {
                let quant = (value / scale).round();
                if quant.abs() > QUANT_MAX {
                    tracing::warn!(doc_id = %doc_id, "vector component clamped during export");
                }
                row.push(quant.clamp(-QUANT_MAX, QUANT_MAX) as i16);
            }
            quantized.push(row);
        }
        let payload = json!({
            "schema_version": 1,
            "dims": dims,
            "scale": autocap_spec::float_token(scale as f64),
            "doc_ids": doc_ids,
            "vectors": quantized,
        });
        let tmp = path.with_extension("writing");
        std::fs::write(&tmp, serde_json::to_vec_pretty(&payload)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(payload)
    }

    /// Import a quantized export, dequantizing with the embedded scale.
    pub fn import_json(&self, path: &Path) -> Result<usize, IndexError> {
        let payload: Value = serde_json::from_slice(&std::fs::read(path)?)?;
        let scale = payload
            .get("scale")
            .and_then(parse_scale)
            .unwrap_or(1.0);
        let doc_ids = payload
            .get("doc_ids")
            .and_then(Value::as_array)
            .ok_or_else(|| IndexError::ImportRejected("doc_ids missing".into()))?;
        let vectors = payload
            .get("vectors")
            .and_then(Value::as_array)
            .ok_or_else(|| IndexError::ImportRejected("vectors missing".into()))?;
        if doc_ids.len() != vectors.len() {
            return Err(IndexError::ImportRejected(
                "doc_ids and vectors disagree in length".into(),
            ));
        }
        let mut imported = 0;
        {
            let mut state = self.state.lock();
            for (doc_id, row) in doc_ids.iter().zip(vectors) {
                let Some(doc_id) = doc_id.as_str() else {
                    continue;
                };
                let Some(row) = row.as_array() else {
                    continue;
                };
                let vector: Vec<f32> = row
                    .iter()
                    .filter_map(Value::as_i64)
                    .map(|quant| quant as f32 * scale)
                    .collect();
                state.vectors.insert(doc_id.to_string(), vector);
                imported += 1;
            }
            self.persist(&state)?;
        }
        bump_manifest(&self.path, INDEX_NAME)?;
        Ok(imported)
    }

    /// Identity payload including the embedder identity.
    pub fn identity(&self) -> Result<Value, IndexError> {
        let digest = if self.path.exists() {
            Some(autocap_spec::sha256_file(&self.path)?)
        } else {
            None
        };
        let manifest = update_manifest_digest(&self.path, INDEX_NAME, digest.clone())?;
        Ok(json!({
            "backend": "cosine_file",
            "path": self.path.to_string_lossy(),
            "digest": digest,
            "version": manifest.version,
            "manifest_path": manifest_path(&self.path).to_string_lossy(),
            "embedder": self.embedder.identity(),
        }))
    }

    /// Current manifest version.
    pub fn version(&self) -> u64 {
        load_manifest(&self.path, INDEX_NAME).version
    }

    fn persist(&self, state: &VectorFile) -> Result<(), IndexError> {
        let tmp = self.path.with_extension("writing");
        std::fs::write(&tmp, serde_json::to_vec(state)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f64 {
    let dot: f64 = a.iter().zip(b).map(|(x, y)| (*x as f64) * (*y as f64)).sum();
    let na: f64 = a.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    let nb: f64 = b.iter().map(|y| (*y as f64).powi(2)).sum::<f64>().sqrt();
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na * nb)
}

fn parse_scale(value: &Value) -> Option<f32> {
    match value {
        Value::Number(num) => num.as_f64().map(|scale| scale as f32),
        Value::String(text) => text.parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embed::HashEmbedder;

    fn index(dir: &Path) -> VectorIndex {
        VectorIndex::open(
            &dir.join("vector.idx"),
            Arc::new(HashEmbedder::new(64)),
        )
        .unwrap()
    }

    #[test]
    fn query_prefers_similar_documents() {
        let dir = tempfile::tempdir().unwrap();
        let idx = index(dir.path());
        idx.index("doc1", "hello world").unwrap();
        idx.index("doc2", "completely different topic").unwrap();
        let hits = idx.query("hello", 2);
        assert_eq!(hits[0].doc_id, "doc1");
        assert!(hits[0].score > hits[1].score);
    }

    #[test]
    fn export_import_preserves_top_k_order() {
        let dir = tempfile::tempdir().unwrap();
        let idx = index(dir.path());
        for (doc, text) in [
            ("doc1", "rust systems language"),
            ("doc2", "rust memory safety"),
            ("doc3", "gardening in spring"),
            ("doc4", "rust borrow checker"),
        ] {
            idx.index(doc, text).unwrap();
        }
        let before: Vec<String> = idx.query("rust", 3).into_iter().map(|h| h.doc_id).collect();

        let export_path = dir.path().join("export.json");
        idx.export_json(&export_path).unwrap();
        let restored = index(&dir.path().join("fresh"));
        let imported = restored.import_json(&export_path).unwrap();
        assert_eq!(imported, 4);
        let after: Vec<String> = restored.query("rust", 3).into_iter().map(|h| h.doc_id).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn idempotent_reindex_bumps_version_once() {
        let dir = tempfile::tempdir().unwrap();
        let idx = index(dir.path());
        assert!(idx.index_if_changed("doc1", "content").unwrap());
        let version = idx.version();
        assert!(!idx.index_if_changed("doc1", "content").unwrap());
        assert_eq!(idx.version(), version);
    }

    #[test]
    fn identity_includes_embedder() {
        let dir = tempfile::tempdir().unwrap();
        let idx = index(dir.path());
        idx.index("doc1", "content").unwrap();
        let identity = idx.identity().unwrap();
        assert_eq!(identity["embedder"]["backend"], json!("hash"));
        assert!(identity["digest"].is_string());
    }
}
