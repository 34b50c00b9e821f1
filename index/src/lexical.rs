//! File-backed lexical index with BM25 ranking.
//!
//! Documents persist as a single JSON file; every mutation rewrites it
//! atomically and bumps the manifest. Raw scores follow the rank
//! convention of FTS engines (lower is better); the reported score is
//! normalized to `1/(1+max(raw, 0))` so higher is better.

use crate::manifest::{bump_manifest, load_manifest, manifest_path, update_manifest_digest};
use crate::{Hit, IndexError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

const INDEX_NAME: &str = "lexical";
const BM25_K1: f64 = 1.2;
const BM25_B: f64 = 0.75;

#[derive(Debug, Default, Serialize, Deserialize)]
struct LexicalFile {
    docs: BTreeMap<String, String>,
}

struct IdentityCache {
    mtime: Option<std::time::SystemTime>,
    payload: Option<Value>,
}

/// The lexical index.
pub struct LexicalIndex {
    path: PathBuf,
    state: Mutex<LexicalFile>,
    identity: Mutex<IdentityCache>,
}

impl LexicalIndex {
    /// Open (or create) the index at `path`.
    pub fn open(path: &Path) -> Result<Self, IndexError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let state = if path.exists() {
            serde_json::from_slice(&std::fs::read(path)?)?
        } else {
            LexicalFile::default()
        };
        Ok(LexicalIndex {
            path: path.to_path_buf(),
            state: Mutex::new(state),
            identity: Mutex::new(IdentityCache {
                mtime: None,
                payload: None,
            }),
        })
    }

    /// Index (or replace) a document.
    pub fn index(&self, doc_id: &str, content: &str) -> Result<(), IndexError> {
        let span = tracing::info_span!("lexical_index", doc_id = %doc_id);
        let _guard = span.enter();
        {
            let mut state = self.state.lock();
            state.docs.insert(doc_id.to_string(), content.to_string());
            self.persist(&state)?;
        }
        bump_manifest(&self.path, INDEX_NAME)?;
        Ok(())
    }

    /// Index only when the content changed; identical content does not
    /// bump the manifest.
    pub fn index_if_changed(&self, doc_id: &str, content: &str) -> Result<bool, IndexError> {
        {
            let state = self.state.lock();
            if state.docs.get(doc_id).map(String::as_str) == Some(content) {
                return Ok(false);
            }
        }
        self.index(doc_id, content)?;
        Ok(true)
    }

    /// Number of indexed documents.
    pub fn count(&self) -> usize {
        self.state.lock().docs.len()
    }

    /// Query with BM25 ranking. Ties break by lexicographic doc id.
    pub fn query(&self, text: &str, limit: usize) -> Vec<Hit> {
        let state = self.state.lock();
        let terms = tokenize(text);
        if terms.is_empty() || state.docs.is_empty() {
            return Vec::new();
        }
        let total_docs = state.docs.len() as f64;
        let doc_tokens: BTreeMap<&String, Vec<String>> = state
            .docs
            .iter()
            .map(|(id, content)| (id, tokenize(content)))
            .collect();
        let avg_len = doc_tokens
            .values()
            .map(|tokens| tokens.len() as f64)
            .sum::<f64>()
            / total_docs;
        let mut scored: Vec<(f64, &String)> = Vec::new();
        for (doc_id, tokens) in &doc_tokens {
            let mut bm25 = 0.0f64;
            for term in &terms {
                let df = doc_tokens
                    .values()
                    .filter(|doc| doc.iter().any(|token| token == term))
                    .count() as f64;
                if df == 0.0 {
                    continue;
                }
                let tf = tokens.iter().filter(|token| *token == term).count() as f64;
                if tf == 0.0 {
                    continue;
                }
                let idf = ((total_docs - df + 0.5) / (df + 0.5) + 1.0).ln();
                let denom = tf
                    + BM25_K1 * (1.0 - BM25_B + BM25_B * tokens.len() as f64 / avg_len.max(1.0));
                bm25 += idf * tf * (BM25_K1 + 1.0) / denom;
            }
            if bm25 > 0.0 {
                // Rank convention: lower raw is better.
                scored.push((-bm25, *doc_id));
            }
        }
        scored.sort_by(|a, b| {
            a.0.partial_cmp(&b.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.1.cmp(b.1))
        });
        scored
            .into_iter()
            .take(limit)
            .map(|(raw, doc_id)| Hit {
                doc_id: doc_id.clone(),
                snippet: state.docs.get(doc_id).map(|content| snippet(content, &terms)),
                score: 1.0 / (1.0 + raw.max(0.0)),
            })
            .collect()
    }

    /// Identity for cache invalidation: `{backend, path, digest, version,
    /// manifest_path}`. The digest is recomputed when the file mtime
    /// changed since the last call.
    pub fn identity(&self) -> Result<Value, IndexError> {
        let mtime = std::fs::metadata(&self.path)
            .and_then(|meta| meta.modified())
            .ok();
        {
            let cache = self.identity.lock();
            if cache.mtime == mtime {
                if let Some(payload) = &cache.payload {
                    return Ok(payload.clone());
                }
            }
        }
        let digest = if self.path.exists() {
            Some(autocap_spec::sha256_file(&self.path)?)
        } else {
            None
        };
        let manifest = update_manifest_digest(&self.path, INDEX_NAME, digest.clone())?;
        let payload = json!({
            "backend": "bm25_file",
            "path": self.path.to_string_lossy(),
            "digest": digest,
            "version": manifest.version,
            "manifest_path": manifest_path(&self.path).to_string_lossy(),
        });
        *self.identity.lock() = IdentityCache {
            mtime,
            payload: Some(payload.clone()),
        };
        Ok(payload)
    }

    /// Current manifest version.
    pub fn version(&self) -> u64 {
        load_manifest(&self.path, INDEX_NAME).version
    }

    /// Index file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, state: &LexicalFile) -> Result<(), IndexError> {
        let tmp = self.path.with_extension("writing");
        std::fs::write(&tmp, serde_json::to_vec(state)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.split(|ch: char| !ch.is_ascii_alphanumeric() && ch != '_')
        .filter(|token| !token.is_empty())
        .map(str::to_ascii_lowercase)
        .collect()
}

/// Bracket the first matching term and trim to a ten-token window.
fn snippet(content: &str, terms: &[String]) -> String {
    let words: Vec<&str> = content.split_whitespace().collect();
    let hit = words.iter().position(|word| {
        let lowered = word.to_ascii_lowercase();
        terms.iter().any(|term| lowered.contains(term.as_str()))
    });
    let Some(hit) = hit else {
        return words.iter().take(10).cloned().collect::<Vec<_>>().join(" ");
    };
    let start = hit.saturating_sub(4);
    let end = (start + 10).min(words.len());
    let mut parts: Vec<String> = Vec::new();
    if start > 0 {
        parts.push("...".to_string());
    }
    for (idx, word) in words[start..end].iter().enumerate() {
        if start + idx == hit {
            parts.push(format!("[{word}]"));
        } else {
            parts.push((*word).to_string());
        }
    }
    if end < words.len() {
        parts.push("...".to_string());
    }
    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index(dir: &Path) -> LexicalIndex {
        LexicalIndex::open(&dir.join("lexical.idx")).unwrap()
    }

    #[test]
    fn query_returns_normalized_scores() {
        let dir = tempfile::tempdir().unwrap();
        let idx = index(dir.path());
        idx.index("doc1", "hello world").unwrap();
        idx.index("doc2", "unrelated content entirely").unwrap();
        let hits = idx.query("hello", 10);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].doc_id, "doc1");
        assert!(hits[0].score > 0.0 && hits[0].score <= 1.0);
        assert!(hits[0].snippet.as_deref().unwrap().contains("[hello]"));
    }

    #[test]
    fn better_matches_rank_first_with_doc_id_ties() {
        let dir = tempfile::tempdir().unwrap();
        let idx = index(dir.path());
        idx.index("b", "rust rust rust language").unwrap();
        idx.index("a", "rust language").unwrap();
        idx.index("c", "python language").unwrap();
        let hits = idx.query("rust", 10);
        assert_eq!(hits[0].doc_id, "b");
        assert_eq!(hits[1].doc_id, "a");
    }

    #[test]
    fn mutation_bumps_manifest_and_idempotent_reindex_does_not() {
        let dir = tempfile::tempdir().unwrap();
        let idx = index(dir.path());
        idx.index("doc1", "hello").unwrap();
        let after_first = idx.version();
        assert!(idx.index_if_changed("doc1", "hello changed").unwrap());
        let after_change = idx.version();
        assert_eq!(after_change, after_first + 1);
        assert!(!idx.index_if_changed("doc1", "hello changed").unwrap());
        assert_eq!(idx.version(), after_change);
    }

    #[test]
    fn identity_tracks_digest_and_version() {
        let dir = tempfile::tempdir().unwrap();
        let idx = index(dir.path());
        idx.index("doc1", "hello").unwrap();
        let identity = idx.identity().unwrap();
        let digest = identity["digest"].as_str().unwrap().to_string();
        assert_eq!(
            digest,
            autocap_spec::sha256_file(idx.path()).unwrap()
        );
        idx.index("doc2", "world").unwrap();
        let updated = idx.identity().unwrap();
        assert_ne!(updated["digest"].as_str().unwrap(), digest);
        assert!(updated["version"].as_u64().unwrap() > identity["version"].as_u64().unwrap());
    }
}
