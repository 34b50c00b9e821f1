//! Indexing and retrieval: lexical BM25, cosine vector search with
//! quantized export, versioned index manifests, the deterministic hash
//! embedder, tiered retrieval with RRF fusion and reranking, and answer
//! assembly with citations.

/// Answer assembly with claim-level citations.
pub mod answer;
/// Deterministic embedders.
pub mod embed;
/// Reciprocal rank fusion.
pub mod fusion;
/// Lexical full-text index.
pub mod lexical;
/// Versioned index manifests.
pub mod manifest;
/// Deterministic text-overlap reranker.
pub mod rerank;
/// Tiered retrieval planner.
pub mod tiers;
/// Cosine vector index.
pub mod vector;

pub use answer::{build_answer, Answer, AnswerState, Claim};
pub use embed::{Embedder, HashEmbedder};
pub use fusion::rrf_fusion;
pub use lexical::LexicalIndex;
pub use manifest::{manifest_path, IndexManifest};
pub use rerank::Reranker;
pub use tiers::{RetrievalResult, Tier, TieredRetriever};
pub use vector::{VectorHit, VectorIndex};

use thiserror::Error;

/// Errors raised by the index layer.
#[derive(Debug, Error)]
pub enum IndexError {
    /// Index file failure.
    #[error("index io: {0}")]
    Io(#[from] std::io::Error),
    /// Index document corrupt.
    #[error("index decode: {0}")]
    Decode(#[from] serde_json::Error),
    /// Export payload incompatible with this index.
    #[error("import rejected: {0}")]
    ImportRejected(String),
}

/// A scored lexical or fused hit.
#[derive(Debug, Clone, PartialEq)]
pub struct Hit {
    /// Document id.
    pub doc_id: String,
    /// Snippet of matched content (lexical hits only).
    pub snippet: Option<String>,
    /// Normalized score; higher is better.
    pub score: f64,
}
