//! Tiered retrieval planner: FAST (lexical) → FUSION (lexical+vector
//! via RRF) → RERANK, escalating only while recall stays below the
//! configured thresholds.

use crate::fusion::rrf_fusion;
use crate::lexical::LexicalIndex;
use crate::rerank::Reranker;
use crate::vector::VectorIndex;
use crate::Hit;
use serde_json::{json, Value};

/// Retrieval tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    /// Lexical only.
    Fast,
    /// Lexical + vector fused.
    Fusion,
    /// Fused list reranked.
    Rerank,
}

impl Tier {
    /// Wire string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Fast => "FAST",
            Tier::Fusion => "FUSION",
            Tier::Rerank => "RERANK",
        }
    }
}

/// Result with the escalation trace.
#[derive(Debug, Clone)]
pub struct RetrievalResult {
    /// Final ranked hits.
    pub results: Vec<Hit>,
    /// One trace row per tier that ran.
    pub trace: Vec<Value>,
}

impl RetrievalResult {
    /// Tiers visited, in order.
    pub fn tiers(&self) -> Vec<String> {
        self.trace
            .iter()
            .filter_map(|row| row.get("tier").and_then(Value::as_str))
            .map(str::to_string)
            .collect()
    }
}

/// The planner.
pub struct TieredRetriever {
    lexical: LexicalIndex,
    vector: VectorIndex,
    reranker: Reranker,
    fast_threshold: usize,
    fusion_threshold: usize,
    query_limit: usize,
}

impl TieredRetriever {
    /// Planner over both indexes.
    pub fn new(
        lexical: LexicalIndex,
        vector: VectorIndex,
        reranker: Reranker,
        fast_threshold: usize,
        fusion_threshold: usize,
    ) -> Self {
        TieredRetriever {
            lexical,
            vector,
            reranker,
            fast_threshold,
            fusion_threshold,
            query_limit: 10,
        }
    }

    /// Lexical index handle.
    pub fn lexical(&self) -> &LexicalIndex {
        &self.lexical
    }

    /// Vector index handle.
    pub fn vector(&self) -> &VectorIndex {
        &self.vector
    }

    /// Run the plan for a query.
    pub fn retrieve(&self, query: &str) -> RetrievalResult {
        let span = tracing::info_span!("retrieve", query_len = query.len());
        let _guard = span.enter();
        let mut trace = Vec::new();

        let fast_hits = self.lexical.query(query, self.query_limit);
        trace.push(json!({
            "tier": Tier::Fast.as_str(),
            "reason": "lexical",
            "result_count": fast_hits.len(),
        }));
        if fast_hits.len() >= self.fast_threshold {
            return RetrievalResult {
                results: fast_hits,
                trace,
            };
        }

        let vector_hits: Vec<Hit> = self
            .vector
            .query(query, self.query_limit)
            .into_iter()
            .map(|hit| Hit {
                doc_id: hit.doc_id,
                snippet: None,
                score: hit.score,
            })
            .collect();
        let fused = rrf_fusion(&[fast_hits, vector_hits]);
        trace.push(json!({
            "tier": Tier::Fusion.as_str(),
            "reason": "rrf",
            "result_count": fused.len(),
        }));
        if fused.len() >= self.fusion_threshold {
            return RetrievalResult {
                results: fused,
                trace,
            };
        }

        let reranked = self.reranker.rerank(query, &fused, &|_| None);
        trace.push(json!({
            "tier": Tier::Rerank.as_str(),
            "reason": "low_recall",
            "result_count": reranked.len(),
        }));
        RetrievalResult {
            results: reranked,
            trace,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embed::HashEmbedder;
    use std::sync::Arc;

    fn retriever(dir: &std::path::Path, fast: usize, fusion: usize) -> TieredRetriever {
        let lexical = LexicalIndex::open(&dir.join("lexical.idx")).unwrap();
        let vector = VectorIndex::open(
            &dir.join("vector.idx"),
            Arc::new(HashEmbedder::new(64)),
        )
        .unwrap();
        TieredRetriever::new(lexical, vector, Reranker::new(), fast, fusion)
    }

    #[test]
    fn escalates_fast_to_fusion_on_thin_recall() {
        let dir = tempfile::tempdir().unwrap();
        let retriever = retriever(dir.path(), 2, 1);
        retriever.lexical().index("doc1", "hello world").unwrap();
        retriever.vector().index("doc1", "hello world").unwrap();
        let result = retriever.retrieve("hello");
        assert_eq!(result.tiers(), vec!["FAST".to_string(), "FUSION".to_string()]);
        assert_eq!(result.results[0].doc_id, "doc1");
    }

    #[test]
    fn fast_tier_short_circuits_with_enough_hits() {
        let dir = tempfile::tempdir().unwrap();
        let retriever = retriever(dir.path(), 1, 1);
        retriever.lexical().index("doc1", "hello world").unwrap();
        let result = retriever.retrieve("hello");
        assert_eq!(result.tiers(), vec!["FAST".to_string()]);
    }

    #[test]
    fn escalates_to_rerank_when_fusion_is_thin() {
        let dir = tempfile::tempdir().unwrap();
        let retriever = retriever(dir.path(), 5, 5);
        retriever.lexical().index("doc1", "hello world").unwrap();
        retriever.vector().index("doc1", "hello world").unwrap();
        let result = retriever.retrieve("hello");
        assert_eq!(
            result.tiers(),
            vec!["FAST".to_string(), "FUSION".to_string(), "RERANK".to_string()]
        );
    }

    #[test]
    fn identical_queries_produce_identical_traces() {
        let dir = tempfile::tempdir().unwrap();
        let retriever = retriever(dir.path(), 2, 1);
        retriever.lexical().index("doc1", "hello world").unwrap();
        retriever.vector().index("doc1", "hello world").unwrap();
        let first = retriever.retrieve("hello");
        let second = retriever.retrieve("hello");
        assert_eq!(first.trace, second.trace);
        let first_ids: Vec<_> = first.results.iter().map(|hit| &hit.doc_id).collect();
        let second_ids: Vec<_> = second.results.iter().map(|hit| &hit.doc_id).collect();
        assert_eq!(first_ids, second_ids);
    }
}
