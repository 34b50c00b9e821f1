//! Deterministic reranker: term overlap plus phrase and exact-match
//! bonuses, tie-broken by doc id.

use crate::Hit;
use std::collections::BTreeSet;

/// The reranker.
#[derive(Debug, Default)]
pub struct Reranker;

impl Reranker {
    /// New reranker.
    pub fn new() -> Self {
        Reranker
    }

    /// Rerank hits against the query. `texts` supplies document content
    /// when available; hits without text keep their base score.
    pub fn rerank(&self, query: &str, hits: &[Hit], text_for: &dyn Fn(&str) -> Option<String>) -> Vec<Hit> {
        let query_norm = query.trim().to_ascii_lowercase();
        let terms: BTreeSet<String> = query_norm
            .split_whitespace()
            .map(str::to_string)
            .collect();
        let mut scored: Vec<Hit> = hits
            .iter()
            .map(|hit| {
                let mut score = hit.score;
                if let Some(text) = text_for(&hit.doc_id) {
                    let text_norm = text.trim().to_ascii_lowercase();
                    let overlap = terms
                        .iter()
                        .filter(|term| text_norm.contains(term.as_str()))
                        .count() as f64;
                    let phrase_bonus = if !query_norm.is_empty() && text_norm.contains(&query_norm)
                    {
                        2.0
                    } else {
                        0.0
                    };
                    let exact_bonus = if !query_norm.is_empty() && text_norm == query_norm {
                        1.0
                    } else {
                        0.0
                    };
                    score += overlap + phrase_bonus + exact_bonus;
                }
                Hit {
                    doc_id: hit.doc_id.clone(),
                    snippet: hit.snippet.clone(),
                    score,
                }
            })
            .collect();
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.doc_id.cmp(&b.doc_id))
        });
        scored
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(doc_id: &str, score: f64) -> Hit {
        Hit {
            doc_id: doc_id.to_string(),
            snippet: None,
            score,
        }
    }

    #[test]
    fn phrase_match_outranks_overlap() {
        let reranker = Reranker::new();
        let texts = |doc_id: &str| -> Option<String> {
            match doc_id {
                "phrase" => Some("the quick brown fox".to_string()),
                "partial" => Some("quick fixes for brown walls".to_string()),
                _ => None,
            }
        };
        let reranked = reranker.rerank(
            "quick brown",
            &[hit("partial", 0.5), hit("phrase", 0.5)],
            &texts,
        );
        assert_eq!(reranked[0].doc_id, "phrase");
    }

    #[test]
    fn deterministic_with_doc_id_ties() {
        let reranker = Reranker::new();
        let none = |_: &str| -> Option<String> { None };
        let first = reranker.rerank("q", &[hit("b", 1.0), hit("a", 1.0)], &none);
        let second = reranker.rerank("q", &[hit("b", 1.0), hit("a", 1.0)], &none);
        assert_eq!(first, second);
        assert_eq!(first[0].doc_id, "a");
    }
}
