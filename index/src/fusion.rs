//! Reciprocal rank fusion: `score(d) = Σ 1/(k + rank_d)` across ranked
//! lists, with deterministic `(-score, doc_id)` ordering. Doc ids are
//! normalized to strings so mixed id types fuse without sort failures.

use crate::Hit;

const RRF_K: f64 = 60.0;

/// Fuse ranked lists of `(doc_id, score)` style hits.
pub fn rrf_fusion(rankings: &[Vec<Hit>]) -> Vec<Hit> {
    let mut scores: std::collections::BTreeMap<String, f64> = std::collections::BTreeMap::new();
    for ranking in rankings {
        for (rank, hit) in ranking.iter().enumerate() {
            let entry = scores.entry(hit.doc_id.clone()).or_insert(0.0);
            *entry += 1.0 / (RRF_K + rank as f64 + 1.0);
        }
    }
    let mut fused: Vec<Hit> = scores
        .into_iter()
        .map(|(doc_id, score)| Hit {
            doc_id,
            snippet: None,
            score,
        })
        .collect();
    fused.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.doc_id.cmp(&b.doc_id))
    });
    fused
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hits(ids: &[&str]) -> Vec<Hit> {
        ids.iter()
            .map(|id| Hit {
                doc_id: (*id).to_string(),
                snippet: None,
                score: 1.0,
            })
            .collect()
    }

    #[test]
    fn agreement_across_lists_wins() {
        let fused = rrf_fusion(&[hits(&["a", "b", "c"]), hits(&["b", "a"])]);
        assert_eq!(fused[0].doc_id, "a");
        assert_eq!(fused[1].doc_id, "b");
        // a: 1/61 + 1/62; b: 1/62 + 1/61 — equal, tie broken by doc id.
        assert!((fused[0].score - fused[1].score).abs() < 1e-12);
        assert_eq!(fused[2].doc_id, "c");
    }

    #[test]
    fn identical_inputs_produce_identical_outputs() {
        let input = vec![hits(&["x", "y"]), hits(&["y", "z"])];
        let first = rrf_fusion(&input);
        let second = rrf_fusion(&input);
        assert_eq!(first, second);
    }

    #[test]
    fn numeric_style_ids_fuse_as_strings() {
        let fused = rrf_fusion(&[hits(&["10", "2"]), hits(&["2"])]);
        assert_eq!(fused[0].doc_id, "2");
    }
}
