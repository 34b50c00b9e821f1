//! Answer assembly: claims with citations that always trace back to
//! evidence record ids. When citations are required and none can be
//! supplied, the answer degrades to `no_evidence` instead of asserting
//! unsupported claims.

use crate::Hit;
use serde::{Deserialize, Serialize};

/// Answer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnswerState {
    /// Claims with citations.
    Ok,
    /// Some claims lack citations and were dropped.
    Partial,
    /// No evidence matched the query.
    NoEvidence,
    /// The answer was degraded by policy.
    Degraded,
    /// Retrieval failed.
    Error,
}

/// One claim with its evidence citations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claim {
    /// Claim text (a snippet of matched evidence).
    pub text: String,
    /// Evidence record ids supporting the claim.
    pub citations: Vec<String>,
}

/// A user-visible answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Answer {
    /// Answer state.
    pub state: AnswerState,
    /// Claims, possibly empty.
    pub claims: Vec<Claim>,
    /// Notice shown when claims are empty but the query was well-formed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notice: Option<String>,
}

/// Build an answer from ranked hits.
pub fn build_answer(hits: &[Hit], citations_required: bool) -> Answer {
    if hits.is_empty() {
        return Answer {
            state: AnswerState::NoEvidence,
            claims: Vec::new(),
            notice: Some("no matching evidence in the selected window".to_string()),
        };
    }
    let claims: Vec<Claim> = hits
        .iter()
        .map(|hit| Claim {
            text: hit
                .snippet
                .clone()
                .unwrap_or_else(|| hit.doc_id.clone()),
            citations: vec![hit.doc_id.clone()],
        })
        .collect();
    let uncited = claims.iter().any(|claim| claim.citations.is_empty());
    if citations_required && claims.iter().all(|claim| claim.citations.is_empty()) {
        return Answer {
            state: AnswerState::NoEvidence,
            claims: Vec::new(),
            notice: Some("citations required but none available".to_string()),
        };
    }
    Answer {
        state: if uncited { AnswerState::Partial } else { AnswerState::Ok },
        claims,
        notice: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_hits_degrade_to_no_evidence() {
        let answer = build_answer(&[], true);
        assert_eq!(answer.state, AnswerState::NoEvidence);
        assert!(answer.claims.is_empty());
        assert!(answer.notice.is_some());
    }

    #[test]
    fn hits_become_cited_claims() {
        let hits = vec![Hit {
            doc_id: "run/derived.text.ocr/3".into(),
            snippet: Some("the [meeting] notes".into()),
            score: 0.9,
        }];
        let answer = build_answer(&hits, true);
        assert_eq!(answer.state, AnswerState::Ok);
        assert_eq!(answer.claims[0].citations, vec!["run/derived.text.ocr/3"]);
    }
}
