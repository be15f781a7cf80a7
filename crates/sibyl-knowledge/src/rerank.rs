use async_trait::async_trait;
use std::collections::BTreeSet;

use crate::error::Result;

/// Cross-encoder seam: score `(query, candidate)` pairs.
///
/// Scores are relative ranking weights, higher is better; they need not be
/// calibrated probabilities. Implementations must be deterministic for a
/// fixed input order. The LLM-backed cross-encoder lives with the provider
/// stack; this crate ships the lexical fallback used when the cross-encoder
/// is unavailable (and by tests).
#[async_trait]
pub trait Reranker: Send + Sync {
    async fn score(&self, query: &str, candidates: &[String]) -> Result<Vec<f32>>;
}

/// Term-overlap reranker: normalized intersection of lowercase word sets.
pub struct LexicalReranker;

#[async_trait]
impl Reranker for LexicalReranker {
    async fn score(&self, query: &str, candidates: &[String]) -> Result<Vec<f32>> {
        let q = terms(query);
        Ok(candidates
            .iter()
            .map(|c| {
                let t = terms(c);
                if q.is_empty() || t.is_empty() {
                    return 0.0;
                }
                let overlap = q.intersection(&t).count() as f32;
                overlap / ((q.len() as f32).sqrt() * (t.len() as f32).sqrt())
            })
            .collect())
    }
}

fn terms(text: &str) -> BTreeSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 2)
        .map(|w| w.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn overlapping_text_outranks_disjoint() {
        let r = LexicalReranker;
        let scores = r
            .score(
                "when do you open in paris",
                &[
                    "our paris store opens at nine".to_string(),
                    "shipping rates for norway".to_string(),
                ],
            )
            .await
            .unwrap();
        assert!(scores[0] > scores[1]);
    }

    #[tokio::test]
    async fn empty_query_scores_zero() {
        let r = LexicalReranker;
        let scores = r.score("", &["anything".to_string()]).await.unwrap();
        assert_eq!(scores, vec![0.0]);
    }

    #[tokio::test]
    async fn deterministic_for_fixed_input() {
        let r = LexicalReranker;
        let cands = vec!["alpha beta gamma".to_string(), "beta gamma delta".to_string()];
        let a = r.score("beta gamma", &cands).await.unwrap();
        let b = r.score("beta gamma", &cands).await.unwrap();
        assert_eq!(a, b);
    }
}
