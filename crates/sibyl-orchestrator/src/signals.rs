use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use sibyl_core::types::{word_tokens, Layer};
use sibyl_vector::{Embedder, SearchFilter, VectorKind, VectorStore};

use crate::error::Result;

/// Chunks at or above this cosine similarity count as retrieval support.
const SUPPORT_FLOOR: f32 = 0.5;
/// Top-k window for the retrieval-support signal.
const SUPPORT_K: usize = 5;

/// The four routing signals for one inbound message. Pure data — the policy
/// engine consumes this without further I/O.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Signals {
    /// Max cosine similarity against canonical answers and chunks, in [0,1].
    pub similarity: f32,
    /// 1 − similarity.
    pub novelty: f32,
    /// Heuristic message complexity in [0,1].
    pub complexity: f32,
    /// Blended answerability estimate in [0,1].
    pub confidence: f32,
}

/// Best canonical match found while computing similarity, if any.
#[derive(Debug, Clone, Serialize)]
pub struct CanonicalMatch {
    pub canonical_id: String,
    pub similarity: f32,
}

/// Output of a full signal computation.
#[derive(Debug, Clone, Serialize)]
pub struct ComputedSignals {
    pub signals: Signals,
    pub canonical_match: Option<CanonicalMatch>,
}

/// Message complexity: token count, question marks, long-token proportion.
///
/// `clip(0.3·norm(tokens) + 0.3·norm(qmarks) + 0.4·norm(long_tokens))`
/// where tokens normalize against 100, qmarks against 3, and long tokens
/// (>8 chars) against 40% of the message.
pub fn complexity(message: &str) -> f32 {
    let tokens = word_tokens(message);
    if tokens.is_empty() {
        return 0.0;
    }
    let token_count = tokens.len() as f32;
    let qmarks = message.matches('?').count() as f32;
    let long_tokens = tokens.iter().filter(|t| t.chars().count() > 8).count() as f32;

    let norm_tokens = (token_count / 100.0).min(1.0);
    let norm_qmarks = (qmarks / 3.0).min(1.0);
    let norm_long = (long_tokens / token_count / 0.4).min(1.0);

    (0.3 * norm_tokens + 0.3 * norm_qmarks + 0.4 * norm_long).clamp(0.0, 1.0)
}

/// Blend similarity, simplicity and retrieval support into answerability.
pub fn confidence(similarity: f32, complexity: f32, retrieval_support: f32) -> f32 {
    (0.5 * similarity + 0.3 * (1.0 - complexity) + 0.2 * retrieval_support).clamp(0.0, 1.0)
}

/// Computes the routing signals for a message against an agent's knowledge.
pub struct SignalComputer {
    embedder: Arc<dyn Embedder>,
    vectors: Arc<VectorStore>,
}

impl SignalComputer {
    pub fn new(embedder: Arc<dyn Embedder>, vectors: Arc<VectorStore>) -> Self {
        Self { embedder, vectors }
    }

    /// Embed the message once, then derive every signal from that vector and
    /// the caller-visible slices of the agent's index.
    pub async fn compute(
        &self,
        agent_id: &str,
        message: &str,
        allowed_layers: &[Layer],
    ) -> Result<ComputedSignals> {
        let query = self.embedder.embed_one(message).await?;

        let canonical_hits = self.vectors.search(
            agent_id,
            &query,
            1,
            &SearchFilter {
                kind: Some(VectorKind::Canonical),
                layers: Some(allowed_layers.to_vec()),
            },
        )?;
        let canonical_match = canonical_hits.first().map(|h| CanonicalMatch {
            canonical_id: h.id.clone(),
            similarity: h.similarity(),
        });

        let chunk_hits = self.vectors.search(
            agent_id,
            &query,
            SUPPORT_K,
            &SearchFilter {
                kind: Some(VectorKind::Chunk),
                layers: Some(allowed_layers.to_vec()),
            },
        )?;

        let best_canonical = canonical_match.as_ref().map(|m| m.similarity).unwrap_or(0.0);
        let best_chunk = chunk_hits.first().map(|h| h.similarity()).unwrap_or(0.0);
        let similarity = best_canonical.max(best_chunk);

        let support_hits = chunk_hits
            .iter()
            .filter(|h| h.similarity() >= SUPPORT_FLOOR)
            .count();
        let retrieval_support = support_hits as f32 / SUPPORT_K as f32;

        let complexity = complexity(message);
        let signals = Signals {
            similarity,
            novelty: (1.0 - similarity).clamp(0.0, 1.0),
            complexity,
            confidence: confidence(similarity, complexity, retrieval_support),
        };
        debug!(
            agent_id,
            similarity = signals.similarity,
            novelty = signals.novelty,
            complexity = signals.complexity,
            confidence = signals.confidence,
            "signals computed"
        );
        Ok(ComputedSignals {
            signals,
            canonical_match,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_message_has_zero_complexity() {
        assert_eq!(complexity(""), 0.0);
        assert_eq!(complexity("   "), 0.0);
    }

    #[test]
    fn short_plain_message_is_simple() {
        assert!(complexity("help") < 0.4);
        assert!(complexity("hi there") < 0.4);
    }

    #[test]
    fn long_multi_question_message_is_complex() {
        let msg = "Could you elaborate comprehensively on the architectural \
                   tradeoffs? Specifically regarding consistency guarantees? \
                   And how does replication interact with partitioning?";
        assert!(complexity(msg) >= 0.6, "got {}", complexity(msg));
    }

    #[test]
    fn complexity_clamped_to_unit_interval() {
        let monster = format!("{} ??????", "incomprehensibilities ".repeat(300));
        let c = complexity(&monster);
        assert!((0.0..=1.0).contains(&c));
    }

    #[test]
    fn confidence_blend() {
        // High similarity, simple message, full support.
        assert!(confidence(0.9, 0.2, 1.0) > 0.85);
        // Nothing known about the topic.
        assert!(confidence(0.0, 0.9, 0.0) < 0.1);
        // Well-grounded, moderately simple message clears the 0.75 gate.
        let c = confidence(0.78, 0.3, 1.0);
        assert!((c - 0.80).abs() < 0.01, "got {c}");
    }

    #[tokio::test]
    async fn compute_sees_only_allowed_layers() {
        use rusqlite::Connection;
        use sibyl_vector::LocalHashEmbedder;

        let embedder: Arc<dyn Embedder> = Arc::new(LocalHashEmbedder::new(128));
        let vectors =
            Arc::new(VectorStore::new(Connection::open_in_memory().unwrap(), 128).unwrap());
        let v = embedder.embed_one("secret refund policy").await.unwrap();
        vectors
            .upsert(
                "agent-1",
                "c1",
                VectorKind::Chunk,
                Some(Layer::Intimate),
                &v,
                &serde_json::json!({}),
            )
            .unwrap();

        let computer = SignalComputer::new(embedder, vectors);
        let public_view = computer
            .compute("agent-1", "secret refund policy", &[Layer::Public])
            .await
            .unwrap();
        assert_eq!(public_view.signals.similarity, 0.0);
        assert!(public_view.canonical_match.is_none());

        let owner_view = computer
            .compute("agent-1", "secret refund policy", &Layer::ALL)
            .await
            .unwrap();
        assert!(owner_view.signals.similarity > 0.9);
    }
}
