use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

pub use sibyl_core::types::allowed_layers;
use sibyl_core::types::Layer;
use sibyl_vector::{Embedder, SearchFilter, VectorKind, VectorStore};

use crate::error::{KnowledgeError, Result};
use crate::rerank::Reranker;
use crate::store::KnowledgeStore;

/// Candidate pool width before reranking.
pub const K_CANDIDATE: usize = 20;
/// Default result count after reranking.
pub const K_FINAL: usize = 5;

/// A retrieval hit ready for prompt assembly.
#[derive(Debug, Clone, Serialize)]
pub struct RetrievedChunk {
    pub chunk_id: String,
    pub document_id: String,
    pub content: String,
    pub layer: Layer,
    /// Rerank score when the cross-encoder ran, otherwise vector similarity.
    pub score: f32,
}

/// Hybrid retrieval: vector candidates, cross-encoder rerank, layer gate.
///
/// Pure with respect to the index snapshot — no writes, deterministic for
/// fixed index and reranker weights.
pub struct Retriever {
    embedder: Arc<dyn Embedder>,
    vectors: Arc<VectorStore>,
    store: Arc<KnowledgeStore>,
    reranker: Arc<dyn Reranker>,
}

impl Retriever {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        vectors: Arc<VectorStore>,
        store: Arc<KnowledgeStore>,
        reranker: Arc<dyn Reranker>,
    ) -> Self {
        Self {
            embedder,
            vectors,
            store,
            reranker,
        }
    }

    /// Retrieve the `k_final` most relevant chunks for a query, restricted
    /// to the allowed layers. Rerank failure degrades to raw vector order.
    pub async fn retrieve(
        &self,
        agent_id: &str,
        query: &str,
        allowed: &[Layer],
        k_final: usize,
    ) -> Result<Vec<RetrievedChunk>> {
        let query_vec = self
            .embedder
            .embed_one(query)
            .await
            .map_err(|e| KnowledgeError::RetrievalUnavailable(e.to_string()))?;

        let hits = self.vectors.search(
            agent_id,
            &query_vec,
            K_CANDIDATE,
            &SearchFilter {
                kind: Some(VectorKind::Chunk),
                layers: Some(allowed.to_vec()),
            },
        )?;
        if hits.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<String> = hits.iter().map(|h| h.id.clone()).collect();
        let chunks = self.store.chunks_by_ids(&ids)?;
        let contents: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();

        // Pair every chunk with a score: cross-encoder when it works, the
        // vector similarity otherwise. The fallback looks scores up by id —
        // a chunk row can be missing for a stale vector, so positions in
        // `hits` and `chunks` need not align.
        let vector_scores = |chunks: &[crate::store::DocumentChunk]| -> Vec<f32> {
            chunks
                .iter()
                .map(|c| {
                    hits.iter()
                        .find(|h| h.id == c.id)
                        .map(|h| h.similarity())
                        .unwrap_or(0.0)
                })
                .collect()
        };
        let scores: Vec<f32> = match self.reranker.score(query, &contents).await {
            Ok(s) if s.len() == contents.len() => s,
            Ok(s) => {
                warn!(got = s.len(), want = contents.len(), "reranker returned wrong arity, using vector order");
                vector_scores(&chunks)
            }
            Err(e) => {
                warn!(error = %e, "reranker failed, using vector order");
                vector_scores(&chunks)
            }
        };

        let mut ranked: Vec<RetrievedChunk> = chunks
            .into_iter()
            .zip(scores)
            .map(|(c, score)| RetrievedChunk {
                chunk_id: c.id,
                document_id: c.document_id,
                content: c.content,
                layer: c.layer,
                score,
            })
            .collect();
        ranked.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        ranked.truncate(k_final);
        debug!(agent_id, returned = ranked.len(), "retrieval complete");
        Ok(ranked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rerank::LexicalReranker;
    use async_trait::async_trait;
    use rusqlite::Connection;
    use sibyl_core::types::UserTier;
    use sibyl_vector::LocalHashEmbedder;

    struct FailingReranker;

    #[async_trait]
    impl Reranker for FailingReranker {
        async fn score(&self, _q: &str, _c: &[String]) -> Result<Vec<f32>> {
            Err(KnowledgeError::RetrievalUnavailable("rerank down".into()))
        }
    }

    async fn fixture(reranker: Arc<dyn Reranker>) -> (Retriever, Arc<KnowledgeStore>) {
        let embedder: Arc<dyn Embedder> = Arc::new(LocalHashEmbedder::new(128));
        let vectors =
            Arc::new(VectorStore::new(Connection::open_in_memory().unwrap(), 128).unwrap());
        let store = Arc::new(
            KnowledgeStore::new(
                Connection::open_in_memory().unwrap(),
                embedder.clone(),
                vectors.clone(),
            )
            .unwrap(),
        );
        store
            .ingest("agent-1", Layer::Public, "The Paris store opens at nine every morning.", "docs")
            .await
            .unwrap();
        store
            .ingest("agent-1", Layer::Friends, "Friends hear about the secret menu first.", "docs")
            .await
            .unwrap();
        store
            .ingest("agent-1", Layer::Intimate, "Private journal entry about the paris launch.", "journal")
            .await
            .unwrap();
        (
            Retriever::new(embedder, vectors, store.clone(), reranker),
            store,
        )
    }

    #[tokio::test]
    async fn layer_gate_holds() {
        let (r, _) = fixture(Arc::new(LexicalReranker)).await;
        let hits = r
            .retrieve("agent-1", "paris opening", &[Layer::Public], K_FINAL)
            .await
            .unwrap();
        assert!(!hits.is_empty());
        assert!(hits.iter().all(|h| h.layer == Layer::Public));
    }

    #[tokio::test]
    async fn owner_layers_see_intimate() {
        let (r, _) = fixture(Arc::new(LexicalReranker)).await;
        let all = allowed_layers(true, UserTier::Free);
        let hits = r.retrieve("agent-1", "paris launch journal", &all, K_FINAL).await.unwrap();
        assert!(hits.iter().any(|h| h.layer == Layer::Intimate));
    }

    #[tokio::test]
    async fn rerank_failure_degrades_to_vector_order() {
        let (r, _) = fixture(Arc::new(FailingReranker)).await;
        let hits = r
            .retrieve("agent-1", "paris opening hours", &[Layer::Public], K_FINAL)
            .await
            .unwrap();
        assert!(!hits.is_empty(), "degraded retrieval should still return hits");
    }

    #[tokio::test]
    async fn k_final_caps_results() {
        let (r, _) = fixture(Arc::new(LexicalReranker)).await;
        let hits = r
            .retrieve("agent-1", "paris", &allowed_layers(true, UserTier::Free), 1)
            .await
            .unwrap();
        assert!(hits.len() <= 1);
    }

    #[test]
    fn allowed_layers_by_tier() {
        assert_eq!(allowed_layers(false, UserTier::Free), vec![Layer::Public]);
        assert_eq!(
            allowed_layers(false, UserTier::Follower),
            vec![Layer::Public, Layer::Friends]
        );
        assert_eq!(allowed_layers(true, UserTier::Free).len(), 3);
    }
}
