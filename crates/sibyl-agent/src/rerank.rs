//! LLM-backed cross-encoder for retrieval reranking. Scores every
//! `(query, chunk)` pair in one judge call; any failure bubbles up so the
//! retriever can fall back to raw vector order.

use std::sync::Arc;

use async_trait::async_trait;

use sibyl_knowledge::{KnowledgeError, Reranker};

use crate::provider::{ChatRequest, LlmProvider, Message};

const RERANK_PROMPT: &str = "\
Score how well each numbered passage answers the query. Reply with ONLY a \
JSON array of numbers in [0,1], one per passage, in the same order.";

pub struct CrossEncoderReranker {
    provider: Arc<dyn LlmProvider>,
    judge_model: String,
}

impl CrossEncoderReranker {
    pub fn new(provider: Arc<dyn LlmProvider>, judge_model: String) -> Self {
        Self {
            provider,
            judge_model,
        }
    }
}

#[async_trait]
impl Reranker for CrossEncoderReranker {
    async fn score(
        &self,
        query: &str,
        candidates: &[String],
    ) -> Result<Vec<f32>, KnowledgeError> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        let mut input = format!("QUERY: {query}\n\nPASSAGES:\n");
        for (i, candidate) in candidates.iter().enumerate() {
            input.push_str(&format!("{}. {}\n", i + 1, candidate));
        }

        let reply = self
            .provider
            .send(&ChatRequest {
                model: self.judge_model.clone(),
                system: RERANK_PROMPT.to_string(),
                messages: vec![Message::user(input)],
                max_tokens: 256,
                stream: false,
            })
            .await
            .map_err(|e| KnowledgeError::RetrievalUnavailable(e.to_string()))?;

        let trimmed = reply.content.trim();
        let body = trimmed
            .strip_prefix("```json")
            .or_else(|| trimmed.strip_prefix("```"))
            .and_then(|s| s.strip_suffix("```"))
            .unwrap_or(trimmed);
        let scores: Vec<f32> = serde_json::from_str(body.trim())
            .map_err(|e| KnowledgeError::RetrievalUnavailable(format!("bad rerank output: {e}")))?;
        if scores.len() != candidates.len() {
            return Err(KnowledgeError::RetrievalUnavailable(format!(
                "reranker returned {} scores for {} passages",
                scores.len(),
                candidates.len()
            )));
        }
        Ok(scores.into_iter().map(|s| s.clamp(0.0, 1.0)).collect())
    }
}
