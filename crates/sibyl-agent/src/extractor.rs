//! Post-turn memory extraction. Fire-and-forget: runs after the turn is
//! persisted, asks the judge model for typed candidates, and hands them to
//! the memory store (which enforces the confidence floor, dedup and
//! idempotence). Failure is logged, never surfaced.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use sibyl_conversations::{ConversationStore, SenderKind};
use sibyl_memory::{types::parse_extraction, MemoryStore};

use crate::provider::{ChatRequest, LlmProvider, Message};

/// Messages of context handed to the extraction prompt.
const CONTEXT_MESSAGES: usize = 10;
/// Per-job timeout; extraction competes with nobody.
const JOB_TIMEOUT: Duration = Duration::from_secs(30);

const EXTRACTION_PROMPT: &str = "\
You distill long-term memories from a conversation between a user and a \
creator's AI agent. From the transcript, extract durable facts worth \
remembering about the user or their relationship to the creator.

Reply with ONLY a JSON array, no prose. Each item:
{\"kind\": \"fact\"|\"preference\"|\"relationship\"|\"event\", \
\"content\": \"...\", \"confidence\": 0.0-1.0}

Only include things stated or strongly implied. An empty array is a fine \
answer.";

pub struct MemoryExtractor {
    provider: Arc<dyn LlmProvider>,
    memories: Arc<MemoryStore>,
    conversations: Arc<ConversationStore>,
    judge_model: String,
}

impl MemoryExtractor {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        memories: Arc<MemoryStore>,
        conversations: Arc<ConversationStore>,
        judge_model: String,
    ) -> Self {
        Self {
            provider,
            memories,
            conversations,
            judge_model,
        }
    }

    /// Spawn extraction for a completed turn. Returns immediately.
    pub fn spawn(self: &Arc<Self>, agent_id: String, conversation_id: String, source_message_id: String) {
        let extractor = self.clone();
        tokio::spawn(async move {
            let job = extractor.extract(&agent_id, &conversation_id, &source_message_id);
            match tokio::time::timeout(JOB_TIMEOUT, job).await {
                Ok(Ok(n)) => debug!(agent_id, inserted = n, "memory extraction done"),
                Ok(Err(e)) => warn!(agent_id, error = %e, "memory extraction failed"),
                Err(_) => warn!(agent_id, "memory extraction timed out"),
            }
        });
    }

    /// Run extraction synchronously. Returns inserted memory count.
    pub async fn extract(
        &self,
        agent_id: &str,
        conversation_id: &str,
        source_message_id: &str,
    ) -> Result<usize, sibyl_core::SibylError> {
        let history = self
            .conversations
            .messages(conversation_id, CONTEXT_MESSAGES)
            .map_err(sibyl_core::SibylError::from)?;

        let transcript = history
            .iter()
            .filter(|m| m.sender_kind != SenderKind::System)
            .map(|m| format!("[{}] {}", m.sender_kind, m.content))
            .collect::<Vec<_>>()
            .join("\n");
        if transcript.is_empty() {
            return Ok(0);
        }

        let response = self
            .provider
            .send(&ChatRequest {
                model: self.judge_model.clone(),
                system: EXTRACTION_PROMPT.to_string(),
                messages: vec![Message::user(transcript)],
                max_tokens: 512,
                stream: false,
            })
            .await
            .map_err(sibyl_core::SibylError::from)?;

        let candidates = parse_extraction(&response.content)
            .map_err(|e| sibyl_core::SibylError::Validation(e.to_string()))?;
        let inserted = self
            .memories
            .record_extraction(agent_id, source_message_id, candidates)
            .await
            .map_err(|e| sibyl_core::SibylError::Database(e.to_string()))?;
        Ok(inserted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use rusqlite::Connection;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    use sibyl_conversations::ChatType;
    use sibyl_vector::{Embedder, LocalHashEmbedder, VectorStore};

    use crate::provider::{ChatResponse, ProviderError};
    use crate::stream::StreamEvent;

    struct CannedJudge(&'static str);

    #[async_trait]
    impl LlmProvider for CannedJudge {
        fn name(&self) -> &str {
            "canned"
        }
        async fn send(&self, _req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
            Ok(ChatResponse {
                content: self.0.to_string(),
                model: "canned".into(),
                tokens_in: 0,
                tokens_out: 0,
                stop_reason: "end_turn".into(),
            })
        }
        async fn send_stream(
            &self,
            _req: &ChatRequest,
            _tx: mpsc::Sender<StreamEvent>,
        ) -> Result<(), ProviderError> {
            unreachable!("extractor never streams")
        }
    }

    fn fixture(judge: CannedJudge) -> (MemoryExtractor, Arc<MemoryStore>, String) {
        let embedder: Arc<dyn Embedder> = Arc::new(LocalHashEmbedder::new(64));
        let vectors =
            Arc::new(VectorStore::new(Connection::open_in_memory().unwrap(), 64).unwrap());
        let memories = Arc::new(
            MemoryStore::new(Connection::open_in_memory().unwrap(), embedder, vectors).unwrap(),
        );
        let conversations = Arc::new(
            ConversationStore::new(Arc::new(Mutex::new(Connection::open_in_memory().unwrap())))
                .unwrap(),
        );
        let conversation = conversations
            .ensure_conversation("u", "c", ChatType::Agent, Some("agent-1"))
            .unwrap();
        conversations
            .send_message(&conversation.id, "u", SenderKind::User, None, "I moved to Lisbon last spring")
            .unwrap();
        (
            MemoryExtractor::new(Arc::new(judge), memories.clone(), conversations, "judge".into()),
            memories,
            conversation.id,
        )
    }

    #[tokio::test]
    async fn extracts_and_stores() {
        let (extractor, memories, conversation_id) = fixture(CannedJudge(
            r#"[{"kind":"fact","content":"User moved to Lisbon in spring","confidence":0.9}]"#,
        ));
        let n = extractor
            .extract("agent-1", &conversation_id, "msg-1")
            .await
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(memories.list("agent-1", 10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn malformed_judge_output_is_an_error_not_a_panic() {
        let (extractor, memories, conversation_id) =
            fixture(CannedJudge("I think the user lives in Lisbon?"));
        assert!(extractor
            .extract("agent-1", &conversation_id, "msg-1")
            .await
            .is_err());
        assert!(memories.list("agent-1", 10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn second_run_is_idempotent() {
        let (extractor, memories, conversation_id) = fixture(CannedJudge(
            r#"[{"kind":"fact","content":"User moved to Lisbon in spring","confidence":0.9}]"#,
        ));
        extractor.extract("agent-1", &conversation_id, "msg-1").await.unwrap();
        let n = extractor
            .extract("agent-1", &conversation_id, "msg-1")
            .await
            .unwrap();
        assert_eq!(n, 0);
        assert_eq!(memories.list("agent-1", 10).unwrap().len(), 1);
    }
}
