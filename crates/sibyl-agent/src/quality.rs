//! Post-turn intelligence: quality scoring, topic extraction, follow-up
//! suggestions and title synthesis. Everything here is advisory and runs
//! off the hot path; failures are logged and dropped.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use sibyl_conversations::{ConversationStore, SenderKind};
use sibyl_knowledge::RetrievedChunk;
use sibyl_orchestrator::{QualityScore, QualityStore};

use crate::provider::{ChatRequest, LlmProvider, Message};

/// A conversation earns a synthesized title after this many exchanges.
const TITLE_MIN_EXCHANGES: usize = 4;
const JOB_TIMEOUT: Duration = Duration::from_secs(30);

const JUDGE_PROMPT: &str = "\
You judge one reply from a creator's AI agent. Score it against the user's \
message and the retrieved context. Reply with ONLY JSON:
{\"relevance\": 0.0-1.0, \"engagement\": 0.0-1.0, \"factual_grounding\": 0.0-1.0,
 \"issues\": [\"...\"], \"suggestions\": [\"...\"],
 \"topics\": [\"3-5 short topics\"], \"follow_ups\": [\"3 follow-up questions\"]}
factual_grounding measures whether claims are supported by the context.";

const TITLE_PROMPT: &str = "\
Give this conversation a short title (max 6 words). Reply with the title \
only, no quotes, no prose.";

/// Full judge output; scores are persisted, topics/follow-ups are returned
/// to the caller for display.
#[derive(Debug, Clone, Deserialize)]
pub struct TurnIntelligence {
    #[serde(flatten)]
    pub score: QualityScore,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub follow_ups: Vec<String>,
}

pub struct IntelligenceLogger {
    provider: Arc<dyn LlmProvider>,
    quality: Arc<QualityStore>,
    conversations: Arc<ConversationStore>,
    judge_model: String,
}

impl IntelligenceLogger {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        quality: Arc<QualityStore>,
        conversations: Arc<ConversationStore>,
        judge_model: String,
    ) -> Self {
        Self {
            provider,
            quality,
            conversations,
            judge_model,
        }
    }

    /// Spawn scoring + title synthesis for a completed turn. Returns
    /// immediately; all failures are swallowed with a warning.
    pub fn spawn(
        self: &Arc<Self>,
        conversation_id: String,
        response_message_id: String,
        user_message: String,
        response: String,
        rag: Vec<RetrievedChunk>,
    ) {
        let logger = self.clone();
        tokio::spawn(async move {
            let job = async {
                if let Err(e) = logger
                    .score_turn(&response_message_id, &user_message, &response, &rag)
                    .await
                {
                    warn!(error = %e, "quality scoring failed");
                }
                if let Err(e) = logger.maybe_title(&conversation_id).await {
                    warn!(error = %e, "title synthesis failed");
                }
            };
            if tokio::time::timeout(JOB_TIMEOUT, job).await.is_err() {
                warn!("intelligence job timed out");
            }
        });
    }

    /// Judge one turn and persist the score. Returns the full intelligence
    /// payload (topics, follow-ups) for callers that surface it.
    pub async fn score_turn(
        &self,
        response_message_id: &str,
        user_message: &str,
        response: &str,
        rag: &[RetrievedChunk],
    ) -> Result<TurnIntelligence, sibyl_core::SibylError> {
        let context = if rag.is_empty() {
            "(no retrieved context)".to_string()
        } else {
            rag.iter()
                .map(|c| c.content.as_str())
                .collect::<Vec<_>>()
                .join("\n---\n")
        };
        let input = format!(
            "USER MESSAGE:\n{user_message}\n\nAGENT REPLY:\n{response}\n\nRETRIEVED CONTEXT:\n{context}"
        );

        let reply = self
            .provider
            .send(&ChatRequest {
                model: self.judge_model.clone(),
                system: JUDGE_PROMPT.to_string(),
                messages: vec![Message::user(input)],
                max_tokens: 512,
                stream: false,
            })
            .await
            .map_err(sibyl_core::SibylError::from)?;

        let intelligence: TurnIntelligence = parse_json_block(&reply.content)
            .map_err(sibyl_core::SibylError::Validation)?;
        self.quality
            .record(response_message_id, &intelligence.score)
            .map_err(|e| sibyl_core::SibylError::Database(e.to_string()))?;
        debug!(
            relevance = intelligence.score.relevance,
            grounding = intelligence.score.factual_grounding,
            "turn scored"
        );
        Ok(intelligence)
    }

    /// Synthesize a title once the conversation is long enough and untitled.
    pub async fn maybe_title(&self, conversation_id: &str) -> Result<bool, sibyl_core::SibylError> {
        let conversation = self
            .conversations
            .get(conversation_id)
            .map_err(sibyl_core::SibylError::from)?;
        if conversation.title.is_some() {
            return Ok(false);
        }
        let messages = self
            .conversations
            .messages(conversation_id, 40)
            .map_err(sibyl_core::SibylError::from)?;
        let exchanges = messages
            .iter()
            .filter(|m| m.sender_kind == SenderKind::User)
            .count();
        if exchanges < TITLE_MIN_EXCHANGES {
            return Ok(false);
        }

        let transcript = messages
            .iter()
            .filter(|m| m.sender_kind != SenderKind::System)
            .map(|m| format!("[{}] {}", m.sender_kind, m.content))
            .collect::<Vec<_>>()
            .join("\n");
        let reply = self
            .provider
            .send(&ChatRequest {
                model: self.judge_model.clone(),
                system: TITLE_PROMPT.to_string(),
                messages: vec![Message::user(transcript)],
                max_tokens: 32,
                stream: false,
            })
            .await
            .map_err(sibyl_core::SibylError::from)?;

        let title = reply.content.trim().trim_matches('"').to_string();
        if title.is_empty() {
            return Ok(false);
        }
        self.conversations
            .set_title(conversation_id, &title)
            .map_err(sibyl_core::SibylError::from)?;
        Ok(true)
    }
}

/// Judges love markdown fences; strip them before parsing.
fn parse_json_block<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T, String> {
    let trimmed = raw.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|s| s.strip_suffix("```"))
        .unwrap_or(trimmed);
    serde_json::from_str(body.trim()).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use rusqlite::Connection;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    use sibyl_conversations::ChatType;

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
                stop_reason: String::new(),
            })
        }
        async fn send_stream(
            &self,
            _req: &ChatRequest,
            _tx: mpsc::Sender<StreamEvent>,
        ) -> Result<(), ProviderError> {
            unreachable!()
        }
    }

    fn fixture(judge: CannedJudge) -> (IntelligenceLogger, Arc<QualityStore>, Arc<ConversationStore>, String) {
        let chat_conn = Arc::new(Mutex::new(Connection::open_in_memory().unwrap()));
        let conversations = Arc::new(ConversationStore::new(chat_conn.clone()).unwrap());
        let quality = Arc::new(QualityStore::new(chat_conn).unwrap());
        let conversation = conversations
            .ensure_conversation("u", "c", ChatType::Agent, Some("agent-1"))
            .unwrap();
        let id = conversation.id.clone();
        (
            IntelligenceLogger::new(Arc::new(judge), quality.clone(), conversations.clone(), "judge".into()),
            quality,
            conversations,
            id,
        )
    }

    #[tokio::test]
    async fn scores_persist_and_topics_return() {
        let (logger, quality, _, _) = fixture(CannedJudge(
            r#"{"relevance":0.9,"engagement":0.6,"factual_grounding":0.8,
                "issues":[],"suggestions":["mention hours"],
                "topics":["paris","hours"],"follow_ups":["q1","q2","q3"]}"#,
        ));
        let intelligence = logger
            .score_turn("msg-1", "when do you open?", "Nine sharp.", &[])
            .await
            .unwrap();
        assert_eq!(intelligence.topics, vec!["paris", "hours"]);
        assert_eq!(intelligence.follow_ups.len(), 3);
        let stored = quality.get("msg-1").unwrap().unwrap();
        assert!((stored.relevance - 0.9).abs() < 1e-6);
    }

    #[tokio::test]
    async fn title_waits_for_enough_exchanges() {
        let (logger, _, conversations, conversation_id) = fixture(CannedJudge("Paris Opening Hours"));
        for i in 0..3 {
            conversations
                .send_message(&conversation_id, "u", SenderKind::User, None, &format!("q{i}"))
                .unwrap();
        }
        assert!(!logger.maybe_title(&conversation_id).await.unwrap());

        conversations
            .send_message(&conversation_id, "u", SenderKind::User, None, "q4")
            .unwrap();
        assert!(logger.maybe_title(&conversation_id).await.unwrap());
        assert_eq!(
            conversations.get(&conversation_id).unwrap().title.as_deref(),
            Some("Paris Opening Hours")
        );

        // Already titled → no-op.
        assert!(!logger.maybe_title(&conversation_id).await.unwrap());
    }
}
