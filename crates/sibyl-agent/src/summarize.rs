//! Rolling conversation summaries. Triggered after a turn when the
//! conversation has grown long and the latest summary (if any) is stale;
//! runs fire-and-forget like the other post-turn jobs.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use sibyl_conversations::{ConversationStore, SenderKind};

use crate::provider::{ChatRequest, LlmProvider, Message};

/// Conversations shorter than this are never summarized.
pub const SUMMARY_MIN_MESSAGES: usize = 50;
/// A summary is recent while it covers messages this close to the tail.
const SUMMARY_STALE_GAP: usize = 20;
const JOB_TIMEOUT: Duration = Duration::from_secs(45);

const SUMMARY_PROMPT: &str = "\
Summarize this conversation between a user and a creator's AI agent in at \
most 200 words. Keep decisions, facts about the user, open threads and \
anything either side promised. Write plain prose, no headers.";

pub struct Summarizer {
    provider: Arc<dyn LlmProvider>,
    conversations: Arc<ConversationStore>,
    model: String,
}

impl Summarizer {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        conversations: Arc<ConversationStore>,
        model: String,
    ) -> Self {
        Self {
            provider,
            conversations,
            model,
        }
    }

    /// Spawn a summary job if the conversation needs one. Returns
    /// immediately.
    pub fn spawn_if_due(self: &Arc<Self>, conversation_id: String) {
        let summarizer = self.clone();
        tokio::spawn(async move {
            match tokio::time::timeout(JOB_TIMEOUT, summarizer.run_if_due(&conversation_id)).await {
                Ok(Ok(true)) => debug!(conversation_id, "summary stored"),
                Ok(Ok(false)) => {}
                Ok(Err(e)) => warn!(conversation_id, error = %e, "summarization failed"),
                Err(_) => warn!(conversation_id, "summarization timed out"),
            }
        });
    }

    /// Whether a conversation of `count` messages with a summary covering
    /// `covered` needs a fresh one.
    pub fn is_due(count: usize, covered: Option<usize>) -> bool {
        if count < SUMMARY_MIN_MESSAGES {
            return false;
        }
        match covered {
            None => true,
            Some(covered) => count.saturating_sub(covered) > SUMMARY_STALE_GAP,
        }
    }

    pub async fn run_if_due(&self, conversation_id: &str) -> Result<bool, sibyl_core::SibylError> {
        let count = self
            .conversations
            .message_count(conversation_id)
            .map_err(sibyl_core::SibylError::from)?;
        let covered = self
            .conversations
            .latest_summary(conversation_id)
            .map_err(sibyl_core::SibylError::from)?
            .map(|s| s.through_count);
        if !Self::is_due(count, covered) {
            return Ok(false);
        }

        let messages = self
            .conversations
            .messages(conversation_id, SUMMARY_MIN_MESSAGES * 4)
            .map_err(sibyl_core::SibylError::from)?;
        let transcript = messages
            .iter()
            .filter(|m| m.sender_kind != SenderKind::System)
            .map(|m| format!("[{}] {}", m.sender_kind, m.content))
            .collect::<Vec<_>>()
            .join("\n");

        let reply = self
            .provider
            .send(&ChatRequest {
                model: self.model.clone(),
                system: SUMMARY_PROMPT.to_string(),
                messages: vec![Message::user(transcript)],
                max_tokens: 512,
                stream: false,
            })
            .await
            .map_err(sibyl_core::SibylError::from)?;

        let summary = reply.content.trim();
        if summary.is_empty() {
            return Ok(false);
        }
        self.conversations
            .insert_summary(conversation_id, summary, count)
            .map_err(sibyl_core::SibylError::from)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn due_only_past_threshold() {
        assert!(!Summarizer::is_due(10, None));
        assert!(!Summarizer::is_due(SUMMARY_MIN_MESSAGES - 1, None));
        assert!(Summarizer::is_due(SUMMARY_MIN_MESSAGES, None));
    }

    #[test]
    fn recent_summary_suppresses() {
        assert!(!Summarizer::is_due(60, Some(50)));
        assert!(Summarizer::is_due(80, Some(50)));
    }
}
