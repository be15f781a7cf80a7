//! Context composer: assembles the bounded prompt for a response turn.
//!
//! Inclusion order is fixed — persona block, conversation summary, relevant
//! memories, retrieval context, filtered history — under one hard token
//! budget. The most recent turns are always present; older history competes
//! on semantic relevance to the current query for whatever budget remains.

use std::sync::Arc;

use tracing::warn;

use sibyl_conversations::{ConversationStore, DirectMessage, SenderKind};
use sibyl_core::types::{approx_tokens, Layer};
use sibyl_knowledge::{RetrievedChunk, Retriever, K_FINAL};
use sibyl_memory::{AgentMemory, MemoryStore};
use sibyl_vector::{math::cosine_similarity, Embedder};

use crate::prompt;
use crate::provider::Message;

/// Memories included per turn.
const MAX_MEMORIES: usize = 5;
/// Most recent messages that are always included (≈ five exchanges).
const RECENT_MESSAGES: usize = 10;
/// How much raw history is considered at all.
const HISTORY_FETCH: usize = 200;

#[derive(Debug, Clone)]
pub struct ComposeInputs {
    pub agent_id: String,
    pub agent_handle: String,
    pub persona: String,
    pub allowed_layers: Vec<Layer>,
    pub conversation_id: String,
    pub query: String,
    /// False on the clarify path — no retrieval tokens are spent there.
    pub with_rag: bool,
}

/// The prompt ready for the provider, plus the retrieval hits for the
/// quality logger.
#[derive(Debug, Clone)]
pub struct ComposedContext {
    pub system: String,
    pub messages: Vec<Message>,
    pub rag: Vec<RetrievedChunk>,
}

/// Gathers sections from the stores and assembles them under the budget.
pub struct ContextComposer {
    embedder: Arc<dyn Embedder>,
    retriever: Arc<Retriever>,
    memories: Arc<MemoryStore>,
    conversations: Arc<ConversationStore>,
    budget_tokens: usize,
}

impl ContextComposer {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        retriever: Arc<Retriever>,
        memories: Arc<MemoryStore>,
        conversations: Arc<ConversationStore>,
        budget_tokens: usize,
    ) -> Self {
        Self {
            embedder,
            retriever,
            memories,
            conversations,
            budget_tokens,
        }
    }

    pub async fn compose(&self, inputs: &ComposeInputs) -> ComposedContext {
        let system_block =
            prompt::persona_block(&inputs.agent_handle, &inputs.persona, &inputs.allowed_layers);

        // Every section degrades independently — a missing substrate never
        // blocks the turn.
        let memories = match self
            .memories
            .relevant(&inputs.agent_id, &inputs.query, MAX_MEMORIES)
            .await
        {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "memory lookup failed, composing without memories");
                Vec::new()
            }
        };

        let rag = if inputs.with_rag {
            match self
                .retriever
                .retrieve(&inputs.agent_id, &inputs.query, &inputs.allowed_layers, K_FINAL)
                .await
            {
                Ok(hits) => hits,
                Err(e) => {
                    warn!(error = %e, "retrieval failed, composing without RAG");
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        let summary = self
            .conversations
            .latest_summary(&inputs.conversation_id)
            .ok()
            .flatten();

        let history = self
            .conversations
            .messages(&inputs.conversation_id, HISTORY_FETCH)
            .unwrap_or_default();

        let relevance = self.history_relevance(&history, &inputs.query).await;

        assemble(
            system_block,
            summary.as_ref().map(|s| s.content.as_str()),
            &memories,
            &rag,
            &history,
            &relevance,
            self.budget_tokens,
        )
    }

    /// Cosine relevance of each history message to the query. Falls back to
    /// recency-only (zero scores) when embedding is unavailable.
    async fn history_relevance(&self, history: &[DirectMessage], query: &str) -> Vec<f32> {
        if history.len() <= RECENT_MESSAGES {
            return vec![0.0; history.len()];
        }
        let texts: Vec<String> = history.iter().map(|m| m.content.clone()).collect();
        let query_vec = match self.embedder.embed_one(query).await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "history relevance embedding failed, using recency only");
                return vec![0.0; history.len()];
            }
        };
        match self.embedder.embed(&texts).await {
            Ok(vectors) => vectors
                .iter()
                .map(|v| cosine_similarity(&query_vec, v))
                .collect(),
            Err(e) => {
                warn!(error = %e, "history relevance embedding failed, using recency only");
                vec![0.0; history.len()]
            }
        }
    }
}

/// Pure assembly under the token budget. `relevance` is parallel to
/// `history` (chronological order).
pub fn assemble(
    persona_system: String,
    summary: Option<&str>,
    memories: &[AgentMemory],
    rag: &[RetrievedChunk],
    history: &[DirectMessage],
    relevance: &[f32],
    budget_tokens: usize,
) -> ComposedContext {
    let mut system = persona_system;

    if let Some(summary) = summary {
        system.push_str("\n\n## Conversation so far\n");
        system.push_str(summary);
    }

    if !memories.is_empty() {
        system.push_str("\n\n## What you remember about this person\n");
        for memory in memories.iter().take(MAX_MEMORIES) {
            system.push_str(&format!("- ({}) {}\n", memory.kind, memory.content));
        }
    }

    if !rag.is_empty() {
        system.push_str("\n\n## Relevant knowledge\n");
        for chunk in rag {
            system.push_str(&format!("---\n{}\n", chunk.content));
        }
    }

    let mut used = approx_tokens(&system);

    // Recent tail is always in, newest last.
    let split = history.len().saturating_sub(RECENT_MESSAGES);
    let (older, recent) = history.split_at(split);
    let mut included: Vec<&DirectMessage> = Vec::new();
    for message in recent {
        if message.sender_kind == SenderKind::System {
            continue;
        }
        used += approx_tokens(&message.content);
        included.push(message);
    }

    // Older turns compete on relevance for the remaining budget.
    let mut candidates: Vec<(usize, f32)> = older
        .iter()
        .enumerate()
        .filter(|(_, m)| m.sender_kind != SenderKind::System)
        .map(|(i, _)| (i, relevance.get(i).copied().unwrap_or(0.0)))
        .collect();
    candidates.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| b.0.cmp(&a.0)));

    let mut picked_older: Vec<usize> = Vec::new();
    for (index, _) in candidates {
        let cost = approx_tokens(&older[index].content);
        if used + cost > budget_tokens {
            continue;
        }
        used += cost;
        picked_older.push(index);
    }
    picked_older.sort_unstable();

    let mut messages: Vec<Message> = Vec::new();
    for index in picked_older {
        messages.push(to_message(&older[index]));
    }
    for message in included {
        messages.push(to_message(message));
    }

    ComposedContext {
        system,
        messages,
        rag: rag.to_vec(),
    }
}

fn to_message(m: &DirectMessage) -> Message {
    match m.sender_kind {
        SenderKind::User => Message::user(m.content.clone()),
        _ => Message::assistant(m.content.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sibyl_memory::MemoryKind;

    fn msg(kind: SenderKind, content: &str) -> DirectMessage {
        DirectMessage {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: "c".into(),
            sender_profile_id: "p".into(),
            sender_kind: kind,
            sender_agent_id: None,
            content: content.into(),
            read_by_p1: true,
            read_by_p2: false,
            truncated: false,
            created_at: String::new(),
        }
    }

    fn memory(content: &str) -> AgentMemory {
        AgentMemory {
            id: "m".into(),
            agent_id: "a".into(),
            kind: MemoryKind::Fact,
            content: content.into(),
            confidence: 0.9,
            source_message_id: "s".into(),
            created_at: String::new(),
        }
    }

    #[test]
    fn sections_appear_in_order() {
        let history = vec![msg(SenderKind::User, "latest question")];
        let ctx = assemble(
            "PERSONA".into(),
            Some("they talked about shipping"),
            &[memory("user lives in Lisbon")],
            &[RetrievedChunk {
                chunk_id: "c".into(),
                document_id: "d".into(),
                content: "we ship worldwide".into(),
                layer: Layer::Public,
                score: 0.9,
            }],
            &history,
            &[0.0],
            6_000,
        );
        let persona = ctx.system.find("PERSONA").unwrap();
        let summary = ctx.system.find("Conversation so far").unwrap();
        let memories = ctx.system.find("What you remember").unwrap();
        let rag = ctx.system.find("Relevant knowledge").unwrap();
        assert!(persona < summary && summary < memories && memories < rag);
        assert_eq!(ctx.messages.len(), 1);
    }

    #[test]
    fn recent_messages_always_included() {
        let history: Vec<DirectMessage> = (0..30)
            .map(|i| msg(SenderKind::User, &format!("message number {i}")))
            .collect();
        let relevance = vec![0.0; history.len()];
        // Budget covers exactly the recent tail — nothing older fits.
        let budget = approx_tokens("sys")
            + history[history.len() - RECENT_MESSAGES..]
                .iter()
                .map(|m| approx_tokens(&m.content))
                .sum::<usize>();
        let ctx = assemble("sys".into(), None, &[], &[], &history, &relevance, budget);
        assert_eq!(ctx.messages.len(), RECENT_MESSAGES);
        assert!(ctx.messages.last().unwrap().content.contains("29"));
    }

    #[test]
    fn relevant_older_messages_win_budget() {
        let mut history: Vec<DirectMessage> = (0..20)
            .map(|i| msg(SenderKind::User, &format!("filler chatter {i}")))
            .collect();
        history.extend((0..RECENT_MESSAGES).map(|i| msg(SenderKind::User, &format!("recent {i}"))));
        let mut relevance = vec![0.1; 30];
        relevance[3] = 0.95; // highly relevant old message

        let sys_cost = approx_tokens("sys");
        let recent_cost: usize = history[20..]
            .iter()
            .map(|m| approx_tokens(&m.content))
            .sum();
        let one_more = approx_tokens("filler chatter 3");
        let budget = sys_cost + recent_cost + one_more;

        let ctx = assemble("sys".into(), None, &[], &[], &history, &relevance, budget);
        assert_eq!(ctx.messages.len(), RECENT_MESSAGES + 1);
        assert_eq!(ctx.messages[0].content, "filler chatter 3");
    }

    #[test]
    fn system_messages_never_reach_the_prompt() {
        let history = vec![
            msg(SenderKind::System, "escalation offer text"),
            msg(SenderKind::User, "real question"),
        ];
        let ctx = assemble("sys".into(), None, &[], &[], &history, &[0.0, 0.0], 6_000);
        assert_eq!(ctx.messages.len(), 1);
        assert_eq!(ctx.messages[0].content, "real question");
    }

    #[test]
    fn memories_capped_at_five() {
        let memories: Vec<AgentMemory> =
            (0..9).map(|i| memory(&format!("fact number {i}"))).collect();
        let ctx = assemble("sys".into(), None, &memories, &[], &[], &[], 6_000);
        assert_eq!(ctx.system.matches("- (fact)").count(), 5);
    }
}
