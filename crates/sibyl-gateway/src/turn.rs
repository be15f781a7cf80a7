//! The shared chat-turn pipeline: route, compose, stream, and fan out the
//! post-turn jobs. Both the inline and the SSE chat endpoints run through
//! here.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use sibyl_agent::{ChatStreamEvent, ComposeInputs, ComposedContext};
use sibyl_conversations::DirectConversation;
use sibyl_core::types::allowed_layers;
use sibyl_core::SibylError;
use sibyl_knowledge::RetrievedChunk;
use sibyl_orchestrator::{DecisionOutcome, RoutedTurn, TurnRequest};
use sibyl_social::Agent;

use crate::app::AppState;
use crate::error::ApiResult;

pub struct TurnStream {
    pub turn: RoutedTurn,
    pub events: mpsc::Receiver<ChatStreamEvent>,
    pub rag: Vec<RetrievedChunk>,
    /// Clears the active-stream registration when the consumer finishes or
    /// the client disconnects mid-stream.
    pub guard: StreamGuard,
}

/// Drop guard for one conversation's `active_streams` entry.
pub struct StreamGuard {
    state: Arc<AppState>,
    conversation_id: String,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.state.active_streams.remove(&self.conversation_id);
    }
}

/// Route a message and start the response stream. Post-turn memory
/// extraction is spawned here; intelligence and summarization wait for the
/// response text and are spawned by the event consumers.
pub async fn run_chat_turn(
    state: &Arc<AppState>,
    user_id: &str,
    conversation: &DirectConversation,
    agent: &Agent,
    message: &str,
) -> ApiResult<TurnStream> {
    if message.trim().is_empty() {
        return Err(SibylError::Validation("message cannot be empty".into()).into());
    }

    let caller_tier = state
        .social
        .tier_towards(user_id, &agent.owner_profile_id)?;
    let config = state.social.orchestrator_config(&agent.id)?;

    let request = TurnRequest {
        conversation_id: conversation.id.clone(),
        user_profile_id: user_id.to_string(),
        agent_id: agent.id.clone(),
        agent_owner_profile_id: agent.owner_profile_id.clone(),
        agent_handle: agent.handle.clone(),
        caller_tier,
        message: message.to_string(),
    };
    let turn = state.orchestrator.route_turn(&request, &config).await?;

    // The turn wrote messages — stale lists are now wrong for both sides.
    state.list_cache.invalidate(user_id);
    state.list_cache.invalidate(&agent.owner_profile_id);

    let is_owner = user_id == agent.owner_profile_id;
    let context: Option<ComposedContext> = match turn.outcome {
        DecisionOutcome::Answer => Some(
            state
                .composer
                .compose(&ComposeInputs {
                    agent_id: agent.id.clone(),
                    agent_handle: agent.handle.clone(),
                    persona: agent.persona.clone(),
                    allowed_layers: allowed_layers(is_owner, caller_tier),
                    conversation_id: conversation.id.clone(),
                    query: message.to_string(),
                    with_rag: true,
                })
                .await,
        ),
        // Clarification spends no retrieval tokens.
        DecisionOutcome::Clarify => Some(
            state
                .composer
                .compose(&ComposeInputs {
                    agent_id: agent.id.clone(),
                    agent_handle: agent.handle.clone(),
                    persona: agent.persona.clone(),
                    allowed_layers: allowed_layers(is_owner, caller_tier),
                    conversation_id: conversation.id.clone(),
                    query: message.to_string(),
                    with_rag: false,
                })
                .await,
        ),
        _ => None,
    };
    let rag = context.as_ref().map(|c| c.rag.clone()).unwrap_or_default();

    state.extractor.spawn(
        agent.id.clone(),
        conversation.id.clone(),
        turn.user_message.id.clone(),
    );

    // Register the stream so POST .../cancel can reach it. A newer turn in
    // the same conversation takes over the slot.
    let cancel = CancellationToken::new();
    state
        .active_streams
        .insert(conversation.id.clone(), cancel.clone());
    let guard = StreamGuard {
        state: state.clone(),
        conversation_id: conversation.id.clone(),
    };

    let events = state.responder.stream_turn(
        turn.clone(),
        context,
        agent.owner_profile_id.clone(),
        cancel,
    );

    Ok(TurnStream {
        turn,
        events,
        rag,
        guard,
    })
}

/// Fire the post-turn advisory jobs once the response text is known.
pub fn spawn_post_turn_jobs(
    state: &Arc<AppState>,
    conversation_id: &str,
    user_message: &str,
    response_message_id: Option<String>,
    response_text: String,
    rag: Vec<RetrievedChunk>,
) {
    if let Some(message_id) = response_message_id {
        if !response_text.is_empty() {
            state.intelligence.spawn(
                conversation_id.to_string(),
                message_id,
                user_message.to_string(),
                response_text,
                rag,
            );
        }
    }
    state.summarizer.spawn_if_due(conversation_id.to_string());
}

/// Drain a turn stream to completion, for the non-SSE endpoint. Returns the
/// concatenated response text and the persisted message id.
pub async fn drain_turn(
    state: &Arc<AppState>,
    mut stream: TurnStream,
) -> (RoutedTurn, String, Option<String>) {
    let mut text = String::new();
    let mut message_id = None;
    while let Some(event) = stream.events.recv().await {
        match event {
            ChatStreamEvent::Token { text: t } | ChatStreamEvent::System { text: t } => {
                text.push_str(&t)
            }
            ChatStreamEvent::Complete {
                message_id: id, ..
            } => message_id = id,
            _ => {}
        }
    }
    spawn_post_turn_jobs(
        state,
        &stream.turn.decision.conversation_id,
        &stream.turn.user_message.content,
        message_id.clone(),
        text.clone(),
        stream.rag,
    );
    (stream.turn, text, message_id)
}
