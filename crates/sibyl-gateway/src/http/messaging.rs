//! Conversation surface: the cached batched list, plain sends, read marks,
//! and the SSE streaming chat endpoint.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::HeaderMap,
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures_util::Stream;
use serde::Deserialize;

use sibyl_agent::ChatStreamEvent;
use sibyl_conversations::{ChatType, DirectConversation, DirectMessage, SenderKind};
use sibyl_core::SibylError;

use crate::app::AppState;
use crate::error::ApiResult;
use crate::ratelimit::Endpoint;
use crate::turn::{run_chat_turn, spawn_post_turn_jobs};

/// GET /messaging/conversations — the caller's conversations, batched and
/// cached for 30 seconds.
pub async fn list_conversations(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<Json<serde_json::Value>> {
    let caller = state.auth.verify(&headers).await?;

    if let Some(cached) = state.list_cache.get(&caller) {
        return Ok(Json(cached));
    }

    let entries = state.conversations.list_for_user(&caller)?;
    let response = serde_json::json!({ "conversations": entries });
    state.list_cache.put(&caller, response.clone());
    Ok(Json(response))
}

fn participant_conversation(
    state: &Arc<AppState>,
    conversation_id: &str,
    caller: &str,
) -> Result<DirectConversation, SibylError> {
    let conversation = state.conversations.get(conversation_id)?;
    if !conversation.has_participant(caller) {
        return Err(SibylError::PermissionDenied {
            reason: "not a participant of this conversation".into(),
        });
    }
    Ok(conversation)
}

#[derive(Deserialize)]
pub struct SendMessageBody {
    pub message: String,
}

/// POST /messaging/conversations/{id}/messages — send without streaming.
/// Agent conversations run the full orchestrator turn; profile
/// conversations are a plain append.
pub async fn send_message(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<SendMessageBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let caller = state.auth.verify(&headers).await?;
    state.limiter.check(&caller, Endpoint::Chat)?;
    let conversation = participant_conversation(&state, &id, &caller)?;

    match (conversation.chat_type, &conversation.target_agent_id) {
        (ChatType::Agent, Some(agent_id)) => {
            let agent = state.social.get_agent(agent_id)?;
            let stream =
                run_chat_turn(&state, &caller, &conversation, &agent, &body.message).await?;
            let (turn, response_text, message_id) =
                crate::turn::drain_turn(&state, stream).await;
            Ok(Json(serde_json::json!({
                "message": turn.user_message,
                "decision_path": turn.decision.path.to_string(),
                "response": response_text,
                "response_message_id": message_id,
            })))
        }
        _ => {
            if body.message.trim().is_empty() {
                return Err(SibylError::Validation("message cannot be empty".into()).into());
            }
            let message = state.conversations.send_message(
                &conversation.id,
                &caller,
                SenderKind::User,
                None,
                &body.message,
            )?;
            state.list_cache.invalidate(&conversation.participant1_id);
            state.list_cache.invalidate(&conversation.participant2_id);
            Ok(Json(serde_json::json!({ "message": message })))
        }
    }
}

/// GET /messaging/conversations/{id}/messages — strict created_at order.
pub async fn list_messages(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<DirectMessage>>> {
    let caller = state.auth.verify(&headers).await?;
    let conversation = participant_conversation(&state, &id, &caller)?;
    Ok(Json(state.conversations.messages(&conversation.id, 200)?))
}

/// POST /messaging/conversations/{id}/read — idempotent read-mark.
pub async fn mark_read(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let caller = state.auth.verify(&headers).await?;
    let conversation = participant_conversation(&state, &id, &caller)?;
    let marked = state.conversations.mark_read(&conversation.id, &caller)?;
    state.list_cache.invalidate(&caller);
    Ok(Json(serde_json::json!({ "marked": marked })))
}

/// POST /messaging/conversations/{id}/cancel — stop the in-flight streamed
/// generation for this conversation, if any. The partial response is
/// persisted with the truncation flag and the stream closes normally.
pub async fn cancel_stream(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let caller = state.auth.verify(&headers).await?;
    let conversation = participant_conversation(&state, &id, &caller)?;
    let cancelled = match state.active_streams.get(&conversation.id) {
        Some(entry) => {
            entry.value().cancel();
            true
        }
        None => false,
    };
    Ok(Json(serde_json::json!({ "cancelled": cancelled })))
}

/// POST /messaging/conversations/{id}/stream — SSE chat through the
/// orchestrator. Frames are `data: <json>\n\n`, event shapes per the chat
/// stream contract; the final frame is `complete` (or `error`).
pub async fn stream_message(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<SendMessageBody>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let caller = state.auth.verify(&headers).await?;
    state.limiter.check(&caller, Endpoint::Chat)?;
    let conversation = participant_conversation(&state, &id, &caller)?;

    let (ChatType::Agent, Some(agent_id)) =
        (conversation.chat_type, conversation.target_agent_id.as_deref())
    else {
        return Err(SibylError::Validation(
            "streaming is only available in agent conversations".into(),
        )
        .into());
    };
    let agent = state.social.get_agent(agent_id)?;

    let turn_stream = run_chat_turn(&state, &caller, &conversation, &agent, &body.message).await?;
    let turn = turn_stream.turn;
    let rag = turn_stream.rag;
    let mut events = turn_stream.events;
    let guard = turn_stream.guard;

    let user_message = turn.user_message.content.clone();
    let conversation_id = turn.decision.conversation_id.clone();
    let state_for_jobs = state.clone();

    let stream = async_stream::stream! {
        // Keeps the cancel registration alive for exactly as long as the
        // client is consuming; dropping the stream clears it.
        let _guard = guard;
        let mut response_text = String::new();
        let mut response_message_id: Option<String> = None;
        while let Some(event) = events.recv().await {
            match &event {
                ChatStreamEvent::Token { text } | ChatStreamEvent::System { text } => {
                    response_text.push_str(text);
                }
                ChatStreamEvent::Complete { message_id, .. } => {
                    response_message_id = message_id.clone();
                }
                _ => {}
            }
            let frame = Event::default().json_data(&event).unwrap_or_else(|_| Event::default());
            yield Ok(frame);
        }
        spawn_post_turn_jobs(
            &state_for_jobs,
            &conversation_id,
            &user_message,
            response_message_id,
            response_text,
            rag,
        );
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
