//! The orchestrator surface: message routing, the escalation queue
//! lifecycle, per-agent config and decision metrics.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    Json,
};
use serde::Deserialize;

use sibyl_conversations::ChatType;
use sibyl_core::types::Layer;
use sibyl_core::SibylError;
use sibyl_orchestrator::{AgentMetrics, Escalation};
use sibyl_social::OrchestratorConfig;

use crate::app::AppState;
use crate::error::ApiResult;
use crate::ratelimit::Endpoint;
use crate::turn::{drain_turn, run_chat_turn};

#[derive(Deserialize)]
pub struct RouteMessageBody {
    pub agent_id: String,
    pub message: String,
}

/// POST /orchestrator/message — route a message and return the decision
/// with the inline response (or offer/refusal payload). The SSE variant
/// lives at /messaging/conversations/{id}/stream.
pub async fn route_message(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<RouteMessageBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let caller = state.auth.verify(&headers).await?;
    state.limiter.check(&caller, Endpoint::Chat)?;

    let agent = state.social.get_agent(&body.agent_id)?;
    let conversation = state.conversations.ensure_conversation(
        &caller,
        &agent.owner_profile_id,
        ChatType::Agent,
        Some(&agent.id),
    )?;

    let stream = run_chat_turn(&state, &caller, &conversation, &agent, &body.message).await?;
    let (turn, response_text, message_id) = drain_turn(&state, stream).await;

    Ok(Json(serde_json::json!({
        "conversation_id": conversation.id,
        "decision": {
            "path": turn.decision.path.to_string(),
            "confidence": turn.decision.confidence,
            "novelty": turn.decision.novelty,
            "complexity": turn.decision.complexity,
        },
        "response": response_text,
        "message_id": message_id,
        "escalation_id": turn.escalation.map(|e| e.id),
    })))
}

#[derive(Deserialize)]
pub struct QueueQuery {
    pub agent_id: String,
}

/// GET /orchestrator/queue?agent_id= — the creator's open escalations.
pub async fn queue(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<QueueQuery>,
) -> ApiResult<Json<Vec<Escalation>>> {
    let caller = state.auth.verify(&headers).await?;
    let agent = state.social.get_agent(&query.agent_id)?;
    if agent.owner_profile_id != caller {
        return Err(SibylError::PermissionDenied {
            reason: "the queue is owner-scoped".into(),
        }
        .into());
    }
    Ok(Json(state.escalations.open_for_agent(&agent.id)?))
}

/// POST /orchestrator/queue/{id}/accept — the asking user accepts a
/// standing offer (path E).
pub async fn accept(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<Escalation>> {
    let caller = state.auth.verify(&headers).await?;
    state.limiter.check(&caller, Endpoint::Escalation)?;
    let escalation = state.orchestrator.accept_offer(&id, &caller)?;
    Ok(Json(escalation))
}

#[derive(Deserialize)]
pub struct AnswerBody {
    pub answer: String,
    #[serde(default = "default_layer")]
    pub layer: Layer,
}

fn default_layer() -> Layer {
    Layer::Public
}

/// POST /orchestrator/queue/{id}/answer — creator answers; atomically
/// finalizes the escalation and mints the canonical answer.
pub async fn answer(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<AnswerBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let caller = state.auth.verify(&headers).await?;
    if body.answer.trim().is_empty() {
        return Err(SibylError::Validation("answer cannot be empty".into()).into());
    }
    let escalation = state.escalations.get(&id)?;
    let agent = state.social.get_agent(&escalation.agent_id)?;
    if agent.owner_profile_id != caller {
        return Err(SibylError::PermissionDenied {
            reason: "only the creator answers escalations".into(),
        }
        .into());
    }

    let (escalation, canonical) = state
        .orchestrator
        .answer_escalation(&id, &caller, &body.answer, body.layer)
        .await?;
    state.list_cache.invalidate(&escalation.user_id);
    state.list_cache.invalidate(&caller);

    Ok(Json(serde_json::json!({
        "escalation": escalation,
        "canonical_answer_id": canonical.id,
    })))
}

/// POST /orchestrator/queue/{id}/decline — creator declines; terminal.
pub async fn decline(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<Escalation>> {
    let caller = state.auth.verify(&headers).await?;
    let escalation = state.escalations.get(&id)?;
    let agent = state.social.get_agent(&escalation.agent_id)?;
    if agent.owner_profile_id != caller {
        return Err(SibylError::PermissionDenied {
            reason: "only the creator declines escalations".into(),
        }
        .into());
    }
    Ok(Json(state.escalations.decline(&id)?))
}

/// GET /orchestrator/config/{agent_id} — owner-scoped.
pub async fn get_config(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(agent_id): Path<String>,
) -> ApiResult<Json<OrchestratorConfig>> {
    let caller = state.auth.verify(&headers).await?;
    let agent = state.social.get_agent(&agent_id)?;
    if agent.owner_profile_id != caller {
        return Err(SibylError::PermissionDenied {
            reason: "config is owner-scoped".into(),
        }
        .into());
    }
    Ok(Json(state.social.orchestrator_config(&agent.id)?))
}

/// PUT /orchestrator/config/{agent_id} — owner-scoped.
pub async fn put_config(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(agent_id): Path<String>,
    Json(config): Json<OrchestratorConfig>,
) -> ApiResult<Json<OrchestratorConfig>> {
    let caller = state.auth.verify(&headers).await?;
    let agent = state.social.get_agent(&agent_id)?;
    if agent.owner_profile_id != caller {
        return Err(SibylError::PermissionDenied {
            reason: "config is owner-scoped".into(),
        }
        .into());
    }
    state.social.save_orchestrator_config(&agent.id, &config)?;
    Ok(Json(config))
}

#[derive(Deserialize)]
pub struct MetricsQuery {
    #[serde(default = "default_window")]
    pub window_days: u32,
}

fn default_window() -> u32 {
    7
}

/// GET /orchestrator/metrics/{agent_id} — aggregated decision analytics.
pub async fn agent_metrics(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(agent_id): Path<String>,
    Query(query): Query<MetricsQuery>,
) -> ApiResult<Json<AgentMetrics>> {
    let caller = state.auth.verify(&headers).await?;
    let agent = state.social.get_agent(&agent_id)?;
    if agent.owner_profile_id != caller {
        return Err(SibylError::PermissionDenied {
            reason: "metrics are owner-scoped".into(),
        }
        .into());
    }
    Ok(Json(state.metrics.for_agent(&agent.id, query.window_days)?))
}
