//! Owner-scoped knowledge management: document ingestion, memories, and
//! canonical answer seeding.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use serde::Deserialize;

use sibyl_core::types::Layer;
use sibyl_core::SibylError;
use sibyl_knowledge::Document;
use sibyl_memory::AgentMemory;
use sibyl_orchestrator::CanonicalAnswer;
use sibyl_social::Agent;

use crate::app::AppState;
use crate::error::ApiResult;

/// Resolve the agent and require the caller to own it.
async fn owned_agent(
    state: &Arc<AppState>,
    headers: &HeaderMap,
    agent_id: &str,
) -> Result<(String, Agent), SibylError> {
    let caller = state.auth.verify(headers).await?;
    let agent = state.social.get_agent(agent_id)?;
    if agent.owner_profile_id != caller {
        return Err(SibylError::PermissionDenied {
            reason: "only the agent owner may manage its knowledge".into(),
        });
    }
    Ok((caller, agent))
}

#[derive(Deserialize)]
pub struct IngestBody {
    pub layer: Layer,
    pub content: String,
    #[serde(default = "default_source")]
    pub source: String,
}

fn default_source() -> String {
    "manual".to_string()
}

/// POST /agents/{id}/documents — chunk, embed and index a document.
pub async fn ingest_document(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<IngestBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let (_, agent) = owned_agent(&state, &headers, &id).await?;
    let (document_id, chunk_count) = state
        .knowledge
        .ingest(&agent.id, body.layer, &body.content, &body.source)
        .await?;
    Ok(Json(serde_json::json!({
        "document_id": document_id,
        "chunk_count": chunk_count,
    })))
}

pub async fn list_documents(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<Document>>> {
    let (_, agent) = owned_agent(&state, &headers, &id).await?;
    Ok(Json(state.knowledge.list_documents(&agent.id)?))
}

pub async fn delete_document(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((id, document_id)): Path<(String, String)>,
) -> ApiResult<Json<serde_json::Value>> {
    let (_, agent) = owned_agent(&state, &headers, &id).await?;
    state.knowledge.delete_document(&agent.id, &document_id)?;
    Ok(Json(serde_json::json!({"deleted": document_id})))
}

pub async fn list_memories(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<AgentMemory>>> {
    let (_, agent) = owned_agent(&state, &headers, &id).await?;
    Ok(Json(
        state
            .memories
            .list(&agent.id, 100)
            .map_err(|e| SibylError::Database(e.to_string()))?,
    ))
}

#[derive(Deserialize)]
pub struct SeedCanonicalBody {
    pub question_pattern: String,
    pub answer_content: String,
    pub layer: Layer,
}

/// POST /agents/{id}/canonical — owner-seeded canonical answer, outside any
/// escalation.
pub async fn seed_canonical(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<SeedCanonicalBody>,
) -> ApiResult<Json<CanonicalAnswer>> {
    let (_, agent) = owned_agent(&state, &headers, &id).await?;
    if body.question_pattern.trim().is_empty() || body.answer_content.trim().is_empty() {
        return Err(SibylError::Validation(
            "question_pattern and answer_content are required".into(),
        )
        .into());
    }
    let canonical = state
        .canonical
        .seed(&agent.id, &body.question_pattern, &body.answer_content, body.layer)
        .await?;
    Ok(Json(canonical))
}

pub async fn list_canonical(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<CanonicalAnswer>>> {
    let (_, agent) = owned_agent(&state, &headers, &id).await?;
    Ok(Json(state.canonical.list_for_agent(&agent.id)?))
}
