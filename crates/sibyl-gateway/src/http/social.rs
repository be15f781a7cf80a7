//! Profile, agent, follow and post CRUD. Thin handlers: auth, ownership
//! check, store call.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use serde::Deserialize;

use sibyl_core::SibylError;
use sibyl_social::{Agent, Post, Profile};

use crate::app::AppState;
use crate::error::ApiResult;
use crate::ratelimit::Endpoint;

#[derive(Deserialize)]
pub struct CreateProfileBody {
    pub handle: String,
    pub display_name: String,
    #[serde(default)]
    pub bio: String,
}

/// POST /profiles — register the caller's profile. In dev mode the bearer
/// token becomes the profile id; with a real auth provider the id comes
/// from the token, so this simply records the row.
pub async fn create_profile(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateProfileBody>,
) -> ApiResult<Json<Profile>> {
    let _caller = state.auth.verify(&headers).await?;
    let profile = state
        .social
        .create_profile(&body.handle, &body.display_name, &body.bio)?;
    Ok(Json(profile))
}

pub async fn get_profile(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<Profile>> {
    state.auth.verify(&headers).await?;
    Ok(Json(state.social.get_profile(&id)?))
}

#[derive(Deserialize)]
pub struct UpdateProfileBody {
    pub display_name: Option<String>,
    pub bio: Option<String>,
    pub avatar_url: Option<String>,
}

pub async fn update_profile(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<UpdateProfileBody>,
) -> ApiResult<Json<Profile>> {
    let caller = state.auth.verify(&headers).await?;
    if caller != id {
        return Err(SibylError::PermissionDenied {
            reason: "profiles are owner-mutable only".into(),
        }
        .into());
    }
    Ok(Json(state.social.update_profile(
        &id,
        body.display_name.as_deref(),
        body.bio.as_deref(),
        body.avatar_url.as_deref(),
    )?))
}

/// DELETE /profiles/{id} — cascades owned agents (documents, chunks,
/// memories, vectors) and every conversation the profile touched.
pub async fn delete_profile(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let caller = state.auth.verify(&headers).await?;
    if caller != id {
        return Err(SibylError::PermissionDenied {
            reason: "only the owner can delete a profile".into(),
        }
        .into());
    }
    let agent_ids = state.social.delete_profile(&id)?;
    for agent_id in &agent_ids {
        state.vectors.remove_scope(agent_id, None)?;
        state.memories.purge_agent(agent_id)?;
    }
    let conversations = state.conversations.delete_for_profile(&id)?;
    state.list_cache.invalidate(&id);
    Ok(Json(serde_json::json!({
        "deleted": true,
        "agents": agent_ids.len(),
        "conversations": conversations,
    })))
}

#[derive(Deserialize)]
pub struct FollowBody {
    #[serde(default)]
    pub paid: bool,
}

/// POST /profiles/{id}/follow — follow a creator (optionally paid tier).
pub async fn follow(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<FollowBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let caller = state.auth.verify(&headers).await?;
    state.social.get_profile(&id)?;
    state.social.follow(&caller, &id, body.paid)?;
    Ok(Json(serde_json::json!({"following": id, "paid": body.paid})))
}

pub async fn unfollow(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let caller = state.auth.verify(&headers).await?;
    state.social.unfollow(&caller, &id)?;
    Ok(Json(serde_json::json!({"following": serde_json::Value::Null})))
}

#[derive(Deserialize)]
pub struct CreateAgentBody {
    pub handle: String,
    pub display_name: String,
    #[serde(default)]
    pub persona: String,
}

pub async fn create_agent(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateAgentBody>,
) -> ApiResult<Json<Agent>> {
    let caller = state.auth.verify(&headers).await?;
    state.limiter.check(&caller, Endpoint::AgentCreate)?;
    let agent = state
        .social
        .create_agent(&caller, &body.handle, &body.display_name, &body.persona)?;
    Ok(Json(agent))
}

pub async fn get_agent(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<Agent>> {
    state.auth.verify(&headers).await?;
    Ok(Json(state.social.get_agent(&id)?))
}

#[derive(Deserialize)]
pub struct UpdateAgentBody {
    pub display_name: Option<String>,
    pub persona: Option<String>,
    pub auto_post_enabled: Option<bool>,
}

pub async fn update_agent(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<UpdateAgentBody>,
) -> ApiResult<Json<Agent>> {
    let caller = state.auth.verify(&headers).await?;
    let agent = state.social.get_agent(&id)?;
    if agent.owner_profile_id != caller {
        return Err(SibylError::PermissionDenied {
            reason: "agents are owner-mutable only".into(),
        }
        .into());
    }
    Ok(Json(state.social.update_agent(
        &id,
        body.display_name.as_deref(),
        body.persona.as_deref(),
        body.auto_post_enabled,
    )?))
}

pub async fn list_posts(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<Post>>> {
    state.auth.verify(&headers).await?;
    state.social.get_agent(&id)?;
    Ok(Json(state.social.list_posts(&id, 50)?))
}
