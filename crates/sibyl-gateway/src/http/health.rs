use std::sync::Arc;

use axum::{extract::State, Json};
use serde_json::json;

use crate::app::AppState;

/// GET /health — liveness plus which providers are configured.
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "providers": {
            "anthropic": state.config.providers.anthropic.is_some(),
            "openai": state.config.providers.openai.is_some(),
        },
        "autopost_enabled": state.config.autopost.enabled,
    }))
}
