//! Cron-invoked routes, guarded by the X-Scheduler-Key shared secret.
//! These bypass user-space rate limits but honor the global kill switch.

use std::sync::Arc;

use axum::{extract::State, http::HeaderMap, Json};

use sibyl_scheduler::BatchReport;

use crate::app::AppState;
use crate::error::ApiResult;

/// POST /scheduled/trigger-autopost — run one autopost batch.
pub async fn trigger_autopost(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<Json<BatchReport>> {
    state.auth.verify_scheduler_key(&headers)?;
    let report = state.autopost.run_batch(chrono::Utc::now()).await?;
    Ok(Json(report))
}
