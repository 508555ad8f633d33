//! Pool observation and live resizing.

use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

use refinery_core::{HumanDuration, KillOrder, WorkerStatus};

use super::{error_response, ErrorResponse};
use crate::state::AppState;

/// Reserved override name the pool patch is persisted under.
const POOL_OVERRIDE_NAME: &str = "__pool__";

#[derive(Serialize)]
pub struct PoolResponse {
    pub size: usize,
    pub active: usize,
    pub workers: Vec<WorkerStatus>,
}

pub async fn get_pool(State(state): State<Arc<AppState>>) -> Json<PoolResponse> {
    let pool = state.pool();
    Json(PoolResponse {
        size: pool.size(),
        active: pool.active_count(),
        workers: pool.workers(),
    })
}

#[derive(Debug, Deserialize, Serialize)]
pub struct PatchPoolBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shrink_grace: Option<HumanDuration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shrink_kill_order: Option<KillOrder>,
}

#[derive(Serialize)]
pub struct PatchPoolResponse {
    pub size: usize,
    pub active: usize,
}

pub async fn patch_pool(
    State(state): State<Arc<AppState>>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<PatchPoolResponse>, (StatusCode, Json<ErrorResponse>)> {
    let body: PatchPoolBody = serde_json::from_value(body)
        .map_err(|e| error_response(StatusCode::BAD_REQUEST, e.to_string()))?;
    if body.size == Some(0) {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "size must be at least 1",
        ));
    }

    let pool = state.pool();
    let size = body.size.unwrap_or_else(|| pool.size());
    pool.resize(
        size,
        body.shrink_grace.map(|g| g.as_duration()),
        body.shrink_kill_order,
    );

    // Persist so a restart can pick the override up.
    match serde_json::to_string(&body) {
        Ok(json) => {
            if let Err(e) = state.store().set_pipeline_extra(POOL_OVERRIDE_NAME, &json) {
                warn!(%e, "failed to persist pool override");
            }
        }
        Err(e) => warn!(%e, "failed to serialize pool override"),
    }

    Ok(Json(PatchPoolResponse {
        size: pool.size(),
        active: pool.active_count(),
    }))
}
