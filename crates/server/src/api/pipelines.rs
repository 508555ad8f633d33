//! Pipeline listings, stats and extra overrides.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;
use std::sync::Arc;

use refinery_core::{PipelineConfig, PipelineStats};

use super::{error_response, ErrorResponse};
use crate::state::AppState;

#[derive(Serialize)]
pub struct PipelineItem {
    pub name: String,
    pub priority: i32,
    pub stats: PipelineStats,
}

pub async fn list_pipelines(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<PipelineItem>>, (StatusCode, Json<ErrorResponse>)> {
    let mut items = Vec::new();
    for pipeline in &state.config().pipelines {
        let stats = state
            .store()
            .pipeline_stats(&pipeline.name)
            .map_err(|e| error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
        items.push(PipelineItem {
            name: pipeline.name.clone(),
            priority: pipeline.priority,
            stats,
        });
    }
    Ok(Json(items))
}

#[derive(Serialize)]
pub struct PipelineDetail {
    pub config: PipelineConfig,
    pub extra: serde_json::Value,
    pub stats: PipelineStats,
}

pub async fn get_pipeline(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<PipelineDetail>, (StatusCode, Json<ErrorResponse>)> {
    let Some(config) = state
        .config()
        .pipelines
        .iter()
        .find(|p| p.name == name)
        .cloned()
    else {
        return Err(error_response(StatusCode::NOT_FOUND, "pipeline not found"));
    };

    let extra_json = state
        .store()
        .get_pipeline_extra(&name)
        .map_err(|e| error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    let extra =
        serde_json::from_str(&extra_json).unwrap_or(serde_json::Value::Object(Default::default()));
    let stats = state
        .store()
        .pipeline_stats(&name)
        .map_err(|e| error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    Ok(Json(PipelineDetail {
        config,
        extra,
        stats,
    }))
}

#[derive(Serialize)]
pub struct PatchPipelineResponse {
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Replace the stored extra override for a pipeline. Values here
/// shadow the configuration's `extra` at command-render time.
pub async fn patch_pipeline(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<PatchPipelineResponse>, (StatusCode, Json<ErrorResponse>)> {
    if !state.config().pipelines.iter().any(|p| p.name == name) {
        return Err(error_response(StatusCode::NOT_FOUND, "pipeline not found"));
    }

    let serde_json::Value::Object(extra) = body else {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "expected a JSON object of extra values",
        ));
    };

    let json = serde_json::to_string(&extra)
        .map_err(|e| error_response(StatusCode::BAD_REQUEST, e.to_string()))?;
    state
        .store()
        .set_pipeline_extra(&name, &json)
        .map_err(|e| error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    Ok(Json(PatchPipelineResponse { extra }))
}
