use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;
use std::sync::Arc;

use refinery_core::{load_config, Config};

use super::{error_response, ErrorResponse};
use crate::metrics::{collect_dynamic_metrics, encode_metrics};
use crate::state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

/// Re-parse the configuration file and return the fresh view. The
/// running daemon keeps its own view; file edits apply at the next
/// restart (pool and pipeline overrides go through PATCH instead).
pub async fn get_config(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Config>, (StatusCode, Json<ErrorResponse>)> {
    match load_config(state.config_path()) {
        Ok(config) => Ok(Json(config)),
        Err(e) => Err(error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            e.to_string(),
        )),
    }
}

pub async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    collect_dynamic_metrics(&state);
    encode_metrics()
}
