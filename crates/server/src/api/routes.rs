use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use super::{handlers, pipelines, pool, tasks, ws};
use crate::state::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Health, config and metrics
        .route("/health", get(handlers::health))
        .route("/config", get(handlers::get_config))
        .route("/metrics", get(handlers::metrics))
        // Pool
        .route("/pool", get(pool::get_pool).patch(pool::patch_pool))
        // Pipelines
        .route("/pipelines", get(pipelines::list_pipelines))
        .route(
            "/pipelines/{name}",
            get(pipelines::get_pipeline).patch(pipelines::patch_pipeline),
        )
        // Tasks
        .route("/tasks", get(tasks::list_tasks))
        .route("/tasks/{id}", get(tasks::get_task))
        .route("/tasks/{id}/stop", post(tasks::stop_task))
        .route("/tasks/{id}/pause", post(tasks::pause_task))
        .route("/tasks/{id}/resume", post(tasks::resume_task))
        // Live event feed
        .route("/ws", get(ws::ws_handler))
        .with_state(state)
}
