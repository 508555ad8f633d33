//! Task listings and per-task control.
//!
//! Tasks are addressed by their stable URL-safe id, the base64
//! encoding of the file path.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use refinery_core::{path_from_task_id, task_id, TargetFile, TaskFilter, TaskStatus};

use super::{error_response, ErrorResponse};
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct TaskResponse {
    pub id: String,
    #[serde(flatten)]
    pub task: TargetFile,
}

impl From<TargetFile> for TaskResponse {
    fn from(task: TargetFile) -> Self {
        Self {
            id: task_id(&task.path),
            task,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ListTasksParams {
    pub pipeline: Option<String>,
    pub status: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

pub async fn list_tasks(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListTasksParams>,
) -> Result<Json<Vec<TaskResponse>>, (StatusCode, Json<ErrorResponse>)> {
    let mut filter = TaskFilter::new()
        .with_limit(params.limit.unwrap_or(0).max(0))
        .with_offset(params.offset.unwrap_or(0).max(0));

    if let Some(ref pipeline) = params.pipeline {
        filter = filter.with_pipeline(pipeline.clone());
    }
    if let Some(ref status) = params.status {
        let status = TaskStatus::parse(status).ok_or_else(|| {
            error_response(
                StatusCode::BAD_REQUEST,
                format!("unknown status {status:?}"),
            )
        })?;
        filter = filter.with_status(status);
    }

    let tasks = state
        .store()
        .list_tasks(&filter)
        .map_err(|e| error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    Ok(Json(tasks.into_iter().map(TaskResponse::from).collect()))
}

pub async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<TaskResponse>, (StatusCode, Json<ErrorResponse>)> {
    let path = path_from_task_id(&id)
        .map_err(|e| error_response(StatusCode::BAD_REQUEST, e.to_string()))?;

    match state.store().get_by_path(&path) {
        Ok(Some(task)) => Ok(Json(TaskResponse::from(task))),
        Ok(None) => Err(error_response(StatusCode::NOT_FOUND, "task not found")),
        Err(e) => Err(error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            e.to_string(),
        )),
    }
}

#[derive(Serialize)]
pub struct TaskActionResponse {
    pub status: String,
}

/// Cancel the running worker for a task. The job lands in `errored`
/// and the next scan tick retries it.
pub async fn stop_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<TaskActionResponse>, (StatusCode, Json<ErrorResponse>)> {
    state
        .pool()
        .stop_worker(&id)
        .map_err(|e| error_response(StatusCode::NOT_FOUND, e.to_string()))?;

    Ok(Json(TaskActionResponse {
        status: "stopping".to_string(),
    }))
}

/// Pause a task: best-effort stop of any running worker, then mark
/// paused so future scans skip it. Idempotent when nothing is running.
pub async fn pause_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<TaskActionResponse>, (StatusCode, Json<ErrorResponse>)> {
    let path = path_from_task_id(&id)
        .map_err(|e| error_response(StatusCode::BAD_REQUEST, e.to_string()))?;

    let _ = state.pool().stop_worker(&id);
    state
        .store()
        .mark_paused(&path)
        .map_err(|e| error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    state.events().task_paused(&path);

    Ok(Json(TaskActionResponse {
        status: "paused".to_string(),
    }))
}

/// Re-queue a paused or errored task. Dispatch happens on the next
/// scan tick, not immediately.
pub async fn resume_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<TaskActionResponse>, (StatusCode, Json<ErrorResponse>)> {
    let path = path_from_task_id(&id)
        .map_err(|e| error_response(StatusCode::BAD_REQUEST, e.to_string()))?;

    state
        .store()
        .mark_resumed(&path)
        .map_err(|e| error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    state.events().task_resumed(&path);

    Ok(Json(TaskActionResponse {
        status: "queued".to_string(),
    }))
}
