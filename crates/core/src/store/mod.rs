//! Durable ledger of target files and their lifecycle.
//!
//! The store is the source of truth for what has been seen, what is
//! running, and what failed. All status transitions go through it.

mod sqlite;

pub use sqlite::SqliteStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Message recorded by the startup sweep for rows left `in_flight` by
/// a previous process.
pub const RECOVERY_MESSAGE: &str = "recovered: process exited without reporting completion";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Lifecycle status of a target file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    InFlight,
    Completed,
    Errored,
    Paused,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::InFlight => "in_flight",
            TaskStatus::Completed => "completed",
            TaskStatus::Errored => "errored",
            TaskStatus::Paused => "paused",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(TaskStatus::Queued),
            "in_flight" => Some(TaskStatus::InFlight),
            "completed" => Some(TaskStatus::Completed),
            "errored" => Some(TaskStatus::Errored),
            "paused" => Some(TaskStatus::Paused),
            _ => None,
        }
    }

    /// Whether a scan re-discovery may dispatch this task again.
    pub fn is_requeueable(&self) -> bool {
        matches!(self, TaskStatus::Queued | TaskStatus::Errored)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A row in `target_files`, keyed by absolute path.
#[derive(Debug, Clone, Serialize)]
pub struct TargetFile {
    pub path: String,
    pub pipeline_name: String,
    pub status: TaskStatus,
    pub error_count: u32,
    pub error_message: Option<String>,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_attempted_at: Option<DateTime<Utc>>,
}

/// Filter for task listings.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub pipeline: Option<String>,
    pub status: Option<TaskStatus>,
    /// Zero disables pagination.
    pub limit: i64,
    pub offset: i64,
}

impl TaskFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pipeline(mut self, pipeline: impl Into<String>) -> Self {
        self.pipeline = Some(pipeline.into());
        self
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_offset(mut self, offset: i64) -> Self {
        self.offset = offset;
        self
    }
}

/// Aggregate status counts for one pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub queued: i64,
    pub in_flight: i64,
    pub completed: i64,
    pub errored: i64,
    pub paused: i64,
}

/// Data-access port for the task ledger.
pub trait TargetStore: Send + Sync {
    /// Insert a row as `queued` if absent. An existing `errored` or
    /// `paused` row transitions back to `queued` with a refreshed
    /// `queued_at`; `queued`, `in_flight` and `completed` rows are
    /// left untouched. Scans are idempotent re-discovery events.
    fn upsert_queued(&self, path: &str, pipeline: &str) -> Result<(), StoreError>;

    /// Force-set `in_flight`; records `started_at` and
    /// `last_attempted_at`. Called just before subprocess spawn.
    fn mark_in_flight(&self, path: &str) -> Result<(), StoreError>;

    /// Terminal, absorbing.
    fn mark_completed(&self, path: &str) -> Result<(), StoreError>;

    /// Increments `error_count` and records the message.
    fn mark_errored(&self, path: &str, message: &str) -> Result<(), StoreError>;

    /// Sets `paused`. Completed rows are not moved.
    fn mark_paused(&self, path: &str) -> Result<(), StoreError>;

    /// Clears the error message and re-queues. Completed rows are not
    /// moved.
    fn mark_resumed(&self, path: &str) -> Result<(), StoreError>;

    fn get_by_path(&self, path: &str) -> Result<Option<TargetFile>, StoreError>;

    /// Ordered by `queued_at` descending.
    fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<TargetFile>, StoreError>;

    fn pipeline_stats(&self, pipeline: &str) -> Result<PipelineStats, StoreError>;

    /// Stored extra override for a pipeline, `"{}"` when absent.
    fn get_pipeline_extra(&self, name: &str) -> Result<String, StoreError>;

    fn set_pipeline_extra(&self, name: &str, extra_json: &str) -> Result<(), StoreError>;

    /// Startup sweep: any row still `in_flight` belongs to a process
    /// that died without reporting completion. Moves them to `errored`
    /// with [`RECOVERY_MESSAGE`] and returns how many were swept.
    /// Must run before the daemon's first tick.
    fn recover_in_flight(&self) -> Result<usize, StoreError>;
}
