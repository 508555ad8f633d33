//! Broadcast bus for task lifecycle events.
//!
//! The pool, daemon and API emit events here; the WebSocket layer
//! forwards them to connected clients. Sends with no subscribers are
//! silently dropped.

use serde::Serialize;
use tokio::sync::broadcast;

/// An observable state change, serialized as JSON on the wire.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    TaskQueued {
        path: String,
        pipeline: String,
    },
    TaskStarted {
        path: String,
        pipeline: String,
    },
    TaskCompleted {
        path: String,
        pipeline: String,
    },
    TaskErrored {
        path: String,
        pipeline: String,
        error: String,
    },
    TaskPaused {
        path: String,
    },
    TaskResumed {
        path: String,
    },
    PoolResized {
        size: usize,
    },
}

/// Fan-out channel for [`TaskEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<TaskEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: TaskEvent) {
        // No receivers just means no one is watching.
        let _ = self.sender.send(event);
    }

    pub fn task_queued(&self, path: &str, pipeline: &str) {
        self.emit(TaskEvent::TaskQueued {
            path: path.to_string(),
            pipeline: pipeline.to_string(),
        });
    }

    pub fn task_started(&self, path: &str, pipeline: &str) {
        self.emit(TaskEvent::TaskStarted {
            path: path.to_string(),
            pipeline: pipeline.to_string(),
        });
    }

    pub fn task_completed(&self, path: &str, pipeline: &str) {
        self.emit(TaskEvent::TaskCompleted {
            path: path.to_string(),
            pipeline: pipeline.to_string(),
        });
    }

    pub fn task_errored(&self, path: &str, pipeline: &str, error: &str) {
        self.emit(TaskEvent::TaskErrored {
            path: path.to_string(),
            pipeline: pipeline.to_string(),
            error: error.to_string(),
        });
    }

    pub fn task_paused(&self, path: &str) {
        self.emit(TaskEvent::TaskPaused {
            path: path.to_string(),
        });
    }

    pub fn task_resumed(&self, path: &str) {
        self.emit(TaskEvent::TaskResumed {
            path: path.to_string(),
        });
    }

    pub fn pool_resized(&self, size: usize) {
        self.emit(TaskEvent::PoolResized { size });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
