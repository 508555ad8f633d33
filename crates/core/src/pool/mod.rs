//! Bounded worker pool for converter subprocesses.
//!
//! The pool owns every running subprocess, enforces the concurrency
//! cap, supports live resizing with a graceful shrink, and reports
//! completion back through a [`CompletionHandler`].

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{KillOrder, PipelineConfig, PoolConfig};
use crate::events::EventBus;
use crate::executor::{self, ExecutorError};
use crate::scanner::Candidate;
use crate::store::{StoreError, TargetStore};

/// Why a finished job did not succeed.
#[derive(Debug, Clone, Error)]
pub enum JobError {
    /// Terminated through the worker's cancellation handle (operator
    /// stop, shrink, or shutdown).
    #[error("cancelled")]
    Cancelled,

    #[error("exit code {0}")]
    ExitCode(i32),

    /// Killed by a signal the pool did not send.
    #[error("terminated by signal")]
    Signal,

    #[error("wait: {0}")]
    Wait(String),
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("unknown pipeline {0:?}")]
    UnknownPipeline(String),

    #[error("no active worker with id {0:?}")]
    WorkerNotFound(String),

    #[error("invalid task id: {0}")]
    InvalidTaskId(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Render(#[from] ExecutorError),

    #[error("spawn {command:?}: {source}")]
    SpawnFailed {
        command: String,
        source: std::io::Error,
    },
}

/// Invoked after each job finishes, with `None` on success.
#[async_trait]
pub trait CompletionHandler: Send + Sync {
    async fn on_complete(&self, path: &str, pipeline: &str, error: Option<JobError>);
}

/// Snapshot of a running worker.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    pub id: String,
    pub path: String,
    pub pipeline: String,
    pub started_at: DateTime<Utc>,
}

/// A candidate the pool could not start; the caller is responsible
/// for recording the failure so no row is left stuck `in_flight`.
#[derive(Debug)]
pub struct DispatchFailure {
    pub path: String,
    pub pipeline: String,
    pub error: PoolError,
}

struct Worker {
    id: String,
    path: String,
    pipeline: String,
    started_at: DateTime<Utc>,
    pid: i32,
    cancelled: Arc<AtomicBool>,
}

struct PoolState {
    size: usize,
    shrink_grace: Duration,
    kill_order: KillOrder,
    workers: HashMap<String, Worker>,
    shrink_timer: Option<JoinHandle<()>>,
}

/// Bounded concurrent executor for converter subprocesses.
pub struct Pool {
    state: Mutex<PoolState>,
    store: Arc<dyn TargetStore>,
    pipelines: HashMap<String, PipelineConfig>,
    on_complete: Arc<dyn CompletionHandler>,
    events: EventBus,
}

impl Pool {
    pub fn new(
        config: &PoolConfig,
        store: Arc<dyn TargetStore>,
        pipelines: &[PipelineConfig],
        on_complete: Arc<dyn CompletionHandler>,
        events: EventBus,
    ) -> Self {
        let pipelines = pipelines
            .iter()
            .map(|p| (p.name.clone(), p.clone()))
            .collect();
        Self {
            state: Mutex::new(PoolState {
                size: config.size,
                shrink_grace: config.shrink_grace.as_duration(),
                kill_order: config.shrink_kill_order,
                workers: HashMap::new(),
                shrink_timer: None,
            }),
            store,
            pipelines,
            on_complete,
            events,
        }
    }

    pub fn size(&self) -> usize {
        self.state.lock().unwrap().size
    }

    pub fn active_count(&self) -> usize {
        self.state.lock().unwrap().workers.len()
    }

    pub fn workers(&self) -> Vec<WorkerStatus> {
        let state = self.state.lock().unwrap();
        state
            .workers
            .values()
            .map(|w| WorkerStatus {
                id: w.id.clone(),
                path: w.path.clone(),
                pipeline: w.pipeline.clone(),
                started_at: w.started_at,
            })
            .collect()
    }

    /// Start subprocesses for candidates up to the free-slot count, in
    /// input order. Candidates whose worker id is already active are
    /// skipped, which keeps at most one live worker per path.
    pub fn dispatch(self: &Arc<Self>, candidates: &[Candidate]) -> Vec<DispatchFailure> {
        let slots = {
            let state = self.state.lock().unwrap();
            state.size.saturating_sub(state.workers.len())
        };
        let mut failures = Vec::new();
        if slots == 0 {
            return failures;
        }

        let mut started = 0;
        for candidate in candidates {
            if started >= slots {
                break;
            }
            let id = task_id(&candidate.path.to_string_lossy());
            let running = self.state.lock().unwrap().workers.contains_key(&id);
            if running {
                continue;
            }
            match self.start_worker(candidate) {
                Ok(()) => started += 1,
                Err(error) => {
                    warn!(path = %candidate.path.display(), %error, "dispatch failed");
                    failures.push(DispatchFailure {
                        path: candidate.path.to_string_lossy().into_owned(),
                        pipeline: candidate.pipeline_name.clone(),
                        error,
                    });
                }
            }
        }
        failures
    }

    fn start_worker(self: &Arc<Self>, candidate: &Candidate) -> Result<(), PoolError> {
        let pipeline = self
            .pipelines
            .get(&candidate.pipeline_name)
            .ok_or_else(|| PoolError::UnknownPipeline(candidate.pipeline_name.clone()))?;

        let db_extra = self.store.get_pipeline_extra(&pipeline.name)?;
        let extra_json = executor::merge_extra(&pipeline.extra, &db_extra)?;
        let output = executor::render_target_path(
            &candidate.path,
            pipeline.target.regex.as_deref(),
            &pipeline.target.format,
        )?;
        let argv = executor::render_command(&pipeline.command, &candidate.path, &output, &extra_json)?;

        let path = candidate.path.to_string_lossy().into_owned();

        // The mark must be visible before the subprocess exists.
        self.store.mark_in_flight(&path)?;

        let mut command = Command::new(&argv[0]);
        command
            .args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        // Own process group, so cancellation takes the whole subtree.
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|source| PoolError::SpawnFailed {
            command: argv[0].clone(),
            source,
        })?;

        let id = task_id(&path);
        let pid = child.id().map(|p| p as i32).unwrap_or(0);
        let cancelled = Arc::new(AtomicBool::new(false));

        {
            let mut state = self.state.lock().unwrap();
            state.workers.insert(
                id.clone(),
                Worker {
                    id: id.clone(),
                    path: path.clone(),
                    pipeline: pipeline.name.clone(),
                    started_at: Utc::now(),
                    pid,
                    cancelled: Arc::clone(&cancelled),
                },
            );
        }

        info!(path = %path, output = %output, pipeline = %pipeline.name, "worker started");
        self.events.task_started(&path, &pipeline.name);

        let pool = Arc::clone(self);
        let pipeline_name = pipeline.name.clone();
        tokio::spawn(async move {
            let result = child.wait().await;

            {
                let mut state = pool.state.lock().unwrap();
                state.workers.remove(&id);
            }

            let error = match result {
                Err(e) => Some(JobError::Wait(e.to_string())),
                Ok(_) if cancelled.load(Ordering::SeqCst) => {
                    info!(path = %path, "worker cancelled");
                    Some(JobError::Cancelled)
                }
                Ok(status) if status.success() => {
                    info!(path = %path, "worker completed");
                    None
                }
                Ok(status) => match status.code() {
                    Some(code) => {
                        warn!(path = %path, code, "worker failed");
                        Some(JobError::ExitCode(code))
                    }
                    None => {
                        warn!(path = %path, "worker killed by signal");
                        Some(JobError::Signal)
                    }
                },
            };

            // The pool lock is released before the callback runs.
            pool.on_complete.on_complete(&path, &pipeline_name, error).await;
        });

        Ok(())
    }

    /// Cancel the named worker. The job surfaces as
    /// [`JobError::Cancelled`], so it goes back through `errored` and
    /// is retried on a later tick.
    pub fn stop_worker(&self, id: &str) -> Result<(), PoolError> {
        let (pid, cancelled) = {
            let state = self.state.lock().unwrap();
            let worker = state
                .workers
                .get(id)
                .ok_or_else(|| PoolError::WorkerNotFound(id.to_string()))?;
            (worker.pid, Arc::clone(&worker.cancelled))
        };
        cancelled.store(true, Ordering::SeqCst);
        terminate_group(pid, false);
        Ok(())
    }

    /// Update capacity. Shrinking below the active count arms a
    /// one-shot timer for the grace period; a later resize that leaves
    /// the pool over capacity replaces the pending timer.
    pub fn resize(
        self: &Arc<Self>,
        size: usize,
        grace: Option<Duration>,
        kill_order: Option<KillOrder>,
    ) {
        let mut state = self.state.lock().unwrap();
        state.size = size;
        if let Some(grace) = grace {
            state.shrink_grace = grace;
        }
        if let Some(order) = kill_order {
            state.kill_order = order;
        }

        if state.workers.len() > size {
            if let Some(timer) = state.shrink_timer.take() {
                timer.abort();
            }
            let delay = state.shrink_grace;
            let pool = Arc::clone(self);
            state.shrink_timer = Some(tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                pool.kill_excess();
            }));
        }

        info!(size, "pool resized");
        self.events.pool_resized(size);
    }

    /// Cancel over-limit workers, selected by kill order on start time.
    fn kill_excess(&self) {
        let victims: Vec<(String, i32, Arc<AtomicBool>)> = {
            let state = self.state.lock().unwrap();
            let excess = state.workers.len().saturating_sub(state.size);
            if excess == 0 {
                return;
            }
            let mut workers: Vec<&Worker> = state.workers.values().collect();
            workers.sort_by(|a, b| match state.kill_order {
                KillOrder::Oldest => a.started_at.cmp(&b.started_at),
                KillOrder::Youngest => b.started_at.cmp(&a.started_at),
            });
            workers
                .into_iter()
                .take(excess)
                .map(|w| (w.id.clone(), w.pid, Arc::clone(&w.cancelled)))
                .collect()
        };

        for (id, pid, cancelled) in victims {
            info!(worker = %id, "shrink: stopping worker");
            cancelled.store(true, Ordering::SeqCst);
            terminate_group(pid, false);
        }
    }

    /// Cancel every worker and wait for the pool to drain. Workers
    /// still alive at the deadline have their process groups killed at
    /// the OS level; the call returns once the pool is empty.
    pub async fn shutdown(&self, deadline: Duration) {
        let workers: Vec<(i32, Arc<AtomicBool>)> = {
            let state = self.state.lock().unwrap();
            state
                .workers
                .values()
                .map(|w| (w.pid, Arc::clone(&w.cancelled)))
                .collect()
        };

        for (pid, cancelled) in &workers {
            cancelled.store(true, Ordering::SeqCst);
            terminate_group(*pid, false);
        }

        let started = tokio::time::Instant::now();
        let mut forced = false;
        loop {
            let remaining: Vec<i32> = {
                let state = self.state.lock().unwrap();
                state.workers.values().map(|w| w.pid).collect()
            };
            if remaining.is_empty() {
                break;
            }
            if !forced && started.elapsed() >= deadline {
                warn!(
                    remaining = remaining.len(),
                    "shutdown deadline reached, force-killing workers"
                );
                for pid in remaining {
                    terminate_group(pid, true);
                }
                forced = true;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

/// Signal a worker's whole process group.
#[cfg(unix)]
fn terminate_group(pid: i32, force: bool) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let signal = if force { Signal::SIGKILL } else { Signal::SIGTERM };
    if let Err(e) = killpg(Pid::from_raw(pid), signal) {
        warn!(pid, %e, "failed to signal process group");
    }
}

#[cfg(not(unix))]
fn terminate_group(pid: i32, _force: bool) {
    warn!(pid, "process-group termination not supported on this platform");
}

/// Encode a path as a stable URL-safe task id.
pub fn task_id(path: &str) -> String {
    URL_SAFE.encode(path.as_bytes())
}

/// Decode a task id back to the original path.
pub fn path_from_task_id(id: &str) -> Result<String, PoolError> {
    let bytes = URL_SAFE
        .decode(id)
        .map_err(|e| PoolError::InvalidTaskId(e.to_string()))?;
    String::from_utf8(bytes).map_err(|e| PoolError::InvalidTaskId(e.to_string()))
}
