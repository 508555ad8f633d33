//! The scan-filter-dispatch driver.
//!
//! A periodic ticker composes the scanner, the store and the pool;
//! the completion handler wired into the pool updates the ledger and
//! optionally deletes the input file.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{Config, PipelineConfig};
use crate::events::EventBus;
use crate::pool::{CompletionHandler, JobError, Pool};
use crate::scanner::{scan_all, Candidate};
use crate::store::TargetStore;

const DELETE_ATTEMPTS: u32 = 4;
const DELETE_BASE_DELAY: Duration = Duration::from_millis(250);

/// Runs the scan-dispatch loop.
pub struct Daemon {
    config: Arc<Config>,
    store: Arc<dyn TargetStore>,
    pool: Arc<Pool>,
    events: EventBus,
    shutdown_tx: broadcast::Sender<()>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Daemon {
    /// Create a Daemon. It does not start the loop.
    pub fn new(
        config: Arc<Config>,
        store: Arc<dyn TargetStore>,
        pool: Arc<Pool>,
        events: EventBus,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            store,
            pool,
            events,
            shutdown_tx,
            handle: Mutex::new(None),
        }
    }

    /// Spawn the ticker loop. The first tick runs immediately.
    pub async fn start(self: &Arc<Self>) {
        let mut handle = self.handle.lock().await;
        if handle.is_some() {
            warn!("daemon already running");
            return;
        }

        let daemon = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let interval = self.config.scan_interval.as_duration();

        *handle = Some(tokio::spawn(async move {
            info!("scan loop started");
            daemon.run_once().await;
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("scan loop received shutdown signal");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        daemon.run_once().await;
                    }
                }
            }
            info!("scan loop stopped");
        }));
    }

    /// Signal the loop to exit and wait for it to return. Does not
    /// shut the pool down; the caller orchestrates overall shutdown.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(());
        if let Some(handle) = self.handle.lock().await.take() {
            if let Err(e) = handle.await {
                error!("scan loop join error: {e}");
            }
        }
    }

    /// One scan, filter and dispatch cycle.
    pub async fn run_once(&self) {
        let candidates = scan_all(&self.config.pipelines);
        debug!(count = candidates.len(), "scan finished");

        let mut fresh: Vec<Candidate> = Vec::new();
        for candidate in candidates {
            let path = candidate.path.to_string_lossy().into_owned();
            match self.store.get_by_path(&path) {
                Ok(None) => {
                    if let Err(e) = self.store.upsert_queued(&path, &candidate.pipeline_name) {
                        error!(path = %path, %e, "enqueue failed");
                        continue;
                    }
                    self.events.task_queued(&path, &candidate.pipeline_name);
                    fresh.push(candidate);
                }
                Ok(Some(file)) if file.status.is_requeueable() => fresh.push(candidate),
                Ok(Some(_)) => {} // in_flight, paused or completed
                Err(e) => {
                    error!(path = %path, %e, "lookup failed");
                }
            }
        }

        if fresh.is_empty() {
            return;
        }
        info!(count = fresh.len(), "dispatching candidates");
        for failure in self.pool.dispatch(&fresh) {
            let message = failure.error.to_string();
            if let Err(e) = self.store.mark_errored(&failure.path, &message) {
                error!(path = %failure.path, %e, "mark errored failed");
                continue;
            }
            self.events
                .task_errored(&failure.path, &failure.pipeline, &message);
        }
    }
}

/// The completion side of the daemon: records the outcome in the
/// ledger and deletes the input when the pipeline asks for it.
pub struct Completion {
    store: Arc<dyn TargetStore>,
    pipelines: HashMap<String, PipelineConfig>,
    events: EventBus,
}

impl Completion {
    pub fn new(
        store: Arc<dyn TargetStore>,
        pipelines: &[PipelineConfig],
        events: EventBus,
    ) -> Self {
        Self {
            store,
            pipelines: pipelines
                .iter()
                .map(|p| (p.name.clone(), p.clone()))
                .collect(),
            events,
        }
    }
}

#[async_trait]
impl CompletionHandler for Completion {
    async fn on_complete(&self, path: &str, pipeline: &str, error: Option<JobError>) {
        match error {
            Some(err) => {
                let message = err.to_string();
                if let Err(e) = self.store.mark_errored(path, &message) {
                    error!(path, %e, "mark errored failed");
                }
                self.events.task_errored(path, pipeline, &message);
            }
            None => {
                if let Err(e) = self.store.mark_completed(path) {
                    error!(path, %e, "mark completed failed");
                }
                self.events.task_completed(path, pipeline);

                let delete = self
                    .pipelines
                    .get(pipeline)
                    .map(|p| p.delete_on_success)
                    .unwrap_or(false);
                if delete {
                    if let Err(e) =
                        remove_file_with_retry(Path::new(path), DELETE_ATTEMPTS, DELETE_BASE_DELAY)
                            .await
                    {
                        warn!(path, %e, "failed to delete input");
                    }
                }
            }
        }
    }
}

/// Remove `path`, retrying transient permission/busy failures with a
/// linearly growing delay. The converter's own descriptor may not
/// have closed at the moment of exit.
pub async fn remove_file_with_retry(
    path: &Path,
    attempts: u32,
    base_delay: Duration,
) -> std::io::Result<()> {
    let attempts = attempts.max(1);
    let base_delay = if base_delay.is_zero() {
        Duration::from_millis(100)
    } else {
        base_delay
    };

    let _ = make_removable(path).await;
    let mut last_err = None;
    for attempt in 1..=attempts {
        match tokio::fs::remove_file(path).await {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) if is_transient(&e) => {
                let _ = make_removable(path).await;
                tokio::time::sleep(base_delay * attempt).await;
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err.expect("retry loop ran at least once"))
}

async fn make_removable(path: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o666)).await
    }
    #[cfg(not(unix))]
    {
        let _ = path;
        Ok(())
    }
}

fn is_transient(e: &std::io::Error) -> bool {
    if e.kind() == ErrorKind::PermissionDenied {
        return true;
    }
    #[cfg(unix)]
    {
        use nix::errno::Errno;
        matches!(
            e.raw_os_error(),
            Some(code) if code == Errno::EBUSY as i32 || code == Errno::ETXTBSY as i32
        )
    }
    #[cfg(not(unix))]
    {
        false
    }
}
