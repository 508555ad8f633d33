//! Coordination engine for the refinery media-conversion daemon.
//!
//! Three interacting state machines: the periodic scanner turns a
//! filesystem view plus pipeline rules into a prioritized candidate
//! queue; the durable ledger records every file's lifecycle and
//! arbitrates re-dispatch; the bounded worker pool owns the converter
//! subprocesses. The daemon composes them on a ticker.

pub mod config;
pub mod daemon;
pub mod events;
pub mod executor;
pub mod pool;
pub mod scanner;
pub mod store;

pub use config::{
    load_config, load_config_from_str, validate_config, Config, ConfigError, Direction,
    HumanDuration, KillOrder, PipelineConfig, PoolConfig, TargetConfig,
};
pub use daemon::{remove_file_with_retry, Completion, Daemon};
pub use events::{EventBus, TaskEvent};
pub use executor::{merge_extra, render_command, render_target_path, ExecutorError, FileVars};
pub use pool::{
    path_from_task_id, task_id, CompletionHandler, DispatchFailure, JobError, Pool, PoolError,
    WorkerStatus,
};
pub use scanner::{scan_all, Candidate};
pub use store::{
    PipelineStats, SqliteStore, StoreError, TargetFile, TargetStore, TaskFilter, TaskStatus,
    RECOVERY_MESSAGE,
};
