//! End-to-end daemon tests: scan, filter, dispatch and completion,
//! with real subprocesses and a temp-dir filesystem.

#![cfg(unix)]

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use refinery_core::{
    Completion, CompletionHandler, Config, Daemon, Direction, EventBus, HumanDuration,
    PipelineConfig, Pool, PoolConfig, SqliteStore, TargetConfig, TargetStore, TaskStatus,
};

struct TestHarness {
    daemon: Arc<Daemon>,
    store: Arc<SqliteStore>,
    pool: Arc<Pool>,
    _temp_dir: TempDir,
}

fn pipeline(name: &str, glob: &str, command: &str) -> PipelineConfig {
    PipelineConfig {
        name: name.to_string(),
        priority: 0,
        paths: vec![glob.to_string()],
        direction: Direction::Oldest,
        min_age: None,
        max_age: None,
        target: TargetConfig {
            regex: None,
            format: "{{.File.Dir}}/{{.File.Basename}}.mp4".to_string(),
        },
        command: command.to_string(),
        delete_on_success: false,
        extra: Default::default(),
    }
}

fn harness(temp_dir: TempDir, pipelines: Vec<PipelineConfig>) -> TestHarness {
    let config = Arc::new(Config {
        pool: PoolConfig {
            size: 4,
            shrink_grace: HumanDuration::from_secs(60),
            ..Default::default()
        },
        scan_interval: HumanDuration::from_secs(3600),
        pipelines,
        ..Default::default()
    });

    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let events = EventBus::default();
    let completion = Arc::new(Completion::new(
        Arc::clone(&store) as Arc<dyn TargetStore>,
        &config.pipelines,
        events.clone(),
    ));
    let pool = Arc::new(Pool::new(
        &config.pool,
        Arc::clone(&store) as Arc<dyn TargetStore>,
        &config.pipelines,
        completion as Arc<dyn CompletionHandler>,
        events.clone(),
    ));
    let daemon = Arc::new(Daemon::new(
        config,
        Arc::clone(&store) as Arc<dyn TargetStore>,
        Arc::clone(&pool),
        events,
    ));

    TestHarness {
        daemon,
        store,
        pool,
        _temp_dir: temp_dir,
    }
}

async fn wait_for_status(store: &SqliteStore, path: &Path, status: TaskStatus, timeout: Duration) {
    let path = path.to_string_lossy().into_owned();
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(file) = store.get_by_path(&path).unwrap() {
            if file.status == status {
                return;
            }
        }
        assert!(
            Instant::now() < deadline,
            "timed out waiting for {path} to reach {status}, currently {:?}",
            store.get_by_path(&path).unwrap().map(|f| f.status)
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_happy_path_converts_and_completes() {
    let temp_dir = TempDir::new().unwrap();
    let input = temp_dir.path().join("a.ts");
    fs::write(&input, b"payload").unwrap();

    let glob = format!("{}/**/*.ts", temp_dir.path().display());
    let h = harness(
        temp_dir,
        vec![pipeline("ts2mp4", &glob, "cp {{.Input}} {{.Output}}")],
    );

    h.daemon.run_once().await;
    wait_for_status(&h.store, &input, TaskStatus::Completed, Duration::from_secs(5)).await;

    let file = h
        .store
        .get_by_path(&input.to_string_lossy())
        .unwrap()
        .unwrap();
    assert_eq!(file.pipeline_name, "ts2mp4");
    assert!(file.completed_at.is_some());

    // the rendered argv really was ["cp", <input>, <output>]
    let output = input.with_extension("mp4");
    assert_eq!(fs::read(&output).unwrap(), b"payload");
    // input not deleted unless the pipeline opts in
    assert!(input.exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failure_marks_errored_and_retries_on_next_tick() {
    let temp_dir = TempDir::new().unwrap();
    let input = temp_dir.path().join("b.ts");
    fs::write(&input, b"payload").unwrap();

    let glob = format!("{}/*.ts", temp_dir.path().display());
    let h = harness(temp_dir, vec![pipeline("broken", &glob, "false")]);

    h.daemon.run_once().await;
    wait_for_status(&h.store, &input, TaskStatus::Errored, Duration::from_secs(5)).await;
    let file = h
        .store
        .get_by_path(&input.to_string_lossy())
        .unwrap()
        .unwrap();
    assert_eq!(file.error_count, 1);
    assert_eq!(file.error_message.as_deref(), Some("exit code 1"));

    // errored is requeueable: the next tick retries
    h.daemon.run_once().await;
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let file = h
            .store
            .get_by_path(&input.to_string_lossy())
            .unwrap()
            .unwrap();
        if file.error_count == 2 {
            assert_eq!(file.status, TaskStatus::Errored);
            break;
        }
        assert!(Instant::now() < deadline, "second attempt never happened");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_paused_task_is_not_dispatched_until_resumed() {
    let temp_dir = TempDir::new().unwrap();
    let input = temp_dir.path().join("c.ts");
    fs::write(&input, b"payload").unwrap();
    let input_str = input.to_string_lossy().into_owned();

    let glob = format!("{}/*.ts", temp_dir.path().display());
    let h = harness(temp_dir, vec![pipeline("ts2mp4", &glob, "true")]);

    h.store.upsert_queued(&input_str, "ts2mp4").unwrap();
    h.store.mark_paused(&input_str).unwrap();

    h.daemon.run_once().await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(h.pool.active_count(), 0);
    assert_eq!(
        h.store.get_by_path(&input_str).unwrap().unwrap().status,
        TaskStatus::Paused
    );

    h.store.mark_resumed(&input_str).unwrap();
    assert_eq!(
        h.store.get_by_path(&input_str).unwrap().unwrap().status,
        TaskStatus::Queued
    );

    h.daemon.run_once().await;
    wait_for_status(&h.store, &input, TaskStatus::Completed, Duration::from_secs(5)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_delete_on_success_removes_input() {
    let temp_dir = TempDir::new().unwrap();
    let input = temp_dir.path().join("d.ts");
    fs::write(&input, b"payload").unwrap();

    let glob = format!("{}/*.ts", temp_dir.path().display());
    let mut p = pipeline("ts2mp4", &glob, "true");
    p.delete_on_success = true;
    let h = harness(temp_dir, vec![p]);

    h.daemon.run_once().await;
    wait_for_status(&h.store, &input, TaskStatus::Completed, Duration::from_secs(5)).await;

    let deadline = Instant::now() + Duration::from_secs(5);
    while input.exists() {
        assert!(Instant::now() < deadline, "input was never deleted");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_in_flight_task_is_not_redispatched() {
    let temp_dir = TempDir::new().unwrap();
    let input = temp_dir.path().join("e.ts");
    fs::write(&input, b"payload").unwrap();
    let input_str = input.to_string_lossy().into_owned();

    let glob = format!("{}/*.ts", temp_dir.path().display());
    let h = harness(temp_dir, vec![pipeline("sleepy", &glob, "sleep 30")]);

    h.daemon.run_once().await;
    let deadline = Instant::now() + Duration::from_secs(5);
    while h.pool.active_count() != 1 {
        assert!(Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // a second tick re-discovers the file but must not double-run it
    h.daemon.run_once().await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(h.pool.active_count(), 1);
    assert_eq!(
        h.store.get_by_path(&input_str).unwrap().unwrap().status,
        TaskStatus::InFlight
    );

    h.pool.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_spawn_failure_ends_up_errored() {
    let temp_dir = TempDir::new().unwrap();
    let input = temp_dir.path().join("f.ts");
    fs::write(&input, b"payload").unwrap();

    let glob = format!("{}/*.ts", temp_dir.path().display());
    let h = harness(
        temp_dir,
        vec![pipeline("missing", &glob, "/no/such/binary {{.Input}}")],
    );

    h.daemon.run_once().await;
    // the daemon clears the in_flight left by the failed spawn
    wait_for_status(&h.store, &input, TaskStatus::Errored, Duration::from_secs(5)).await;
    let file = h
        .store
        .get_by_path(&input.to_string_lossy())
        .unwrap()
        .unwrap();
    assert_eq!(file.error_count, 1);
    assert!(file.error_message.unwrap().contains("spawn"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_render_failure_ends_up_errored() {
    let temp_dir = TempDir::new().unwrap();
    let input = temp_dir.path().join("g.ts");
    fs::write(&input, b"payload").unwrap();

    let glob = format!("{}/*.ts", temp_dir.path().display());
    let mut p = pipeline("regexy", &glob, "true");
    p.target.regex = Some(r"^(?P<show>[a-z]+)-s\d+\.ts$".to_string());
    p.target.format = "/out/{{.show}}.mp4".to_string();
    let h = harness(temp_dir, vec![p]);

    h.daemon.run_once().await;
    wait_for_status(&h.store, &input, TaskStatus::Errored, Duration::from_secs(5)).await;
    let file = h
        .store
        .get_by_path(&input.to_string_lossy())
        .unwrap()
        .unwrap();
    assert!(file
        .error_message
        .unwrap()
        .contains("target regex did not match"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_start_and_stop_loop() {
    let temp_dir = TempDir::new().unwrap();
    let input = temp_dir.path().join("h.ts");
    fs::write(&input, b"payload").unwrap();

    let glob = format!("{}/*.ts", temp_dir.path().display());
    let h = harness(temp_dir, vec![pipeline("ts2mp4", &glob, "true")]);

    // the loop's initial tick picks the file up without waiting for
    // the interval
    h.daemon.start().await;
    wait_for_status(&h.store, &input, TaskStatus::Completed, Duration::from_secs(5)).await;

    h.daemon.stop().await;
    h.pool.shutdown(Duration::from_secs(5)).await;
}
