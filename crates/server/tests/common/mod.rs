//! In-process test fixture: the real router over an in-memory store
//! and a real pool, no network.

use std::path::PathBuf;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;

use refinery_core::{
    load_config, Completion, CompletionHandler, EventBus, Pool, SqliteStore, TargetStore,
};
use refinery_server::api::create_router;
use refinery_server::state::AppState;

const TEST_CONFIG: &str = r#"
listen_addr = "127.0.0.1:0"
scan_interval = "1h"

[pool]
size = 2
shrink_grace = "1s"

[[pipelines]]
name = "ts2mp4"
priority = 0
paths = ["/in/**/*.ts"]
command = "true"
[pipelines.target]
format = "{{.File.Dir}}/{{.File.Basename}}.mp4"
[pipelines.extra]
preset = "slow"

[[pipelines]]
name = "flacify"
priority = 1
paths = ["/music/**/*.wav"]
command = "true"
[pipelines.target]
format = "{{.File.Dir}}/{{.File.Basename}}.flac"
"#;

pub struct TestFixture {
    pub router: Router,
    pub store: Arc<SqliteStore>,
    pub pool: Arc<Pool>,
    pub config_path: PathBuf,
    pub temp_dir: TempDir,
}

#[derive(Debug)]
pub struct TestResponse {
    pub status: StatusCode,
    pub body: Value,
}

impl TestFixture {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let config_path = temp_dir.path().join("refinery.toml");
        std::fs::write(&config_path, TEST_CONFIG).expect("Failed to write config");

        let config = load_config(&config_path).expect("Failed to load config");

        let store = Arc::new(SqliteStore::in_memory().expect("Failed to create store"));
        let events = EventBus::default();
        let completion: Arc<dyn CompletionHandler> = Arc::new(Completion::new(
            Arc::clone(&store) as Arc<dyn TargetStore>,
            &config.pipelines,
            events.clone(),
        ));
        let pool = Arc::new(Pool::new(
            &config.pool,
            Arc::clone(&store) as Arc<dyn TargetStore>,
            &config.pipelines,
            completion,
            events.clone(),
        ));

        let state = Arc::new(AppState::new(
            config,
            config_path.clone(),
            Arc::clone(&store) as Arc<dyn TargetStore>,
            Arc::clone(&pool),
            events,
            Vec::new(),
        ));

        Self {
            router: create_router(state),
            store,
            pool,
            config_path,
            temp_dir,
        }
    }

    pub async fn get(&self, path: &str) -> TestResponse {
        self.request("GET", path, None).await
    }

    /// GET returning the raw body, for non-JSON endpoints.
    pub async fn get_text(&self, path: &str) -> (StatusCode, String) {
        let response = self
            .router
            .clone()
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri(path)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .expect("Failed to send request");

        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("Failed to collect body")
            .to_bytes();
        (status, String::from_utf8_lossy(&bytes).into_owned())
    }

    pub async fn post(&self, path: &str, body: Option<Value>) -> TestResponse {
        self.request("POST", path, body).await
    }

    pub async fn patch(&self, path: &str, body: Value) -> TestResponse {
        self.request("PATCH", path, Some(body)).await
    }

    async fn request(&self, method: &str, path: &str, body: Option<Value>) -> TestResponse {
        let mut builder = Request::builder().method(method).uri(path);

        let body = if let Some(json) = body {
            builder = builder.header("Content-Type", "application/json");
            Body::from(serde_json::to_vec(&json).unwrap())
        } else {
            Body::empty()
        };

        let response = self
            .router
            .clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .expect("Failed to send request");

        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("Failed to collect body")
            .to_bytes();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };

        TestResponse { status, body }
    }
}
