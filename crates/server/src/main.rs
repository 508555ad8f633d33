use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use refinery_core::{
    load_config, validate_config, Completion, CompletionHandler, Daemon, EventBus, Pool,
    SqliteStore, TargetStore,
};
use refinery_server::api::{create_router, ws::parse_trusted_cidrs};
use refinery_server::state::AppState;

/// How long the pool gets to drain before workers are force-killed.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(5 * 60);

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("Fatal error: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Determine config path
    let config_path = std::env::var("REFINERY_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("refinery.toml"));

    info!("Loading configuration from {:?}", config_path);
    let config = load_config(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;
    validate_config(&config).context("Configuration validation failed")?;

    info!(
        pool_size = config.pool.size,
        scan_interval = %config.scan_interval,
        pipelines = config.pipelines.len(),
        "refinery starting"
    );

    let trusted_nets = parse_trusted_cidrs(&config.trusted_cidrs)
        .map_err(anyhow::Error::msg)
        .context("Failed to parse trusted_cidrs")?;

    // Open the ledger and recover rows a dead process left in flight,
    // before the first tick can observe them.
    let store: Arc<dyn TargetStore> = Arc::new(
        SqliteStore::new(&config.db_path)
            .with_context(|| format!("Failed to open database at {:?}", config.db_path))?,
    );
    let recovered = store
        .recover_in_flight()
        .context("Crash-recovery sweep failed")?;
    if recovered > 0 {
        info!(recovered, "recovered in-flight tasks from previous run");
    }

    let events = EventBus::default();
    let completion: Arc<dyn CompletionHandler> = Arc::new(Completion::new(
        Arc::clone(&store),
        &config.pipelines,
        events.clone(),
    ));
    let pool = Arc::new(Pool::new(
        &config.pool,
        Arc::clone(&store),
        &config.pipelines,
        completion,
        events.clone(),
    ));

    let config = Arc::new(config);
    let daemon = Arc::new(Daemon::new(
        Arc::clone(&config),
        Arc::clone(&store),
        Arc::clone(&pool),
        events.clone(),
    ));

    let state = Arc::new(AppState::new(
        (*config).clone(),
        config_path,
        store,
        Arc::clone(&pool),
        events,
        trusted_nets,
    ));
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.listen_addr))?;

    daemon.start().await;
    info!("listening on {}", config.listen_addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("Server error")?;

    // Shutdown order: stop discovering work, stop serving, then drain
    // the pool.
    info!("shutdown: stopping daemon");
    daemon.stop().await;
    info!("shutdown: draining pool");
    pool.shutdown(SHUTDOWN_DEADLINE).await;
    info!("shutdown complete");

    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown: received signal");
}
