//! Prometheus metrics for observability.

use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};

use crate::state::AppState;

/// Global metrics registry.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let registry = Registry::new();
    register_metrics(&registry);
    registry
});

/// Active WebSocket connections.
pub static WS_CONNECTIONS_ACTIVE: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "refinery_ws_connections_active",
        "Number of active WebSocket connections",
    )
    .unwrap()
});

/// Total WebSocket connections (cumulative).
pub static WS_CONNECTIONS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "refinery_ws_connections_total",
        "Total WebSocket connections since startup",
    )
    .unwrap()
});

/// Event messages forwarded to WebSocket clients.
pub static WS_MESSAGES_SENT: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "refinery_ws_messages_sent_total",
        "WebSocket messages sent",
    )
    .unwrap()
});

/// WebSocket lag events (when a client falls behind the event bus).
pub static WS_LAG_EVENTS: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "refinery_ws_lag_events_total",
        "WebSocket lag events (client fell behind)",
    )
    .unwrap()
});

/// Configured pool capacity (collected dynamically).
pub static POOL_SIZE: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("refinery_pool_size", "Configured worker pool capacity").unwrap()
});

/// Running converter subprocesses (collected dynamically).
pub static POOL_ACTIVE: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("refinery_pool_active", "Number of running workers").unwrap()
});

/// Task counts per pipeline and status (collected dynamically).
pub static TASKS_BY_STATUS: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("refinery_tasks_by_status", "Task counts by pipeline and status"),
        &["pipeline", "status"],
    )
    .unwrap()
});

fn register_metrics(registry: &Registry) {
    registry
        .register(Box::new(WS_CONNECTIONS_ACTIVE.clone()))
        .unwrap();
    registry
        .register(Box::new(WS_CONNECTIONS_TOTAL.clone()))
        .unwrap();
    registry
        .register(Box::new(WS_MESSAGES_SENT.clone()))
        .unwrap();
    registry.register(Box::new(WS_LAG_EVENTS.clone())).unwrap();
    registry.register(Box::new(POOL_SIZE.clone())).unwrap();
    registry.register(Box::new(POOL_ACTIVE.clone())).unwrap();
    registry
        .register(Box::new(TASKS_BY_STATUS.clone()))
        .unwrap();
}

/// Refresh gauges from current application state; called on scrape.
pub fn collect_dynamic_metrics(state: &AppState) {
    POOL_SIZE.set(state.pool().size() as i64);
    POOL_ACTIVE.set(state.pool().active_count() as i64);

    for pipeline in &state.config().pipelines {
        if let Ok(stats) = state.store().pipeline_stats(&pipeline.name) {
            let name = pipeline.name.as_str();
            TASKS_BY_STATUS
                .with_label_values(&[name, "queued"])
                .set(stats.queued);
            TASKS_BY_STATUS
                .with_label_values(&[name, "in_flight"])
                .set(stats.in_flight);
            TASKS_BY_STATUS
                .with_label_values(&[name, "completed"])
                .set(stats.completed);
            TASKS_BY_STATUS
                .with_label_values(&[name, "errored"])
                .set(stats.errored);
            TASKS_BY_STATUS
                .with_label_values(&[name, "paused"])
                .set(stats.paused);
        }
    }
}

/// Encode all metrics as Prometheus text format.
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}
