//! Observability setup: structured logging and Prometheus metrics.

use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber. `RUST_LOG` overrides the default
/// filter. Returns false when a subscriber was already installed.
pub fn init_tracing() -> bool {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,arbor=debug"));

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .is_ok()
}

/// Install the Prometheus recorder with an HTTP listener on `listen_addr`.
pub fn init_metrics(listen_addr: &str) -> Result<(), Box<dyn std::error::Error>> {
    let addr: std::net::SocketAddr = listen_addr.parse()?;
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!("Prometheus metrics endpoint on http://{}/metrics", addr);
    Ok(())
}

/// `outcome` is "committed" or the rollback reason code.
pub fn record_commit_metrics(outcome: &str, duration_us: u64) {
    metrics::counter!("arbor_commits_total", "outcome" => outcome.to_string()).increment(1);
    if outcome == "committed" {
        metrics::histogram!("arbor_commit_duration_us").record(duration_us as f64);
    }
}

pub fn record_lock_metrics(lock_type: &str, outcome: &str) {
    metrics::counter!(
        "arbor_lock_requests_total",
        "type" => lock_type.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

pub fn record_active_sessions(count: usize) {
    metrics::gauge!("arbor_active_sessions").set(count as f64);
}

pub fn record_query_metrics(outcome: &str, rows: u64) {
    metrics::counter!("arbor_queries_total", "outcome" => outcome.to_string()).increment(1);
    metrics::histogram!("arbor_query_rows").record(rows as f64);
}

/// A listener's buffer was full and an event was dropped for it.
pub fn record_notification_dropped() {
    metrics::counter!("arbor_notifications_dropped_total").increment(1);
}

/// Gauges mirroring the in-process lock table statistics.
pub fn record_lock_table(locked_keys: usize, timed_out: u64, waits: u64) {
    metrics::gauge!("arbor_locked_keys").set(locked_keys as f64);
    metrics::gauge!("arbor_lock_timeouts").set(timed_out as f64);
    metrics::gauge!("arbor_lock_waits").set(waits as f64);
}
