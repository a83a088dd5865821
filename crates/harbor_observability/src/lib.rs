//! Observability setup: structured logging, Prometheus metrics, and the
//! metric recording helpers used by the monitor and the orchestrator.

use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber with structured logging.
pub fn init_tracing() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,harbor=debug"));

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

/// Initialize the Prometheus metrics exporter on `listen_addr`.
pub fn init_metrics(listen_addr: &str) -> Result<(), Box<dyn std::error::Error>> {
    let addr: std::net::SocketAddr = listen_addr.parse()?;
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("Prometheus metrics endpoint on http://{}/metrics", addr);
    Ok(())
}

// ---------------------------------------------------------------------------
// Replication lag monitor
// ---------------------------------------------------------------------------

/// Record a standby's delay behind the primary, in WAL bytes.
pub fn record_standby_delay(node_id: usize, delay_bytes: u64) {
    metrics::gauge!("harbor_standby_delay_bytes", "node" => node_id.to_string())
        .set(delay_bytes as f64);
}

/// Record the end of one monitor cycle.
pub fn record_monitor_cycle(success: bool) {
    metrics::counter!("harbor_sr_check_cycles_total", "success" => success.to_string())
        .increment(1);
}

/// Record a soft per-node probe failure (`kind` = missing_connection, query_failed, ...).
pub fn record_probe_failure(node_id: usize, kind: &'static str) {
    metrics::counter!(
        "harbor_sr_check_probe_failures_total",
        "node" => node_id.to_string(),
        "kind" => kind
    )
    .increment(1);
}

/// Record a degeneration request issued for an inconsistent node.
pub fn record_degeneration_request(node_id: usize, accepted: bool) {
    metrics::counter!(
        "harbor_degeneration_requests_total",
        "node" => node_id.to_string(),
        "accepted" => accepted.to_string()
    )
    .increment(1);
}

// ---------------------------------------------------------------------------
// Online recovery
// ---------------------------------------------------------------------------

/// Record the outcome of one recovery attempt (`outcome` = "ok" or an error label).
pub fn record_recovery_outcome(node_id: usize, outcome: &'static str, duration_ms: u64) {
    metrics::counter!(
        "harbor_recovery_attempts_total",
        "node" => node_id.to_string(),
        "outcome" => outcome
    )
    .increment(1);
    metrics::histogram!("harbor_recovery_duration_ms", "outcome" => outcome)
        .record(duration_ms as f64);
}

pub fn record_recovery_in_progress(in_progress: bool) {
    metrics::gauge!("harbor_recovery_in_progress").set(if in_progress { 1.0 } else { 0.0 });
}
