//! Observability setup: structured logging and Prometheus metrics.

use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber with structured logging.
pub fn init_tracing() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,kestrel=debug"));

    let fmt_layer = fmt::layer().with_target(true);

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

/// Record one lease CAS attempt and whether it won.
pub fn record_election_attempt(won: bool) {
    metrics::counter!("kestrel_election_attempts_total", "won" => won.to_string()).increment(1);
}

/// Record one cluster-status write attempt: `applied` is false on a lost
/// CAS race.
pub fn record_status_write(applied: bool) {
    metrics::counter!("kestrel_status_writes_total", "applied" => applied.to_string())
        .increment(1);
}

/// Record the outcome of one reconcile cycle.
pub fn record_reconcile_cycle(ok: bool) {
    metrics::counter!("kestrel_reconcile_cycles_total", "ok" => ok.to_string()).increment(1);
}

/// Record a triggered failover.
pub fn record_failover_triggered() {
    metrics::counter!("kestrel_failovers_total").increment(1);
}

/// Record a replica catch-up wait that hit its (soft) timeout.
pub fn record_catchup_timeout() {
    metrics::counter!("kestrel_failover_catchup_timeouts_total").increment(1);
}

/// Record a wakeup packet sent to a peer.
pub fn record_wakeup_sent() {
    metrics::counter!("kestrel_wakeups_sent_total").increment(1);
}

/// Record a wakeup packet accepted from a peer.
pub fn record_wakeup_received() {
    metrics::counter!("kestrel_wakeups_received_total").increment(1);
}
