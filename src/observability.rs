use std::net::SocketAddr;
use std::time::Instant;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total engine operations executed. Labels: op, status.
pub const OPERATIONS_TOTAL: &str = "quarters_operations_total";

/// Histogram: operation latency in seconds. Labels: op.
pub const OPERATION_DURATION_SECONDS: &str = "quarters_operation_duration_seconds";

// ── USE metrics (resource state) ────────────────────────────────

/// Gauge: occupied beds across all rooms.
pub const BEDS_OCCUPIED: &str = "quarters_beds_occupied";

/// Gauge: current waitlist depth.
pub const WAITLIST_DEPTH: &str = "quarters_waitlist_depth";

/// Counter: multi-record sequences that were rolled back.
pub const ROLLBACKS_TOTAL: &str = "quarters_rollbacks_total";

/// Counter: compensation failures leaving state for manual reconciliation.
pub const INCONSISTENCIES_TOTAL: &str = "quarters_inconsistencies_total";

/// Counter: best-effort side effects (payment, notification) that failed.
pub const SIDE_EFFECT_FAILURES_TOTAL: &str = "quarters_side_effect_failures_total";

/// Gauge: number of active hostels (loaded engines).
pub const HOSTELS_ACTIVE: &str = "quarters_hostels_active";

/// Histogram: journal group-commit flush duration in seconds.
pub const JOURNAL_FLUSH_DURATION_SECONDS: &str = "quarters_journal_flush_duration_seconds";

/// Histogram: journal group-commit batch size (events per flush).
pub const JOURNAL_FLUSH_BATCH_SIZE: &str = "quarters_journal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}

/// Record one public operation's outcome and latency.
pub(crate) fn record_operation(op: &'static str, started: Instant, ok: bool) {
    let status = if ok { "ok" } else { "error" };
    metrics::counter!(OPERATIONS_TOTAL, "op" => op, "status" => status).increment(1);
    metrics::histogram!(OPERATION_DURATION_SECONDS, "op" => op)
        .record(started.elapsed().as_secs_f64());
}
