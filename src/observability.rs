use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "slotkeeper_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "slotkeeper_query_duration_seconds";

/// Counter: reserve attempts. Labels: outcome.
pub const RESERVATIONS_TOTAL: &str = "slotkeeper_reservations_total";

/// Histogram: reserve latency in seconds, lock wait included.
pub const RESERVE_DURATION_SECONDS: &str = "slotkeeper_reserve_duration_seconds";

/// Counter: availability resolutions. Labels: outcome.
pub const RESOLVE_TOTAL: &str = "slotkeeper_resolve_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "slotkeeper_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "slotkeeper_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "slotkeeper_connections_rejected_total";

/// Histogram: time spent queued on a window lock in the in-memory store.
pub const WINDOW_LOCK_WAIT_SECONDS: &str = "slotkeeper_window_lock_wait_seconds";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotkeeper_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotkeeper_wal_flush_batch_size";

/// Counter: WAL compactions. Labels: status.
pub const COMPACTIONS_TOTAL: &str = "slotkeeper_compactions_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertResource { .. } => "insert_resource",
        Command::SetBookable { .. } => "set_bookable",
        Command::InsertWindow { .. } => "insert_window",
        Command::DeleteWindow { .. } => "delete_window",
        Command::InsertReservation { .. } => "insert_reservation",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectResources => "select_resources",
        Command::SelectWindows { .. } => "select_windows",
        Command::SelectReservations { .. } => "select_reservations",
    }
}
