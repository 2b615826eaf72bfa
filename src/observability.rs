use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "podium_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "podium_query_duration_seconds";

/// Counter: reservations confirmed.
pub const RESERVATIONS_CONFIRMED_TOTAL: &str = "podium_reservations_confirmed_total";

/// Counter: reservations denied for lack of capacity.
pub const RESERVATIONS_DENIED_TOTAL: &str = "podium_reservations_denied_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: slots used. Labels: date.
pub const SLOTS_USED: &str = "podium_slots_used";

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "podium_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "podium_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "podium_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "podium_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "podium_wal_flush_batch_size";

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

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::Reserve { .. } => "reserve",
        Command::SelectSlotUsage { .. } => "select_slot_usage",
        Command::SelectBookings { .. } => "select_bookings",
        Command::HasBooking { .. } => "has_booking",
    }
}
