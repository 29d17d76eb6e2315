use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "fleetbook_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "fleetbook_query_duration_seconds";

/// Counter: booking attempts. Labels: outcome (`committed` or the error kind).
pub const BOOKINGS_TOTAL: &str = "fleetbook_bookings_total";

/// Histogram: end-to-end booking latency in seconds, validation to release.
pub const BOOKING_DURATION_SECONDS: &str = "fleetbook_booking_duration_seconds";

/// Counter: reservations taken out of ACTIVE. Labels: status.
pub const RESERVATIONS_CLOSED_TOTAL: &str = "fleetbook_reservations_closed_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "fleetbook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "fleetbook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "fleetbook_connections_rejected_total";

/// Histogram: time spent waiting for a resource's write lock, in seconds.
pub const LOCK_WAIT_SECONDS: &str = "fleetbook_lock_wait_seconds";

/// Counter: row lock waits that hit the timeout.
pub const LOCK_TIMEOUTS_TOTAL: &str = "fleetbook_lock_timeouts_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "fleetbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "fleetbook_wal_flush_batch_size";

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
        Command::UpdateResourceStatus { .. } => "update_resource_status",
        Command::InsertRequester { .. } => "insert_requester",
        Command::InsertReservation { .. } => "insert_reservation",
        Command::CancelReservation { .. } => "cancel_reservation",
        Command::CompleteReservation { .. } => "complete_reservation",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectAvailableResources { .. } => "select_available_resources",
        Command::SelectResources => "select_resources",
        Command::SelectReservation { .. } => "select_reservation",
        Command::SelectReservationsByRequester { .. } => "select_reservations_by_requester",
        Command::SelectReservationsByResource { .. } => "select_reservations_by_resource",
        Command::Listen { .. } => "listen",
        Command::Unlisten { .. } => "unlisten",
        Command::UnlistenAll => "unlisten_all",
    }
}
