use std::net::SocketAddr;

use crate::protocol::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: protocol requests handled. Labels: op, status.
pub const REQUESTS_TOTAL: &str = "courtside_requests_total";

/// Histogram: protocol request latency in seconds. Labels: op.
pub const REQUEST_DURATION_SECONDS: &str = "courtside_request_duration_seconds";

/// Counter: booking attempts. Labels: outcome (`ok` or an error code).
pub const BOOKINGS_TOTAL: &str = "courtside_bookings_total";

/// Histogram: end-to-end `request_booking` latency in seconds.
pub const BOOKING_DURATION_SECONDS: &str = "courtside_booking_duration_seconds";

/// Counter: cancellation attempts. Labels: outcome.
pub const CANCELLATIONS_TOTAL: &str = "courtside_cancellations_total";

/// Counter: store calls re-issued after a transient failure. Labels: op.
pub const STORE_RETRIES_TOTAL: &str = "courtside_store_retries_total";

/// Counter: confirmations the sink failed to deliver (or timed out on).
pub const NOTIFICATIONS_FAILED_TOTAL: &str = "courtside_notifications_failed_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "courtside_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "courtside_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "courtside_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "courtside_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "courtside_wal_flush_batch_size";

/// Counter: WAL compactions run by the background compactor.
pub const WAL_COMPACTIONS_TOTAL: &str = "courtside_wal_compactions_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
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
        Command::Book { .. } => "book",
        Command::Cancel { .. } => "cancel",
        Command::Slots { .. } => "slots",
        Command::Week { .. } => "week",
        Command::Games => "games",
        Command::MyBookings => "my_bookings",
        Command::AllBookings => "all_bookings",
        Command::Users => "users",
        Command::DeleteUser { .. } => "delete_user",
        Command::Stats => "stats",
    }
}
