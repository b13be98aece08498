use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

// ── Booking flow ────────────────────────────────────────────────

/// Counter: bookings recorded.
pub const BOOKINGS_CREATED_TOTAL: &str = "rigbook_bookings_created_total";

/// Counter: booking requests refused. Labels: reason.
pub const BOOKING_REJECTIONS_TOTAL: &str = "rigbook_booking_rejections_total";

/// Counter: lifecycle transitions applied. Labels: to.
pub const TRANSITIONS_TOTAL: &str = "rigbook_transitions_total";

/// Counter: free-hour blocks consumed by bookings.
pub const CREDIT_BLOCKS_DEDUCTED_TOTAL: &str = "rigbook_credit_blocks_deducted_total";

/// Gauge: resources known to the engine.
pub const RESOURCES_ACTIVE: &str = "rigbook_resources_active";

// ── Sweep ───────────────────────────────────────────────────────

/// Counter: bookings moved to overdue by the sweep.
pub const SWEEP_OVERDUE_MARKED_TOTAL: &str = "rigbook_sweep_overdue_marked_total";

/// Gauge: borrowed resources past their return date at the last sweep.
pub const SWEEP_NEEDING_RETURN: &str = "rigbook_sweep_needing_return";

/// Histogram: sweep pass duration in seconds.
pub const SWEEP_DURATION_SECONDS: &str = "rigbook_sweep_duration_seconds";

// ── Journal ─────────────────────────────────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "rigbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "rigbook_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}
