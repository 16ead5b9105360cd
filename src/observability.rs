use std::net::SocketAddr;

use metrics_exporter_prometheus::BuildError;

// ── Allocation ─────────────────────────────────────────────────

/// Counter: bookings committed. Labels: kind (single, recurring_row, lesson).
pub const ROWS_CREATED_TOTAL: &str = "courtside_rows_created_total";

/// Counter: requests rejected by the pre-insert conflict check.
pub const SLOT_CONFLICTS_TOTAL: &str = "courtside_slot_conflicts_total";

/// Counter: requests rejected by the storage uniqueness constraint.
pub const STORAGE_CONFLICTS_TOTAL: &str = "courtside_storage_conflicts_total";

/// Histogram: allocation latency in seconds. Labels: kind.
pub const ALLOCATION_DURATION_SECONDS: &str = "courtside_allocation_duration_seconds";

// ── Expiration sweep ───────────────────────────────────────────

/// Counter: completed sweeps.
pub const SWEEP_RUNS_TOTAL: &str = "courtside_sweep_runs_total";

/// Counter: bookings moved to expired.
pub const SWEEP_EXPIRED_TOTAL: &str = "courtside_sweep_expired_total";

/// Counter: expiration warnings delivered.
pub const SWEEP_WARNINGS_TOTAL: &str = "courtside_sweep_warnings_total";

/// Counter: per-booking sweep failures.
pub const SWEEP_ERRORS_TOTAL: &str = "courtside_sweep_errors_total";

/// Histogram: sweep duration in seconds.
pub const SWEEP_DURATION_SECONDS: &str = "courtside_sweep_duration_seconds";

// ── Support ────────────────────────────────────────────────────

/// Counter: job codes issued.
pub const JOB_CODES_TOTAL: &str = "courtside_job_codes_total";

/// Counter: retried transient failures.
pub const RETRIES_TOTAL: &str = "courtside_retries_total";

/// Counter: outbound emails. Labels: outcome (sent, skipped, failed).
pub const EMAILS_TOTAL: &str = "courtside_emails_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "courtside_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "courtside_wal_flush_batch_size";

/// Install the Prometheus exporter on `port`. No-op if `port` is None.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}
