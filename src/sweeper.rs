use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::engine::{Engine, SweepOptions};
use crate::store::MemoryStore;

/// Background task that runs the expiration sweep every `period` until
/// `cancel` fires. A failed sweep is logged and retried on the next tick.
pub async fn run_sweeper(engine: Arc<Engine>, period: Duration, send_emails: bool, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = interval.tick() => {
                let options = SweepOptions { send_emails, booking_ids: None };
                match engine.check_and_expire_bookings(options).await {
                    Ok(report) if !report.errors.is_empty() => {
                        for failure in &report.errors {
                            debug!(booking = %failure.booking_id, "{}", failure.message);
                        }
                    }
                    Ok(_) => {}
                    Err(e) => error!("expiration sweep failed: {e}"),
                }
            }
        }
    }
    info!("sweeper stopped");
}

/// Background task that compacts the WAL once `threshold` appends have
/// accumulated since the last compaction. Checks every `period`.
pub async fn run_compactor(store: Arc<MemoryStore>, threshold: u64, period: Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(period);
    interval.tick().await;
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = interval.tick() => {
                let appends = store.wal_appends_since_compact().await;
                if appends < threshold {
                    continue;
                }
                match store.compact().await {
                    Ok(()) => info!(appends, "WAL compacted"),
                    Err(e) => error!("WAL compaction failed: {e}"),
                }
            }
        }
    }
    info!("compactor stopped");
}
