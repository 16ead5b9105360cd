use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;

use courtside::clock::SystemClock;
use courtside::config::Config;
use courtside::engine::{Engine, EngineSettings};
use courtside::mailer::{DisabledMailer, Mailer, SmtpMailer};
use courtside::model::CourtId;
use courtside::notify::NotifyHub;
use courtside::store::MemoryStore;
use courtside::sweeper;

const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    courtside::observability::init(config.metrics_port)?;

    // Ensure data directory exists
    std::fs::create_dir_all(&config.data_dir)?;

    let store = Arc::new(MemoryStore::open(config.wal_path(), Arc::new(NotifyHub::new()))?);
    let mailer: Arc<dyn Mailer> = match &config.smtp {
        Some(settings) => Arc::new(SmtpMailer::new(settings)?),
        None => Arc::new(DisabledMailer),
    };
    let settings = EngineSettings {
        tz: config.tz,
        rates: config.rates,
        counter_retry: config.counter_retry,
    };
    let engine = Arc::new(Engine::new(store.clone(), Arc::new(SystemClock), mailer, settings));

    for n in 1..=config.courts {
        engine.add_court(CourtId(n), &format!("Court {n}"), None).await?;
    }

    info!("courtside started");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  courts: {}", config.courts);
    info!("  sweep: every {}s, emails {}", config.sweep_interval.as_secs(), config.sweep_send_emails);
    info!("  smtp: {}", config.smtp.as_ref().map_or("disabled".to_string(), |s| format!("{}:{}", s.host, s.port)));
    info!("  metrics: {}", config.metrics_port.map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics")));

    let cancel = CancellationToken::new();
    let sweeper = tokio::spawn(sweeper::run_sweeper(
        engine.clone(),
        config.sweep_interval,
        config.sweep_send_emails,
        cancel.clone(),
    ));
    let compactor = tokio::spawn(sweeper::run_compactor(
        store,
        config.compact_threshold,
        COMPACT_CHECK_INTERVAL,
        cancel.clone(),
    ));

    // Graceful shutdown on SIGTERM/ctrl-c: stop the background tasks and let
    // them finish the sweep in flight.
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await?;
    }

    info!("shutdown signal received");
    cancel.cancel();
    let _ = tokio::join!(sweeper, compactor);

    info!("courtside stopped");
    Ok(())
}
