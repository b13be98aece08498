use std::sync::Arc;

use tracing::info;

use rigbook::clock::SystemClock;
use rigbook::config::Config;
use rigbook::damage::ConditionThreshold;
use rigbook::engine::{Collaborators, Engine};
use rigbook::ledger::InMemoryLedger;
use rigbook::notify::NotifyHub;
use rigbook::sweep;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    rigbook::observability::init(config.metrics_port)?;

    // Ensure data directory exists
    std::fs::create_dir_all(&config.data_dir)?;

    let collaborators = Collaborators {
        clock: Arc::new(SystemClock),
        ledger: Arc::new(InMemoryLedger::new()),
        pricing: config.pricing.clone(),
        assessor: Arc::new(ConditionThreshold::default()),
    };
    let notify = Arc::new(NotifyHub::new());
    let engine = Arc::new(Engine::new(config.wal_path(), notify, collaborators)?);

    info!("rigbook started");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  resources: {}", engine.state.len());
    info!(
        "  pricing: {} cents/hour, {} minute blocks",
        config.pricing.hourly_rate_cents, config.pricing.block_minutes
    );
    info!("  sweep every {}s", config.sweep_interval.as_secs());
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    let sweeper = tokio::spawn(sweep::run_sweep(engine.clone(), config.sweep_interval));
    let compactor = tokio::spawn(sweep::run_compactor(
        engine.clone(),
        config.compact_threshold,
    ));

    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = ctrl_c => {}
                        _ = sigterm.recv() => {}
                    }
                }
                Err(e) => {
                    tracing::warn!("no SIGTERM handler: {e}");
                    ctrl_c.await.ok();
                }
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
        }
    };
    shutdown.await;

    info!("shutdown signal received");
    sweeper.abort();
    compactor.abort();
    info!("rigbook stopped");
    Ok(())
}
