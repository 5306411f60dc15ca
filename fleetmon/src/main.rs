use std::sync::Arc;

use tracing::{error, info};

use fleetmon::cache::StatusCache;
use fleetmon::config::AppConfig;
use fleetmon::supervisor::{Supervisor, SupervisorConfig};
use fleetmon::{database, logging, panic_hook, probes};

#[tokio::main]
async fn main() -> fleetmon::Result<()> {
    dotenvy::dotenv().ok();

    let config = AppConfig::load()?;
    let _log_guard = logging::init_logging(&config.log_dir)?;
    panic_hook::install(&config.log_dir);

    let write_pool = database::init_write_pool(&config.database_url).await?;
    database::ensure_schema(&write_pool).await?;
    let read_pool = database::init_pool(&config.database_url).await?;

    let cache = Arc::new(StatusCache::new());
    let mut supervisor = Supervisor::new(cache.clone(), SupervisorConfig::default());
    for spec in probes::build_fleet(&config, &cache, read_pool, write_pool) {
        supervisor.spawn(spec)?;
    }

    let token = supervisor.cancellation_token();
    logging::start_retention_cleanup(&config.log_dir, token.clone());
    tokio::spawn({
        let token = token.clone();
        async move {
            if let Err(err) = wait_for_shutdown_signal().await {
                error!("signal listener failed: {err}");
            }
            info!("shutdown signal received");
            token.cancel();
        }
    });

    info!("fleetmon starting with {} sources", supervisor.len());
    let report = supervisor.run().await?;
    if report.all_graceful() {
        info!("all {} poll loops stopped cleanly", report.total);
    } else {
        error!("{} poll loops had to be aborted at shutdown", report.forced);
    }
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::select! {
        _ = sigint.recv() => {}
        _ = sigterm.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
