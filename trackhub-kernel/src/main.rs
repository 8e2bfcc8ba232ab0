/**
 * TRACKHUB KERNEL - Point d'entrée
 *
 * RÔLE : Bootstrap config + logging, démarre la boucle de dispatch et le
 * reporting périodique, arrêt propre sur Ctrl-C.
 */

use anyhow::{Context, Result};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use trackhub_kernel::config::load_config;
use trackhub_kernel::{Dispatcher, HealthTracker, Listener, PositionStore};

#[tokio::main]
async fn main() -> Result<()> {
    // .env optionnel
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("trackhub_kernel=info")),
        )
        .init();

    let cfg = load_config().await;
    info!(broker = %cfg.mqtt.broker_address(), client_id = %cfg.mqtt.client_id, "trackhub kernel starting");

    let store = PositionStore::new();
    let health = HealthTracker::new();
    let reporter = health.spawn_status_reporter(Duration::from_secs(cfg.status.interval_secs.max(1)), store.clone());

    let (stop, stop_rx) = watch::channel(false);
    let dispatcher = Dispatcher::new(Listener::new(), cfg.mqtt.clone(), store.clone(), health.clone());
    let mut pipeline = tokio::spawn(dispatcher.run(stop_rx));

    let outcome = tokio::select! {
        res = &mut pipeline => res,
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                warn!(error = %e, "ctrl-c handler failed, shutting down");
            }
            info!("shutdown requested");
            // le receiver peut déjà être parti si le pipeline s'est arrêté
            let _ = stop.send(true);
            pipeline.await
        }
    };
    reporter.abort();

    outcome
        .context("dispatch task panicked")?
        .with_context(|| format!("ingestion pipeline failed on {}", cfg.mqtt.broker_address()))?;

    info!(positions = store.len(), "trackhub kernel stopped");
    Ok(())
}
