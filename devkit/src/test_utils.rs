/*!
Test Harness pour le pipeline d'ingestion

Monte le vrai `Dispatcher` du kernel sur un `MockBroker`:
- injection de messages OwnTracks sans broker
- attente sur les compteurs du pipeline plutôt que sur des sleeps fixes
- arrêt propre et assertions sur le store
*/

use crate::mqtt_stub::MockBroker;
use crate::owntracks::{topic, OwnTracksMessageBuilder};
use anyhow::Result;
use serde_json::Value;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use trackhub_kernel::config::ConnectionConfig;
use trackhub_kernel::{
    ConnectionError, Dispatcher, HealthTracker, KernelHealth, LocationUpdate, PipelineState, PositionKey,
    PositionStore,
};

const DEFAULT_WAIT_MS: u64 = 2_000;

/// Harness de test complet: mock broker + store + boucle de dispatch
pub struct TestHarness {
    pub broker: MockBroker,
    pub store: PositionStore,
    pub health: HealthTracker,
    config: ConnectionConfig,
    stop: watch::Sender<bool>,
    pipeline: Option<JoinHandle<Result<(), ConnectionError>>>,
}

impl TestHarness {
    pub fn new() -> Self {
        env_logger::try_init().ok(); // Init logging pour tests

        let (stop, _) = watch::channel(false);
        Self {
            broker: MockBroker::new(),
            store: PositionStore::new(),
            health: HealthTracker::new(),
            config: ConnectionConfig::default(),
            stop,
            pipeline: None,
        }
    }

    pub fn with_config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    /// Démarre la boucle de dispatch et attend qu'elle tourne.
    /// Un échec de connexion est remonté tel quel.
    pub async fn start(&mut self) -> Result<()> {
        if self.pipeline.is_some() {
            anyhow::bail!("pipeline already started");
        }

        let dispatcher = Dispatcher::new(
            self.broker.clone(),
            self.config.clone(),
            self.store.clone(),
            self.health.clone(),
        );
        let handle = tokio::spawn(dispatcher.run(self.stop.subscribe()));

        let start = Instant::now();
        loop {
            if self.health.state() == PipelineState::Running {
                self.pipeline = Some(handle);
                log::info!("🚀 Pipeline running");
                return Ok(());
            }
            if handle.is_finished() {
                handle.await??;
                anyhow::bail!("pipeline stopped before running");
            }
            if start.elapsed() > Duration::from_millis(DEFAULT_WAIT_MS) {
                handle.abort();
                anyhow::bail!("pipeline did not start, state {:?}", self.health.state());
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Publie un rapport de position sur `owntracks/<user>/<device>`
    pub async fn send_location(&self, user: &str, device: &str, msg: &OwnTracksMessageBuilder) -> Result<()> {
        self.broker.simulate_incoming(topic(user, device), msg.to_bytes()).await?;
        log::info!("📍 Sent location for {}/{}", user, device);
        Ok(())
    }

    pub async fn send_json(&self, topic: &str, payload: &Value) -> Result<()> {
        self.send_raw(topic, serde_json::to_vec(payload)?).await
    }

    pub async fn send_raw<V: Into<Vec<u8>>>(&self, topic: &str, payload: V) -> Result<()> {
        self.broker.simulate_incoming(topic, payload).await
    }

    /// Messages sortis de la file et traités, quelle que soit leur issue
    pub fn processed(&self) -> u64 {
        let h = self.health();
        h.locations_applied + h.unclassified_messages + h.discarded_messages
    }

    /// Attend que `count` messages aient été traités par la boucle
    pub async fn wait_for_processed(&self, count: u64) -> Result<()> {
        let start = Instant::now();
        while start.elapsed() < Duration::from_millis(DEFAULT_WAIT_MS) {
            if self.processed() >= count {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        log::warn!("⏰ Timeout waiting for {} processed messages", count);
        anyhow::bail!("only {} of {} messages processed", self.processed(), count);
    }

    /// Attend que la boucle s'arrête d'elle-même et rend son issue
    pub async fn wait_for_stopped(&mut self) -> Result<Result<(), ConnectionError>> {
        let Some(handle) = self.pipeline.take() else {
            anyhow::bail!("pipeline not started");
        };
        Ok(tokio::time::timeout(Duration::from_millis(DEFAULT_WAIT_MS), handle).await??)
    }

    pub fn position(&self, user: &str, tracker_id: &str) -> Option<LocationUpdate> {
        self.store.get(&PositionKey::new(user, tracker_id))
    }

    pub fn health(&self) -> KernelHealth {
        self.health.get_health(&self.store)
    }

    /// Signal d'arrêt puis attente de la fin de la boucle
    pub async fn shutdown(&mut self) -> Result<()> {
        let Some(handle) = self.pipeline.take() else {
            anyhow::bail!("pipeline not started");
        };
        // la boucle a pu s'arrêter seule, le receiver n'existe plus
        let _ = self.stop.send(true);
        handle.await??;
        log::info!("🛑 Pipeline stopped");
        Ok(())
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TestHarness {
    fn drop(&mut self) {
        if let Some(handle) = self.pipeline.take() {
            handle.abort();
        }
    }
}
