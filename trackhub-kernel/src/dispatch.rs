/**
 * BOUCLE DE DISPATCH - Broker -> Decoder -> PositionStore
 *
 * RÔLE :
 * Unique propriétaire de la connexion broker. Draine les messages bruts,
 * les classe et applique les positions valides au store.
 *
 * CYCLE DE VIE :
 * Idle -> Connecting -> Running -> ShuttingDown -> Stopped
 * - échec de connexion : Connecting -> Stopped, erreur remontée, pas de retry
 * - signal d'arrêt : Running -> ShuttingDown -> disconnect -> Stopped, Ok
 * - source fermée (connexion perdue) : même chemin, puis ConnectionLost remonté
 *
 * Un message déjà retiré de la file est traité jusqu'au bout avant l'arrêt.
 */

use crate::config::ConnectionConfig;
use crate::decoder::{classify, Classified};
use crate::health::HealthTracker;
use crate::models::RawMessage;
use crate::mqtt::{Broker, ConnectionError};
use crate::store::PositionStore;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Idle,
    Connecting,
    Running,
    ShuttingDown,
    Stopped,
}

pub struct Dispatcher<B> {
    broker: B,
    config: ConnectionConfig,
    store: PositionStore,
    health: HealthTracker,
}

impl<B: Broker> Dispatcher<B> {
    pub fn new(broker: B, config: ConnectionConfig, store: PositionStore, health: HealthTracker) -> Self {
        Self {
            broker,
            config,
            store,
            health,
        }
    }

    /// Tourne jusqu'au signal d'arrêt (`true` ou sender droppé).
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), ConnectionError> {
        self.health.set_state(PipelineState::Connecting);
        let mut messages = match self.broker.connect(&self.config).await {
            Ok(rx) => rx,
            Err(e) => {
                error!(error = %e, broker = %self.config.broker_address(), "ingestion pipeline failed to start");
                self.health.set_state(PipelineState::Stopped);
                return Err(e);
            }
        };
        self.health.set_state(PipelineState::Running);
        info!("ingestion pipeline running");

        let mut lost = false;
        if !*shutdown.borrow_and_update() {
            loop {
                tokio::select! {
                    biased;
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow_and_update() {
                            break;
                        }
                    }
                    next = messages.recv() => match next {
                        Some(raw) => self.route(raw),
                        None => {
                            error!("message source closed, broker connection lost");
                            lost = true;
                            break;
                        }
                    }
                }
            }
        }

        self.health.set_state(PipelineState::ShuttingDown);
        info!("ingestion pipeline shutting down");
        drop(messages);
        if let Err(e) = self.broker.disconnect().await {
            warn!(error = %e, "disconnect failed");
        }
        self.health.set_state(PipelineState::Stopped);
        info!("ingestion pipeline stopped");
        if lost {
            return Err(ConnectionError::ConnectionLost);
        }
        Ok(())
    }

    fn route(&self, raw: RawMessage) {
        match classify(raw) {
            None => {
                trace!("payload is not a JSON object, dropped");
                self.health.record_discarded();
            }
            Some(Classified::Unclassified(msg)) => {
                debug!(
                    topic = %msg.topic,
                    payload = %String::from_utf8_lossy(&msg.payload),
                    "unclassified message"
                );
                self.health.record_unclassified();
            }
            Some(Classified::Location(update)) => {
                if update.is_zero() {
                    debug!("invalid location update discarded");
                    self.health.record_discarded();
                    return;
                }
                debug!(user = %update.user, tracker_id = %update.tracker_id, "location update");
                self.store.upsert(update);
                self.health.record_location();
            }
        }
    }
}
