/*!
Mock Broker pour développement sans broker MQTT

Implémente le trait `Broker` du kernel en mémoire: la boucle de dispatch
tourne telle quelle, les messages sont injectés via `simulate_incoming`.
Enregistre les abonnements, connexions et déconnexions pour les assertions.
*/

use anyhow::Result;
use parking_lot::Mutex;
use rumqttc::QoS;
use std::sync::Arc;
use tokio::sync::mpsc;
use trackhub_kernel::config::ConnectionConfig;
use trackhub_kernel::mqtt::{Broker, ConnectionError, DisconnectError, OWNTRACKS_TOPIC};
use trackhub_kernel::RawMessage;

/// Échec de connexion programmé
#[derive(Debug, Clone)]
pub enum MockFailure {
    Timeout(&'static str),
    Rejected { stage: &'static str, reason: String },
    Certificate(String),
}

impl From<MockFailure> for ConnectionError {
    fn from(failure: MockFailure) -> Self {
        match failure {
            MockFailure::Timeout(stage) => ConnectionError::HandshakeTimeout(stage),
            MockFailure::Rejected { stage, reason } => ConnectionError::BrokerRejected { stage, reason },
            MockFailure::Certificate(msg) => ConnectionError::Certificate(msg),
        }
    }
}

#[derive(Default)]
struct MockState {
    sender: Option<mpsc::Sender<RawMessage>>,
    subscriptions: Vec<(String, QoS)>,
    last_config: Option<ConnectionConfig>,
    connects: usize,
    disconnects: usize,
    failure: Option<MockFailure>,
}

/// Broker en mémoire, clonable: le clone gardé par le test pilote celui du pipeline
#[derive(Clone, Default)]
pub struct MockBroker {
    state: Arc<Mutex<MockState>>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Les prochains `connect` échoueront avec cette erreur
    pub fn fail_connect_with(&self, failure: MockFailure) {
        self.state.lock().failure = Some(failure);
    }

    /// Simule la réception d'un message publié sur le broker
    pub async fn simulate_incoming<S, V>(&self, topic: S, payload: V) -> Result<()>
    where
        S: Into<String>,
        V: Into<Vec<u8>>,
    {
        let sender = self.state.lock().sender.clone();
        let Some(sender) = sender else {
            anyhow::bail!("mock broker is not connected");
        };

        let message = RawMessage::new(topic, payload);
        log::info!("📨 [MOCK] Simulated incoming: {}", message.topic);
        sender
            .send(message)
            .await
            .map_err(|e| anyhow::anyhow!("Send error: {}", e))?;
        Ok(())
    }

    /// Coupe la connexion côté transport: la source de messages se ferme
    pub fn drop_connection(&self) {
        if self.state.lock().sender.take().is_some() {
            log::warn!("🔌 [MOCK] Connection dropped");
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().sender.as_ref().is_some_and(|tx| !tx.is_closed())
    }

    /// Récupère les abonnements (pour assertions de tests)
    pub fn get_subscriptions(&self) -> Vec<(String, QoS)> {
        self.state.lock().subscriptions.clone()
    }

    pub fn last_config(&self) -> Option<ConnectionConfig> {
        self.state.lock().last_config.clone()
    }

    pub fn connect_count(&self) -> usize {
        self.state.lock().connects
    }

    pub fn disconnect_count(&self) -> usize {
        self.state.lock().disconnects
    }
}

impl Broker for MockBroker {
    async fn connect(&mut self, config: &ConnectionConfig) -> Result<mpsc::Receiver<RawMessage>, ConnectionError> {
        let mut state = self.state.lock();
        if state.sender.as_ref().is_some_and(|tx| !tx.is_closed()) {
            return Err(ConnectionError::AlreadyConnected);
        }
        state.connects += 1;
        state.last_config = Some(config.clone());
        if let Some(failure) = state.failure.clone() {
            log::warn!("❌ [MOCK] Refusing connection: {:?}", failure);
            return Err(failure.into());
        }

        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        state.sender = Some(tx);
        state.subscriptions.push((OWNTRACKS_TOPIC.to_string(), QoS::AtLeastOnce));
        log::info!("📥 [MOCK] Subscribed to {}", OWNTRACKS_TOPIC);
        Ok(rx)
    }

    async fn disconnect(&mut self) -> Result<(), DisconnectError> {
        let mut state = self.state.lock();
        state.disconnects += 1;
        if state.sender.take().is_none() {
            return Err(DisconnectError::NotConnected);
        }
        log::info!("👋 [MOCK] Disconnected");
        Ok(())
    }
}
