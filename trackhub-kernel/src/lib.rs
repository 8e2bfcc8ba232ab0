/**
 * TRACKHUB KERNEL - Ingestion des positions OwnTracks via MQTT
 *
 * RÔLE : Broker MQTT -> classification des messages -> dernière position connue
 * par (utilisateur, tracker), exposée en snapshot et en GeoJSON.
 *
 * MODULES :
 * - mqtt : connexion broker (rumqttc), souscription `owntracks/#`, file bornée
 * - decoder : classification JSON et décodage des rapports de position
 * - store : map concurrente des dernières positions
 * - dispatch : boucle unique broker -> decoder -> store avec arrêt propre
 * - health : compteurs et état du pipeline
 */

pub mod config;
pub mod decoder;
pub mod dispatch;
pub mod geojson;
pub mod health;
pub mod models;
pub mod mqtt;
pub mod state;
pub mod store;

pub use config::{ConnectionConfig, KernelConfig};
pub use decoder::{classify, Classified};
pub use dispatch::{Dispatcher, PipelineState};
pub use health::{HealthTracker, KernelHealth};
pub use models::{LocationUpdate, PositionKey, RawMessage, Trigger};
pub use mqtt::{Broker, ConnectionError, DisconnectError, Listener};
pub use store::PositionStore;
