use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Message brut tel que livré par le broker: topic + payload opaque.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl RawMessage {
    pub fn new<T, P>(topic: T, payload: P) -> Self
    where
        T: Into<String>,
        P: Into<Vec<u8>>,
    {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// Raison pour laquelle un tracker a publié sa position (champ `t` du payload).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    /// "p": ping de fond, le tst est celui de la dernière position
    Ping,
    /// "c": entrée/sortie d'une région circulaire
    CircularRegion,
    /// "b": entrée/sortie d'une région beacon
    BeaconRegion,
    /// "r": réponse à une requête reportLocation
    ReportLocationResponse,
    /// "u": publication manuelle demandée par l'utilisateur
    Manual,
    /// "t": publication périodique en mode move
    Timer,
    /// "a": mise à jour automatique
    Automatic,
    #[default]
    Unknown,
}

impl Trigger {
    pub fn from_code(code: Option<&str>) -> Self {
        match code {
            Some("p") => Trigger::Ping,
            Some("c") => Trigger::CircularRegion,
            Some("b") => Trigger::BeaconRegion,
            Some("r") => Trigger::ReportLocationResponse,
            Some("u") => Trigger::Manual,
            Some("t") => Trigger::Timer,
            Some("a") => Trigger::Automatic,
            _ => Trigger::Unknown,
        }
    }
}

/// Clé du store: un tracker physique, scopé par utilisateur.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PositionKey {
    pub user: String,
    pub tracker_id: String,
}

impl PositionKey {
    pub fn new<U: Into<String>, T: Into<String>>(user: U, tracker_id: T) -> Self {
        Self {
            user: user.into(),
            tracker_id: tracker_id.into(),
        }
    }
}

/// Position décodée d'un tracker appartenant à un utilisateur.
///
/// `LocationUpdate::default()` est la valeur "zéro" (timestamp absent): elle
/// signale un message qui n'est pas une position valide et ne doit jamais
/// être stockée.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct LocationUpdate {
    #[serde(with = "time::serde::rfc3339::option")]
    pub timestamp: Option<OffsetDateTime>,
    pub trigger: Trigger,
    /// Issu du topic, pas du payload
    pub user: String,
    /// Issu du topic, pas du payload
    pub client_id: String,
    pub tracker_id: String,
    /// En mètres
    pub accuracy: i32,
    /// En pourcent
    pub battery: i32,
    pub latitude: f64,
    pub longitude: f64,
    pub description: String,
}

impl LocationUpdate {
    pub fn is_zero(&self) -> bool {
        self.timestamp.is_none()
    }

    pub fn key(&self) -> PositionKey {
        PositionKey::new(self.user.clone(), self.tracker_id.clone())
    }
}
