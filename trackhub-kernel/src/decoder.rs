/**
 * DECODER OWNTRACKS - Classification et décodage des messages bruts
 *
 * RÔLE :
 * Transforme chaque RawMessage en exactement une des deux issues :
 * une LocationUpdate ou un message non classé renvoyé tel quel.
 *
 * FONCTIONNEMENT :
 * - Décodage typé : d'abord un rapport "location" strict, sinon un objet JSON quelconque
 * - Payload non JSON / non objet : message ignoré silencieusement (`null` passe comme non classé)
 * - Identité (user, client) tirée du topic owntracks/<user>/<client>, jamais du payload
 * - Topic mal formé ou champs mal typés : LocationUpdate zéro, à jeter par l'appelant
 *
 * Aucune erreur n'est remontée : les clients hétérogènes envoient du bruit,
 * l'ingestion ne doit pas s'arrêter pour autant.
 */

use crate::models::{LocationUpdate, RawMessage, Trigger};
use serde::Deserialize;
use serde_json::{Map, Value};
use time::OffsetDateTime;

pub const TOPIC_PREFIX: &str = "owntracks/";

/// Issue de la classification d'un message.
#[derive(Debug, Clone, PartialEq)]
pub enum Classified {
    /// Peut être la valeur zéro (topic invalide…), voir `LocationUpdate::is_zero`
    Location(LocationUpdate),
    /// Message OwnTracks d'un autre type, topic et payload inchangés
    Unclassified(RawMessage),
}

#[derive(Debug, Deserialize)]
enum LocationTag {
    #[serde(rename = "location")]
    Location,
}

/// Champs d'un payload `_type: "location"`
#[derive(Debug, Deserialize)]
struct LocationReport {
    #[serde(rename = "_type")]
    _kind: LocationTag,
    lat: Option<f64>,
    lon: Option<f64>,
    tst: Option<i64>,
    acc: Option<i32>,
    batt: Option<i32>,
    desc: Option<String>,
    t: Option<String>,
    tid: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Envelope {
    Location(LocationReport),
    /// `null` compte comme un objet vide
    Other(Option<Map<String, Value>>),
}

impl LocationReport {
    fn into_update(self, topic: &str) -> LocationUpdate {
        let Some((user, client_id)) = split_topic(topic) else {
            return LocationUpdate::default();
        };
        // tst absent = epoch 0; hors des années 0..=9999 le record ne serait plus sérialisable en RFC 3339
        let Some(timestamp) = OffsetDateTime::from_unix_timestamp(self.tst.unwrap_or(0))
            .ok()
            .filter(|ts| (0..=9999).contains(&ts.year()))
        else {
            return LocationUpdate::default();
        };
        LocationUpdate {
            timestamp: Some(timestamp),
            trigger: Trigger::from_code(self.t.as_deref()),
            user: user.to_string(),
            client_id: client_id.to_string(),
            tracker_id: self.tid.unwrap_or_default(),
            accuracy: self.acc.unwrap_or_default(),
            battery: self.batt.unwrap_or_default(),
            latitude: self.lat.unwrap_or_default(),
            longitude: self.lon.unwrap_or_default(),
            description: self.desc.unwrap_or_default(),
        }
    }
}

/// Classe un message brut. `None` quand le payload n'est pas un objet JSON.
pub fn classify(msg: RawMessage) -> Option<Classified> {
    match serde_json::from_slice::<Envelope>(&msg.payload).ok()? {
        Envelope::Location(report) => Some(Classified::Location(report.into_update(&msg.topic))),
        Envelope::Other(fields) => {
            let tag = fields.as_ref().and_then(|f| f.get("_type")).and_then(Value::as_str);
            if tag == Some("location") {
                // location avec des champs mal typés: pas d'enregistrement partiel
                Some(Classified::Location(LocationUpdate::default()))
            } else {
                Some(Classified::Unclassified(msg))
            }
        }
    }
}

/// Tente d'interpréter `msg` comme une position; valeur zéro sinon.
pub fn parse_location_update(msg: &RawMessage) -> LocationUpdate {
    match serde_json::from_slice::<LocationReport>(&msg.payload) {
        Ok(report) => report.into_update(&msg.topic),
        Err(_) => LocationUpdate::default(),
    }
}

/// "owntracks/<user>/<client>" -> (user, client)
pub fn split_topic(topic: &str) -> Option<(&str, &str)> {
    let rest = topic.strip_prefix(TOPIC_PREFIX)?;
    let mut parts = rest.split('/');
    let user = parts.next()?;
    let client_id = parts.next()?;
    if parts.next().is_some() || user.is_empty() || client_id.is_empty() {
        return None;
    }
    Some((user, client_id))
}
