/*!
Builders de messages OwnTracks pour les tests

Produit des payloads au format des apps OwnTracks (`_type` + champs courts)
et les topics `owntracks/<user>/<device>` associés.
*/

use serde::Serialize;
use serde_json::Value;
use time::OffsetDateTime;

/// Topic de publication d'un device OwnTracks
pub fn topic(user: &str, device: &str) -> String {
    format!("owntracks/{}/{}", user, device)
}

/// Rapport de position, sérialisé comme l'app l'envoie
#[derive(Debug, Clone, Serialize)]
pub struct LocationPayload {
    #[serde(rename = "_type")]
    kind: &'static str,
    lat: f64,
    lon: f64,
    tst: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    tid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    t: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    acc: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    batt: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    desc: Option<String>,
}

/// Builder fluide pour un rapport de position
#[derive(Debug, Clone)]
pub struct OwnTracksMessageBuilder {
    payload: LocationPayload,
}

impl OwnTracksMessageBuilder {
    pub fn location(lat: f64, lon: f64, tst: i64) -> Self {
        Self {
            payload: LocationPayload {
                kind: "location",
                lat,
                lon,
                tst,
                tid: None,
                t: None,
                acc: None,
                batt: None,
                desc: None,
            },
        }
    }

    pub fn at(mut self, when: OffsetDateTime) -> Self {
        self.payload.tst = when.unix_timestamp();
        self
    }

    pub fn tracker_id<S: Into<String>>(mut self, tid: S) -> Self {
        self.payload.tid = Some(tid.into());
        self
    }

    /// Code trigger à une lettre (`p`, `c`, `b`, `r`, `u`, `t`, `a`)
    pub fn trigger<S: Into<String>>(mut self, code: S) -> Self {
        self.payload.t = Some(code.into());
        self
    }

    pub fn accuracy(mut self, acc: i32) -> Self {
        self.payload.acc = Some(acc);
        self
    }

    pub fn battery(mut self, batt: i32) -> Self {
        self.payload.batt = Some(batt);
        self
    }

    pub fn description<S: Into<String>>(mut self, desc: S) -> Self {
        self.payload.desc = Some(desc.into());
        self
    }

    pub fn build(&self) -> Value {
        serde_json::to_value(&self.payload).unwrap_or(Value::Null)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(&self.payload).unwrap_or_default()
    }

    /// Message ping (non classé côté kernel)
    pub fn ping() -> Value {
        serde_json::json!({ "_type": "ping" })
    }

    /// Définition de waypoint (non classé côté kernel)
    pub fn waypoint(desc: &str, lat: f64, lon: f64, rad: u32, tst: i64) -> Value {
        serde_json::json!({
            "_type": "waypoint",
            "desc": desc,
            "lat": lat,
            "lon": lon,
            "rad": rad,
            "tst": tst
        })
    }

    /// Last Will publié par le broker quand le device disparaît
    pub fn lwt(tst: i64) -> Value {
        serde_json::json!({ "_type": "lwt", "tst": tst })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_topic() {
        assert_eq!(topic("alice", "phone1"), "owntracks/alice/phone1");
    }

    #[test]
    fn test_location_builder() {
        let msg = OwnTracksMessageBuilder::location(52.5, 13.4, 0)
            .at(datetime!(2023-11-14 22:13:20 UTC))
            .tracker_id("t1")
            .trigger("u")
            .build();

        assert_eq!(
            msg,
            serde_json::json!({
                "_type": "location",
                "lat": 52.5,
                "lon": 13.4,
                "tst": 1_700_000_000,
                "tid": "t1",
                "t": "u"
            })
        );
    }

    #[test]
    fn test_other_message_types() {
        assert_eq!(OwnTracksMessageBuilder::ping()["_type"], "ping");
        let wp = OwnTracksMessageBuilder::waypoint("home", 1.0, 2.0, 50, 10);
        assert_eq!(wp["_type"], "waypoint");
        assert_eq!(wp["rad"], 50);
        assert_eq!(OwnTracksMessageBuilder::lwt(5)["tst"], 5);
    }
}
