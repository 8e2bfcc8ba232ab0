use crate::models::{LocationUpdate, Trigger};
use serde::Serialize;
use time::OffsetDateTime;

#[derive(Debug, Serialize)]
pub struct FeatureCollection {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub features: Vec<Feature>,
}

#[derive(Debug, Serialize)]
pub struct Feature {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub geometry: Point,
    pub properties: FeatureProperties,
}

#[derive(Debug, Serialize)]
pub struct Point {
    #[serde(rename = "type")]
    pub kind: &'static str,
    /// [longitude, latitude], ordre GeoJSON
    pub coordinates: [f64; 2],
}

#[derive(Debug, Serialize)]
pub struct FeatureProperties {
    #[serde(with = "time::serde::rfc3339::option")]
    pub time: Option<OffsetDateTime>,
    pub user: String,
    pub client_id: String,
    pub tracker_id: String,
    pub accuracy: i32,
    pub battery: i32,
    pub description: String,
    pub trigger: Trigger,
}

impl From<&LocationUpdate> for Feature {
    fn from(u: &LocationUpdate) -> Self {
        Feature {
            kind: "Feature",
            geometry: Point {
                kind: "Point",
                coordinates: [u.longitude, u.latitude],
            },
            properties: FeatureProperties {
                time: u.timestamp,
                user: u.user.clone(),
                client_id: u.client_id.clone(),
                tracker_id: u.tracker_id.clone(),
                accuracy: u.accuracy,
                battery: u.battery,
                description: u.description.clone(),
                trigger: u.trigger,
            },
        }
    }
}

/// Une Feature par position du snapshot
pub fn feature_collection(updates: &[LocationUpdate]) -> FeatureCollection {
    FeatureCollection {
        kind: "FeatureCollection",
        features: updates.iter().map(Feature::from).collect(),
    }
}
