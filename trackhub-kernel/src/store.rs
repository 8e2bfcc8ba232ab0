/**
 * POSITION STORE - Dernière position connue par (utilisateur, tracker)
 *
 * RÔLE :
 * Map concurrente alimentée par la boucle de dispatch, lue par les snapshots
 * et le rendu GeoJSON.
 *
 * FONCTIONNEMENT :
 * - "dernier écrit gagne" : chaque upsert remplace l'entrée de sa clé sans comparer les timestamps
 * - pas d'historique, pas d'expiration
 * - les snapshots sont des copies, sérialisables sans tenir le verrou
 */

use crate::geojson::{feature_collection, FeatureCollection};
use crate::models::{LocationUpdate, PositionKey};
use crate::state::{new_state, Shared};
use std::collections::HashMap;

#[derive(Debug, Clone, Default)]
pub struct PositionStore {
    positions: Shared<HashMap<PositionKey, LocationUpdate>>,
}

impl PositionStore {
    pub fn new() -> Self {
        Self {
            positions: new_state(HashMap::new()),
        }
    }

    /// Remplace l'entrée de la clé de `update`. Les valeurs zéro sont ignorées.
    pub fn upsert(&self, update: LocationUpdate) -> bool {
        if update.is_zero() {
            return false;
        }
        // l'enregistrement est construit hors verrou, l'écriture est un simple swap
        let key = update.key();
        self.positions.write().insert(key, update);
        true
    }

    /// Copie à l'instant t de toutes les entrées, ordre non spécifié.
    pub fn snapshot(&self) -> Vec<LocationUpdate> {
        self.positions.read().values().cloned().collect()
    }

    pub fn get(&self, key: &PositionKey) -> Option<LocationUpdate> {
        self.positions.read().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.positions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.read().is_empty()
    }

    /// Snapshot rendu en FeatureCollection pour les consommateurs externes
    pub fn to_geojson(&self) -> FeatureCollection {
        feature_collection(&self.snapshot())
    }
}
