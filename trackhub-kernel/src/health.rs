use crate::dispatch::PipelineState;
use crate::state::{new_state, Shared};
use crate::store::PositionStore;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::{self, JoinHandle};
use tracing::info;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct KernelHealth {
    pub uptime_seconds: u64,
    pub pipeline: PipelineState,
    pub positions_tracked: usize,
    pub locations_applied: u64,
    pub unclassified_messages: u64,
    pub discarded_messages: u64,
}

#[derive(Debug, Default)]
struct Counters {
    locations: AtomicU64,
    unclassified: AtomicU64,
    discarded: AtomicU64,
}

/// Suivi de l'état du pipeline, partagé entre la boucle de dispatch et le reporting.
#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    state: Shared<PipelineState>,
    counters: Arc<Counters>,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            state: new_state(PipelineState::Idle),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn set_state(&self, state: PipelineState) {
        *self.state.write() = state;
    }

    pub fn state(&self) -> PipelineState {
        *self.state.read()
    }

    pub fn record_location(&self) {
        self.counters.locations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unclassified(&self) {
        self.counters.unclassified.fetch_add(1, Ordering::Relaxed);
    }

    /// Payload illisible ou position invalide: ce n'est pas une erreur, juste du bruit
    pub fn record_discarded(&self) {
        self.counters.discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_health(&self, store: &PositionStore) -> KernelHealth {
        KernelHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            pipeline: self.state(),
            positions_tracked: store.len(),
            locations_applied: self.counters.locations.load(Ordering::Relaxed),
            unclassified_messages: self.counters.unclassified.load(Ordering::Relaxed),
            discarded_messages: self.counters.discarded.load(Ordering::Relaxed),
        }
    }

    /// Log périodique de l'état du pipeline
    pub fn spawn_status_reporter(&self, every: Duration, store: PositionStore) -> JoinHandle<()> {
        let tracker = self.clone();
        task::spawn(async move {
            let mut interval = tokio::time::interval(every);
            // le premier tick est immédiat, rien d'utile à dire à ce moment
            interval.tick().await;
            loop {
                interval.tick().await;
                let health = tracker.get_health(&store);
                info!(
                    uptime_s = health.uptime_seconds,
                    pipeline = ?health.pipeline,
                    positions = health.positions_tracked,
                    applied = health.locations_applied,
                    unclassified = health.unclassified_messages,
                    discarded = health.discarded_messages,
                    "pipeline status"
                );
            }
        })
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}
