use std::{collections::HashMap, sync::Arc};

use parking_lot::RwLock;
use pv_client::domain::PlantId;
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatestPowerEstimate {
    pub power_kw: f64,
    /// Timestamp of the measurement event that produced `power_kw`.
    pub last_updated_at: OffsetDateTime,
}

/// Latest power estimate per plant, shared between the engine and readers.
///
/// Updates are last-write-wins: there is no check against the previous
/// `last_updated_at`, so an out-of-order event overwrites a newer value.
#[derive(Debug, Clone, Default)]
pub struct LatestPowerStore {
    inner: Arc<RwLock<HashMap<PlantId, LatestPowerEstimate>>>,
}

impl LatestPowerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite every given plant under a single write lock.
    pub fn apply_batch(&self, ts: OffsetDateTime, updates: &[(PlantId, f64)]) {
        if updates.is_empty() {
            return;
        }
        let mut map = self.inner.write();
        for &(plant_id, power_kw) in updates {
            map.insert(
                plant_id,
                LatestPowerEstimate {
                    power_kw,
                    last_updated_at: ts,
                },
            );
        }
    }

    pub fn get(&self, plant_id: PlantId) -> Option<LatestPowerEstimate> {
        self.inner.read().get(&plant_id).copied()
    }

    /// Point-in-time copy; never contains a half-applied batch.
    pub fn snapshot(&self) -> HashMap<PlantId, LatestPowerEstimate> {
        self.inner.read().clone()
    }

    pub fn total_power_kw(&self) -> f64 {
        self.inner.read().values().map(|e| e.power_kw).sum()
    }

    /// Total power and plant count taken from the same state.
    pub fn totals(&self) -> (f64, usize) {
        let map = self.inner.read();
        (map.values().map(|e| e.power_kw).sum(), map.len())
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}
