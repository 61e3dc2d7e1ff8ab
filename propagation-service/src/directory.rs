use std::collections::HashMap;

use pv_client::domain::{MeterId, Plant};
use sqlx::PgPool;

use crate::pipeline::PropagationError;

/// Lookup of plants whose estimate depends on a given meter.
#[async_trait::async_trait]
pub trait PlantDirectory: Send + Sync {
    async fn affected_plants(&self, meter_id: MeterId) -> Result<Vec<Plant>, PropagationError>;
}

/// Plants grouped by `nearest_meter_id`, built once at startup.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPlantDirectory {
    by_meter: HashMap<MeterId, Vec<Plant>>,
    unassigned: usize,
}

impl InMemoryPlantDirectory {
    pub fn from_plants(plants: impl IntoIterator<Item = Plant>) -> Self {
        let mut by_meter: HashMap<MeterId, Vec<Plant>> = HashMap::new();
        let mut unassigned = 0;
        for plant in plants {
            match plant.nearest_meter_id {
                Some(meter_id) => by_meter.entry(meter_id).or_default().push(plant),
                None => unassigned += 1,
            }
        }
        Self { by_meter, unassigned }
    }

    pub fn assigned_count(&self) -> usize {
        self.by_meter.values().map(Vec::len).sum()
    }

    /// Plants without a nearest meter; they never receive an estimate.
    pub fn unassigned_count(&self) -> usize {
        self.unassigned
    }
}

#[async_trait::async_trait]
impl PlantDirectory for InMemoryPlantDirectory {
    async fn affected_plants(&self, meter_id: MeterId) -> Result<Vec<Plant>, PropagationError> {
        Ok(self.by_meter.get(&meter_id).cloned().unwrap_or_default())
    }
}

/// Queries `pv_plants` for every event.
pub struct PgPlantDirectory {
    pool: PgPool,
}

impl PgPlantDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl PlantDirectory for PgPlantDirectory {
    async fn affected_plants(&self, meter_id: MeterId) -> Result<Vec<Plant>, PropagationError> {
        pv_client::db::get_affected_plants(&self.pool, meter_id)
            .await
            .map_err(|e| PropagationError::Source(format!("plant lookup for meter {meter_id} failed: {e}")))
    }
}
