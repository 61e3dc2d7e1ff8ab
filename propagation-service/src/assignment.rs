//! Nearest-meter assignment for unmetered plants.
//!
//! Brute force over every (plant, meter) pair, O(P·M). That is fine for tens
//! of thousands of each; beyond that, index meters in a k-d tree or a lat/lon
//! grid and only measure candidates from neighbouring cells.

use std::collections::HashMap;

use pv_client::domain::{MeterId, PlantId, SiteLocation};
use sqlx::PgPool;

use crate::{geodesy::geodesic_distance_m, pipeline::PropagationError};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssignmentMap {
    /// Plant input order; this is the order written back to the database.
    entries: Vec<(PlantId, MeterId)>,
    index: HashMap<PlantId, MeterId>,
}

impl AssignmentMap {
    fn from_entries(entries: Vec<(PlantId, MeterId)>) -> Self {
        let index = entries.iter().copied().collect();
        Self { entries, index }
    }

    pub fn get(&self, plant_id: PlantId) -> Option<MeterId> {
        self.index.get(&plant_id).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(PlantId, MeterId)> {
        self.entries.iter()
    }

    pub fn plant_ids(&self) -> Vec<PlantId> {
        self.entries.iter().map(|(p, _)| *p).collect()
    }

    pub fn meter_ids(&self) -> Vec<MeterId> {
        self.entries.iter().map(|(_, m)| *m).collect()
    }

    /// Number of plants whose meter differs from `previous` (including newly assigned ones).
    pub fn changed_from(&self, previous: &HashMap<PlantId, MeterId>) -> usize {
        self.entries
            .iter()
            .filter(|(p, m)| previous.get(p) != Some(m))
            .count()
    }
}

/// Assign every plant the geodesically nearest meter.
///
/// Exact ties go to the meter that comes first in `meters`. Locations with
/// invalid coordinates are skipped.
pub fn assign_nearest_meters(
    plants: &[SiteLocation],
    meters: &[SiteLocation],
) -> Result<AssignmentMap, PropagationError> {
    let meters: Vec<&SiteLocation> = meters
        .iter()
        .filter(|m| {
            let ok = m.has_valid_coordinates();
            if !ok {
                tracing::warn!(meter_id = m.id, lat = m.lat, lon = m.lon, "skipping meter with invalid coordinates");
            }
            ok
        })
        .collect();

    if meters.is_empty() {
        return Err(PropagationError::Configuration(
            "no meters with valid coordinates to assign plants to".to_string(),
        ));
    }

    let mut entries = Vec::with_capacity(plants.len());
    for plant in plants {
        if !plant.has_valid_coordinates() {
            tracing::warn!(plant_id = plant.id, lat = plant.lat, lon = plant.lon, "skipping plant with invalid coordinates");
            continue;
        }

        let mut best: Option<(MeterId, f64)> = None;
        for meter in &meters {
            let d = geodesic_distance_m(plant.lat, plant.lon, meter.lat, meter.lon);
            // strict `<` keeps the earliest meter on ties
            if best.map_or(true, |(_, best_d)| d < best_d) {
                best = Some((meter.id, d));
            }
        }

        if let Some((meter_id, _)) = best {
            entries.push((plant.id, meter_id));
        }
    }

    Ok(AssignmentMap::from_entries(entries))
}

/// Write the assignment to `pv_plants.nearest_meter_id` in one transaction.
pub async fn persist_assignment(pool: &PgPool, map: &AssignmentMap) -> Result<(), PropagationError> {
    pv_client::db::set_nearest_meters(pool, &map.plant_ids(), &map.meter_ids()).await?;
    Ok(())
}
