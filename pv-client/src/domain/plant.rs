use super::{MeterId, PlantId};

/// An unmetered PV plant; its output is estimated from `nearest_meter_id`.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow, serde::Deserialize)]
pub struct Plant {
    pub id: PlantId,
    /// Identifier in the external plant registry.
    pub xtf_id: i64,
    pub lat: f64,
    pub lon: f64,
    pub installed_capacity_kw: f64,
    pub slope_deg: f64,
    pub orientation_deg: f64,
    pub municipality: String,
    pub canton: String,
    pub zipcode: i32,
    pub address: String,
    pub nearest_meter_id: Option<MeterId>,
}
