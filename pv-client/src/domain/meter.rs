use super::MeterId;

/// A metered reference PV system whose live output drives the estimates.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow, serde::Deserialize)]
pub struct Meter {
    pub id: MeterId,
    pub utility: String,
    pub lat: f64,
    pub lon: f64,
    pub installed_capacity_kw: f64,
    pub slope_deg: f64,
    pub orientation_deg: f64,
    pub municipality: String,
    pub address: String,
}
