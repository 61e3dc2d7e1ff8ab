use time::OffsetDateTime;

use super::PlantId;

/// One ledger row of `pv_realtime`.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct RealtimePowerRow {
    pub ts: OffsetDateTime,
    pub plant_id: PlantId,
    pub power_kw: f64,
}

/// Ledger row joined with the plant location, for map-style consumers.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow, serde::Serialize)]
pub struct RealtimeDataPoint {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub power_kw: f64,
    pub lat: f64,
    pub lon: f64,
}
