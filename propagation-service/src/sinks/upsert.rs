use pv_client::domain::PlantId;
use sqlx::postgres::PgPool;
use time::OffsetDateTime;

use super::{check_arity, RealtimePowerSink};
use crate::pipeline::PropagationError;

/// Compatibility sink that overwrites `pv_plants.power_kw` in place.
///
/// Lossy: previous values and the event timestamp are not kept.
pub struct PgUpsertSink {
    pool: PgPool,
}

impl PgUpsertSink {
    pub fn new(pool: PgPool) -> Self {
        tracing::warn!("using lossy upsert sink; realtime power history will not be kept");
        Self { pool }
    }
}

#[async_trait::async_trait]
impl RealtimePowerSink for PgUpsertSink {
    async fn persist(
        &self,
        _ts: OffsetDateTime,
        plant_ids: &[PlantId],
        powers_kw: &[f64],
    ) -> Result<u64, PropagationError> {
        check_arity(plant_ids, powers_kw)?;
        let written = pv_client::db::upsert_realtime_power(&self.pool, plant_ids, powers_kw).await?;
        Ok(written)
    }
}
