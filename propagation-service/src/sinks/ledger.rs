use pv_client::domain::PlantId;
use sqlx::postgres::PgPool;
use time::OffsetDateTime;

use super::{check_arity, RealtimePowerSink};
use crate::pipeline::PropagationError;

/// Canonical sink: appends to the immutable `pv_realtime` ledger.
///
/// Current state per plant is the latest row for that plant.
pub struct PgLedgerSink {
    pool: PgPool,
}

impl PgLedgerSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl RealtimePowerSink for PgLedgerSink {
    async fn persist(
        &self,
        ts: OffsetDateTime,
        plant_ids: &[PlantId],
        powers_kw: &[f64],
    ) -> Result<u64, PropagationError> {
        check_arity(plant_ids, powers_kw)?;
        // Single multi-row INSERT: all rows or none.
        let written = pv_client::db::insert_realtime_power(&self.pool, ts, plant_ids, powers_kw).await?;
        Ok(written)
    }
}
