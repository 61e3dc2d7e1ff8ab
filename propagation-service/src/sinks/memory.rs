use parking_lot::Mutex;
use pv_client::domain::{PlantId, RealtimePowerRow};
use time::OffsetDateTime;

use super::{check_arity, RealtimePowerSink};
use crate::pipeline::PropagationError;

/// In-process append-only ledger.
///
/// Used for dry runs and tests; `fail_next` injects transient failures.
#[derive(Debug, Default)]
pub struct MemorySink {
    rows: Mutex<Vec<RealtimePowerRow>>,
    failures_left: Mutex<u32>,
    attempts: Mutex<u32>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` calls fail with a persistence error.
    pub fn fail_next(&self, n: u32) {
        *self.failures_left.lock() = n;
    }

    pub fn rows(&self) -> Vec<RealtimePowerRow> {
        self.rows.lock().clone()
    }

    pub fn attempts(&self) -> u32 {
        *self.attempts.lock()
    }
}

#[async_trait::async_trait]
impl RealtimePowerSink for MemorySink {
    async fn persist(
        &self,
        ts: OffsetDateTime,
        plant_ids: &[PlantId],
        powers_kw: &[f64],
    ) -> Result<u64, PropagationError> {
        *self.attempts.lock() += 1;
        check_arity(plant_ids, powers_kw)?;

        {
            let mut failures = self.failures_left.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(PropagationError::Persistence("injected failure".to_string()));
            }
        }

        let mut rows = self.rows.lock();
        rows.extend(
            plant_ids
                .iter()
                .zip(powers_kw)
                .map(|(&plant_id, &power_kw)| RealtimePowerRow { ts, plant_id, power_kw }),
        );
        Ok(plant_ids.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[tokio::test]
    async fn appends_one_row_per_plant_per_flush() {
        let sink = MemorySink::new();
        let t1 = datetime!(2022-08-01 12:00:00 UTC);
        let t2 = datetime!(2022-08-01 12:01:00 UTC);

        sink.persist(t1, &[1, 2], &[1.5, 2.5]).await.unwrap();
        sink.persist(t2, &[1], &[3.0]).await.unwrap();

        let rows = sink.rows();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[2], RealtimePowerRow { ts: t2, plant_id: 1, power_kw: 3.0 });
    }

    #[tokio::test]
    async fn arity_mismatch_performs_zero_writes() {
        let sink = MemorySink::new();
        let err = sink
            .persist(datetime!(2022-08-01 12:00:00 UTC), &[1, 2], &[1.0, 2.0, 3.0])
            .await
            .unwrap_err();

        assert!(matches!(err, PropagationError::ArityMismatch { .. }));
        assert!(sink.rows().is_empty());
    }
}
