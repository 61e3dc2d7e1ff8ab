use std::time::{Duration, SystemTime};

use pv_client::domain::PlantId;
use time::OffsetDateTime;

use crate::pipeline::PropagationError;

pub mod ledger;
pub mod memory;
pub mod upsert;

pub use ledger::PgLedgerSink;
pub use memory::MemorySink;
pub use upsert::PgUpsertSink;

/// Durable write-back of power estimates.
///
/// A call is atomic: either every row is written or none is. Mismatched
/// slice lengths fail with `ArityMismatch` before anything is written.
#[async_trait::async_trait]
pub trait RealtimePowerSink: Send + Sync {
    async fn persist(
        &self,
        ts: OffsetDateTime,
        plant_ids: &[PlantId],
        powers_kw: &[f64],
    ) -> Result<u64, PropagationError>;
}

pub(crate) fn check_arity(plant_ids: &[PlantId], powers_kw: &[f64]) -> Result<(), PropagationError> {
    pv_client::error::check_arity("plant_ids", plant_ids, "powers_kw", powers_kw)?;
    Ok(())
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, retry_backoff: Duration) -> Self {
        Self {
            max_retries,
            retry_backoff,
        }
    }
}

/// Persist with linear backoff. Only `Persistence` errors are retried.
pub async fn persist_with_retry(
    sink: &dyn RealtimePowerSink,
    policy: RetryPolicy,
    ts: OffsetDateTime,
    plant_ids: &[PlantId],
    powers_kw: &[f64],
    received_at: Option<SystemTime>,
) -> Result<u64, PropagationError> {
    let mut attempt: u32 = 0;
    loop {
        match sink.persist(ts, plant_ids, powers_kw).await {
            Ok(written) => {
                metrics::counter!("realtime_power_rows_persisted_total").increment(written);

                if let Some(received_at) = received_at {
                    if let Ok(dur) = SystemTime::now().duration_since(received_at) {
                        metrics::histogram!("propagation_end_to_end_latency_seconds").record(dur.as_secs_f64());
                    }
                }

                return Ok(written);
            }
            Err(PropagationError::Persistence(e)) if attempt < policy.max_retries => {
                attempt += 1;
                let sleep_for = policy.retry_backoff * attempt;
                tracing::warn!(
                    error = %e,
                    attempt,
                    "realtime power flush failed, retrying with backoff"
                );
                metrics::counter!("realtime_power_sink_retry_total").increment(1);
                tokio::time::sleep(sleep_for).await;
            }
            Err(e) => {
                tracing::error!(error = %e, attempt, "realtime power flush failed, giving up");
                metrics::counter!("realtime_power_sink_errors_total").increment(1);
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    const TS: OffsetDateTime = datetime!(2022-08-01 12:00:00 UTC);

    fn fast(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(max_retries, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn transient_failures_are_retried_until_success() {
        let sink = MemorySink::new();
        sink.fail_next(2);

        let written = persist_with_retry(&sink, fast(3), TS, &[1, 2], &[1.0, 2.0], None)
            .await
            .unwrap();

        assert_eq!(written, 2);
        assert_eq!(sink.rows().len(), 2);
        assert_eq!(sink.attempts(), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_return_persistence_error() {
        let sink = MemorySink::new();
        sink.fail_next(10);

        let err = persist_with_retry(&sink, fast(2), TS, &[1], &[1.0], None)
            .await
            .unwrap_err();

        assert!(matches!(err, PropagationError::Persistence(_)));
        assert_eq!(sink.attempts(), 3);
        assert!(sink.rows().is_empty());
    }

    #[tokio::test]
    async fn arity_mismatch_is_not_retried_and_writes_nothing() {
        let sink = MemorySink::new();

        let err = persist_with_retry(&sink, fast(5), TS, &[1, 2, 3], &[1.0], None)
            .await
            .unwrap_err();

        assert!(matches!(err, PropagationError::ArityMismatch { left: 3, right: 1, .. }));
        assert_eq!(sink.attempts(), 1);
        assert!(sink.rows().is_empty());
    }
}
