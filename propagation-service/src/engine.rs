//! Consumer loop turning meter readings into plant power estimates.
//!
//! Per event: resolve the meter, estimate irradiance once, simulate every
//! plant assigned to the meter on the fan-out pool, write the results to the
//! [`LatestPowerStore`] and flush them to the sink.
//!
//! Events are consumed at most once. A dropped event (unknown meter, model
//! failure) is never re-enqueued, so its tick is lost for the affected
//! plants. Estimates are best-effort telemetry, not billing records.

use std::{collections::HashMap, sync::Arc, time::Duration};

use pv_client::domain::{Meter, MeterId, Plant, PlantId};
use rayon::prelude::*;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

use crate::{
    config::BatchPolicy,
    directory::PlantDirectory,
    ingest::EventReceiver,
    models::{simulate_plant, Irradiance, IrradianceEstimator, ModelError, PowerSimulator},
    pipeline::{Envelope, MeasurementEvent, PropagationError},
    sinks::{persist_with_retry, RealtimePowerSink, RetryPolicy},
    store::LatestPowerStore,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    /// The meter has no assigned plants.
    NoAffectedPlants,
    Updated {
        plants: usize,
        failed: usize,
        persisted: bool,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub events: u64,
    pub no_op_events: u64,
    pub unknown_meter: u64,
    pub model_failures: u64,
    pub other_failures: u64,
    pub plants_updated: u64,
    pub degraded_flushes: u64,
}

pub struct PropagationEngine {
    meters: HashMap<MeterId, Meter>,
    plants: Arc<dyn PlantDirectory>,
    estimator: Arc<dyn IrradianceEstimator>,
    simulator: Arc<dyn PowerSimulator>,
    store: LatestPowerStore,
    sink: Arc<dyn RealtimePowerSink>,
    retry: RetryPolicy,
    batch_policy: BatchPolicy,
    recv_timeout: Duration,
    fanout: Arc<rayon::ThreadPool>,
}

impl PropagationEngine {
    /// Fails with `Configuration` when no meters are loaded.
    pub fn new(
        meters: HashMap<MeterId, Meter>,
        plants: Arc<dyn PlantDirectory>,
        estimator: Arc<dyn IrradianceEstimator>,
        simulator: Arc<dyn PowerSimulator>,
        store: LatestPowerStore,
        sink: Arc<dyn RealtimePowerSink>,
    ) -> Result<Self, PropagationError> {
        if meters.is_empty() {
            return Err(PropagationError::Configuration("no meters loaded".to_string()));
        }

        Ok(Self {
            meters,
            plants,
            estimator,
            simulator,
            store,
            sink,
            retry: RetryPolicy::new(3, Duration::from_millis(200)),
            batch_policy: BatchPolicy::default(),
            recv_timeout: Duration::from_millis(250),
            fanout: Arc::new(build_fanout_pool(None)?),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_batch_policy(mut self, policy: BatchPolicy) -> Self {
        self.batch_policy = policy;
        self
    }

    pub fn with_recv_timeout(mut self, timeout: Duration) -> Self {
        self.recv_timeout = timeout;
        self
    }

    pub fn with_fanout_workers(mut self, workers: usize) -> Result<Self, PropagationError> {
        self.fanout = Arc::new(build_fanout_pool(Some(workers))?);
        Ok(self)
    }

    pub fn store(&self) -> &LatestPowerStore {
        &self.store
    }

    /// Consume events until the stop signal fires or the channel closes.
    ///
    /// The stop signal is only observed between events: an event that has
    /// been dequeued is always carried through fan-out, state update and
    /// flush.
    pub async fn run(&self, mut events: EventReceiver, cancel: CancellationToken) -> EngineStats {
        let mut stats = EngineStats::default();

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::info!("stop signal received, propagation engine shutting down");
                    break;
                }
                next = tokio::time::timeout(self.recv_timeout, events.recv()) => next,
            };

            let env = match next {
                Ok(Some(env)) => env,
                Ok(None) => {
                    tracing::info!("event channel closed, propagation engine shutting down");
                    break;
                }
                Err(_elapsed) => continue,
            };

            self.handle_event(env, &mut stats).await;
        }

        tracing::info!(
            events = stats.events,
            plants_updated = stats.plants_updated,
            unknown_meter = stats.unknown_meter,
            model_failures = stats.model_failures,
            degraded_flushes = stats.degraded_flushes,
            "propagation engine stopped"
        );
        stats
    }

    async fn handle_event(&self, env: Envelope<MeasurementEvent>, stats: &mut EngineStats) {
        stats.events += 1;
        metrics::counter!("propagation_events_total").increment(1);
        let meter_id = env.payload.meter_id;
        let ts = env.payload.ts;

        match self.process_event(env).await {
            Ok(EventOutcome::NoAffectedPlants) => {
                stats.no_op_events += 1;
            }
            Ok(EventOutcome::Updated {
                plants,
                failed,
                persisted,
            }) => {
                stats.plants_updated += plants as u64;
                if failed > 0 {
                    stats.model_failures += failed as u64;
                    metrics::counter!("propagation_model_failures_total").increment(failed as u64);
                }
                if !persisted {
                    stats.degraded_flushes += 1;
                }
            }
            Err(PropagationError::UnknownMeter(id)) => {
                stats.unknown_meter += 1;
                metrics::counter!("propagation_unknown_meter_total").increment(1);
                tracing::warn!(meter_id = id, "dropping event from unknown meter");
            }
            Err(e @ PropagationError::ModelComputation { .. }) => {
                stats.model_failures += 1;
                metrics::counter!("propagation_model_failures_total").increment(1);
                tracing::error!(error = %e, meter_id, %ts, "model failure, event dropped");
            }
            Err(e) => {
                stats.other_failures += 1;
                tracing::error!(error = %e, meter_id, %ts, "event dropped");
            }
        }
    }

    /// Run one event through resolve → estimate → fan-out → update → flush.
    pub async fn process_event(&self, env: Envelope<MeasurementEvent>) -> Result<EventOutcome, PropagationError> {
        let event = &env.payload;

        let meter = self
            .meters
            .get(&event.meter_id)
            .ok_or(PropagationError::UnknownMeter(event.meter_id))?;

        let irradiance = self
            .estimator
            .estimate(
                event.power_kw,
                meter.installed_capacity_kw,
                meter.slope_deg,
                meter.lat,
                meter.lon,
                event.ts,
            )
            .map_err(|e| PropagationError::model(None, format!("irradiance at meter {}: {e}", meter.id)))?;

        let plants = self.plants.affected_plants(meter.id).await?;
        if plants.is_empty() {
            tracing::debug!(meter_id = meter.id, "no plants assigned to meter");
            return Ok(EventOutcome::NoAffectedPlants);
        }

        let results = self.fan_out(plants, irradiance, event.ts).await?;
        let (updates, failed) = self.apply_batch_policy(meter.id, results)?;

        // UPDATE_STATE
        self.store.apply_batch(event.ts, &updates);
        metrics::counter!("propagation_plants_updated_total").increment(updates.len() as u64);
        metrics::gauge!("latest_power_total_kw").set(self.store.total_power_kw());

        // FLUSH
        let persisted = if updates.is_empty() {
            true
        } else {
            let (plant_ids, powers_kw): (Vec<PlantId>, Vec<f64>) = updates.iter().copied().unzip();
            match persist_with_retry(
                self.sink.as_ref(),
                self.retry,
                event.ts,
                &plant_ids,
                &powers_kw,
                Some(env.received_at),
            )
            .await
            {
                Ok(_) => true,
                Err(e) => {
                    metrics::counter!("propagation_degraded_flushes_total").increment(1);
                    tracing::warn!(
                        error = %e,
                        meter_id = meter.id,
                        plants = plant_ids.len(),
                        "flush failed after retries; continuing in degraded mode without durability"
                    );
                    false
                }
            }
        };

        Ok(EventOutcome::Updated {
            plants: updates.len(),
            failed,
            persisted,
        })
    }

    /// Simulate every plant on the fan-out pool and wait for all of them.
    async fn fan_out(
        &self,
        plants: Vec<Plant>,
        irradiance: Irradiance,
        ts: OffsetDateTime,
    ) -> Result<Vec<(PlantId, Result<f64, ModelError>)>, PropagationError> {
        let pool = Arc::clone(&self.fanout);
        let simulator = Arc::clone(&self.simulator);

        tokio::task::spawn_blocking(move || {
            pool.install(|| {
                plants
                    .into_par_iter()
                    .map(|plant| (plant.id, simulate_plant(simulator.as_ref(), &plant, irradiance, ts)))
                    .collect()
            })
        })
        .await
        .map_err(|e| PropagationError::model(None, format!("fan-out worker failed: {e}")))
    }

    fn apply_batch_policy(
        &self,
        meter_id: MeterId,
        results: Vec<(PlantId, Result<f64, ModelError>)>,
    ) -> Result<(Vec<(PlantId, f64)>, usize), PropagationError> {
        let mut updates = Vec::with_capacity(results.len());
        let mut first_failure: Option<(PlantId, ModelError)> = None;
        let mut failed = 0;

        for (plant_id, result) in results {
            match result {
                Ok(power_kw) => updates.push((plant_id, power_kw)),
                Err(e) => {
                    failed += 1;
                    tracing::warn!(plant_id, meter_id, error = %e, "plant simulation failed");
                    if first_failure.is_none() {
                        first_failure = Some((plant_id, e));
                    }
                }
            }
        }

        match (self.batch_policy, first_failure) {
            (BatchPolicy::AllOrNothing, Some((plant_id, e))) => Err(PropagationError::model(
                Some(plant_id),
                format!("{e}; batch of {} plants for meter {meter_id} aborted", updates.len() + failed),
            )),
            _ => Ok((updates, failed)),
        }
    }
}

fn build_fanout_pool(workers: Option<usize>) -> Result<rayon::ThreadPool, PropagationError> {
    let mut builder = rayon::ThreadPoolBuilder::new().thread_name(|i| format!("fanout-{i}"));
    if let Some(n) = workers {
        builder = builder.num_threads(n.max(1));
    }
    builder
        .build()
        .map_err(|e| PropagationError::Configuration(format!("failed to build fan-out pool: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        directory::InMemoryPlantDirectory,
        models::{FixedSplitIrradianceEstimator, PerformanceRatioSimulator},
        sinks::MemorySink,
    };
    use time::macros::datetime;

    const TS: OffsetDateTime = datetime!(2022-08-01 12:00:00 UTC);

    fn meter(id: MeterId, capacity: f64, slope: f64, lat: f64, lon: f64) -> Meter {
        Meter {
            id,
            utility: "EWZ".to_string(),
            lat,
            lon,
            installed_capacity_kw: capacity,
            slope_deg: slope,
            orientation_deg: 0.0,
            municipality: String::new(),
            address: String::new(),
        }
    }

    fn plant(id: PlantId, meter: MeterId, capacity: f64) -> Plant {
        Plant {
            id,
            xtf_id: id,
            lat: 47.0,
            lon: 8.0,
            installed_capacity_kw: capacity,
            slope_deg: 25.0,
            orientation_deg: 10.0,
            municipality: String::new(),
            canton: String::new(),
            zipcode: 8000,
            address: String::new(),
            nearest_meter_id: Some(meter),
        }
    }

    fn event(meter_id: MeterId, power_kw: f64) -> Envelope<MeasurementEvent> {
        Envelope::now(MeasurementEvent {
            ts: TS,
            meter_id,
            power_kw,
        })
    }

    /// Fails for plants with a negative capacity, otherwise delegates.
    struct FailOnNegativeCapacity(PerformanceRatioSimulator);

    impl PowerSimulator for FailOnNegativeCapacity {
        fn simulate(
            &self,
            capacity: f64,
            slope: f64,
            orientation: f64,
            lat: f64,
            lon: f64,
            irradiance: Irradiance,
            ts: OffsetDateTime,
        ) -> Result<f64, ModelError> {
            if capacity < 0.0 {
                return Err(ModelError::InvalidInput {
                    name: "installed_capacity_kw",
                    value: capacity,
                });
            }
            self.0.simulate(capacity, slope, orientation, lat, lon, irradiance, ts)
        }
    }

    fn engine_with(
        plants: Vec<Plant>,
        simulator: Arc<dyn PowerSimulator>,
        sink: Arc<MemorySink>,
    ) -> PropagationEngine {
        let meters = [(1, meter(1, 10.0, 30.0, 47.0, 8.0)), (2, meter(2, 20.0, 10.0, 46.5, 7.5))]
            .into_iter()
            .collect();
        PropagationEngine::new(
            meters,
            Arc::new(InMemoryPlantDirectory::from_plants(plants)),
            Arc::new(FixedSplitIrradianceEstimator::default()),
            simulator,
            LatestPowerStore::new(),
            sink,
        )
        .unwrap()
        .with_retry(RetryPolicy::new(1, Duration::from_millis(1)))
        .with_fanout_workers(2)
        .unwrap()
    }

    #[test]
    fn engine_requires_meters() {
        let res = PropagationEngine::new(
            HashMap::new(),
            Arc::new(InMemoryPlantDirectory::default()),
            Arc::new(FixedSplitIrradianceEstimator::default()),
            Arc::new(PerformanceRatioSimulator::default()),
            LatestPowerStore::new(),
            Arc::new(MemorySink::new()),
        );
        assert!(matches!(res, Err(PropagationError::Configuration(_))));
    }

    #[tokio::test]
    async fn meter_without_plants_is_a_no_op() {
        let sink = Arc::new(MemorySink::new());
        let engine = engine_with(vec![plant(1, 1, 5.0)], Arc::new(PerformanceRatioSimulator::default()), sink.clone());

        let outcome = engine.process_event(event(2, 12.0)).await.unwrap();

        assert_eq!(outcome, EventOutcome::NoAffectedPlants);
        assert!(engine.store().is_empty());
        assert_eq!(sink.attempts(), 0);
    }

    #[tokio::test]
    async fn unknown_meter_is_rejected_without_side_effects() {
        let sink = Arc::new(MemorySink::new());
        let engine = engine_with(vec![plant(1, 1, 5.0)], Arc::new(PerformanceRatioSimulator::default()), sink.clone());

        let err = engine.process_event(event(42, 3.0)).await.unwrap_err();

        assert!(matches!(err, PropagationError::UnknownMeter(42)));
        assert!(engine.store().is_empty());
        assert!(sink.rows().is_empty());
    }

    #[tokio::test]
    async fn fan_out_updates_every_assigned_plant_and_flushes_once() {
        let sink = Arc::new(MemorySink::new());
        let plants = vec![plant(1, 1, 5.0), plant(2, 1, 8.0), plant(3, 1, 2.0), plant(4, 2, 9.0)];
        let engine = engine_with(plants, Arc::new(PerformanceRatioSimulator::default()), sink.clone());

        let outcome = engine.process_event(event(1, -6.0)).await.unwrap();

        assert_eq!(
            outcome,
            EventOutcome::Updated {
                plants: 3,
                failed: 0,
                persisted: true
            }
        );
        let snap = engine.store().snapshot();
        assert_eq!(snap.len(), 3);
        assert!(snap.values().all(|e| e.power_kw > 0.0 && e.last_updated_at == TS));
        assert_eq!(sink.attempts(), 1);
        let mut ids: Vec<_> = sink.rows().iter().map(|r| r.plant_id).collect();
        ids.sort();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn all_or_nothing_aborts_the_whole_batch() {
        let sink = Arc::new(MemorySink::new());
        let plants = vec![plant(1, 1, 5.0), plant(2, 1, -1.0), plant(3, 1, 2.0)];
        let engine = engine_with(
            plants,
            Arc::new(FailOnNegativeCapacity(PerformanceRatioSimulator::default())),
            sink.clone(),
        );

        let err = engine.process_event(event(1, 5.0)).await.unwrap_err();

        assert!(matches!(err, PropagationError::ModelComputation { plant_id: Some(2), .. }));
        assert!(engine.store().is_empty());
        assert!(sink.rows().is_empty());
    }

    #[tokio::test]
    async fn apply_partial_keeps_successful_plants() {
        let sink = Arc::new(MemorySink::new());
        let plants = vec![plant(1, 1, 5.0), plant(2, 1, -1.0), plant(3, 1, 2.0)];
        let engine = engine_with(
            plants,
            Arc::new(FailOnNegativeCapacity(PerformanceRatioSimulator::default())),
            sink.clone(),
        )
        .with_batch_policy(BatchPolicy::ApplyPartial);

        let outcome = engine.process_event(event(1, 5.0)).await.unwrap();

        assert_eq!(
            outcome,
            EventOutcome::Updated {
                plants: 2,
                failed: 1,
                persisted: true
            }
        );
        assert!(engine.store().get(1).is_some());
        assert!(engine.store().get(2).is_none());
        assert!(engine.store().get(3).is_some());
        assert_eq!(sink.rows().len(), 2);
    }

    #[tokio::test]
    async fn exhausted_flush_retries_keep_state_and_report_degraded() {
        let sink = Arc::new(MemorySink::new());
        sink.fail_next(100);
        let engine = engine_with(vec![plant(1, 1, 5.0)], Arc::new(PerformanceRatioSimulator::default()), sink.clone());

        let outcome = engine.process_event(event(1, 5.0)).await.unwrap();

        assert_eq!(
            outcome,
            EventOutcome::Updated {
                plants: 1,
                failed: 0,
                persisted: false
            }
        );
        assert!(engine.store().get(1).is_some());
        assert_eq!(sink.attempts(), 2);
    }

    #[tokio::test]
    async fn estimator_failure_is_a_model_error() {
        let sink = Arc::new(MemorySink::new());
        let mut meters = HashMap::new();
        meters.insert(7, meter(7, 0.0, 30.0, 47.0, 8.0));
        let engine = PropagationEngine::new(
            meters,
            Arc::new(InMemoryPlantDirectory::from_plants(vec![plant(1, 7, 5.0)])),
            Arc::new(FixedSplitIrradianceEstimator::default()),
            Arc::new(PerformanceRatioSimulator::default()),
            LatestPowerStore::new(),
            sink.clone(),
        )
        .unwrap();

        let err = engine.process_event(event(7, 5.0)).await.unwrap_err();
        assert!(matches!(err, PropagationError::ModelComputation { plant_id: None, .. }));
        assert!(sink.rows().is_empty());
    }

    #[tokio::test]
    async fn run_drains_the_channel_and_keeps_the_latest_value() {
        use crate::{config::OverflowPolicy, ingest::IngestSource, sources::ReplaySource};

        let sink = Arc::new(MemorySink::new());
        let engine = engine_with(
            vec![plant(1, 1, 5.0), plant(2, 2, 9.0)],
            Arc::new(PerformanceRatioSimulator::default()),
            sink.clone(),
        )
        .with_recv_timeout(Duration::from_millis(10));

        let events = vec![
            MeasurementEvent { ts: TS, meter_id: 1, power_kw: 5.0 },
            MeasurementEvent { ts: TS + time::Duration::minutes(1), meter_id: 1, power_kw: 6.0 },
            MeasurementEvent { ts: TS + time::Duration::minutes(2), meter_id: 99, power_kw: 1.0 },
        ];
        let cancel = CancellationToken::new();
        let (rx, handle) = IngestSource::new(ReplaySource::new(events), 8, OverflowPolicy::BlockProducer)
            .spawn(cancel.clone());

        let stats = engine.run(rx, cancel).await;
        handle.join().await.unwrap();

        assert_eq!(stats.events, 3);
        assert_eq!(stats.unknown_meter, 1);
        assert_eq!(stats.plants_updated, 2);
        let latest = engine.store().get(1).unwrap();
        assert_eq!(latest.last_updated_at, TS + time::Duration::minutes(1));
        assert!(engine.store().get(2).is_none());
        assert_eq!(sink.rows().len(), 2);
    }

    #[tokio::test]
    async fn run_returns_promptly_once_cancelled() {
        use crate::{config::OverflowPolicy, ingest::IngestSource, sources::ReplaySource};

        let engine = engine_with(
            vec![plant(1, 1, 5.0)],
            Arc::new(PerformanceRatioSimulator::default()),
            Arc::new(MemorySink::new()),
        )
        .with_recv_timeout(Duration::from_millis(10));

        let cancel = CancellationToken::new();
        let (rx, handle) = IngestSource::new(ReplaySource::new(Vec::new()), 8, OverflowPolicy::BlockProducer)
            .spawn(cancel.clone());
        cancel.cancel();

        let stats = tokio::time::timeout(Duration::from_secs(1), engine.run(rx, cancel))
            .await
            .unwrap();
        handle.join().await.unwrap();
        assert_eq!(stats, EngineStats::default());
    }

    /// Signals when a simulation starts, then takes a while to finish.
    struct SlowSimulator {
        started: Arc<tokio::sync::Notify>,
        delay: Duration,
    }

    impl PowerSimulator for SlowSimulator {
        fn simulate(
            &self,
            capacity: f64,
            slope: f64,
            orientation: f64,
            lat: f64,
            lon: f64,
            irradiance: Irradiance,
            ts: OffsetDateTime,
        ) -> Result<f64, ModelError> {
            self.started.notify_one();
            std::thread::sleep(self.delay);
            PerformanceRatioSimulator::default().simulate(capacity, slope, orientation, lat, lon, irradiance, ts)
        }
    }

    #[tokio::test]
    async fn stop_during_fan_out_still_completes_the_current_event() {
        use crate::{config::OverflowPolicy, ingest::IngestSource, sources::ReplaySource};

        let started = Arc::new(tokio::sync::Notify::new());
        let sink = Arc::new(MemorySink::new());
        let engine = engine_with(
            vec![plant(1, 1, 5.0)],
            Arc::new(SlowSimulator {
                started: Arc::clone(&started),
                delay: Duration::from_millis(150),
            }),
            sink.clone(),
        )
        .with_fanout_workers(1)
        .unwrap();

        let later = TS + time::Duration::minutes(1);
        let events = vec![
            MeasurementEvent { ts: TS, meter_id: 1, power_kw: 5.0 },
            MeasurementEvent { ts: later, meter_id: 1, power_kw: 6.0 },
        ];
        let cancel = CancellationToken::new();
        let (rx, handle) = IngestSource::new(ReplaySource::new(events), 8, OverflowPolicy::BlockProducer)
            .spawn(CancellationToken::new());

        let stop = async {
            started.notified().await;
            cancel.cancel();
        };
        let (stats, ()) = tokio::join!(engine.run(rx, cancel.clone()), stop);
        handle.join().await.unwrap();

        // the first event went all the way through; the second was never started
        assert_eq!(stats.events, 1);
        assert_eq!(stats.plants_updated, 1);
        let latest = engine.store().get(1).unwrap();
        assert_eq!(latest.last_updated_at, TS);
        let rows = sink.rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].plant_id, 1);
        assert_eq!(rows[0].ts, TS);
    }

    #[tokio::test]
    async fn partial_failures_reach_the_model_failure_counter() {
        let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
        let prom = recorder.handle();
        let _local = metrics::set_default_local_recorder(&recorder);

        let plants = vec![plant(1, 1, 5.0), plant(2, 1, -1.0), plant(3, 1, 2.0)];
        let engine = engine_with(
            plants,
            Arc::new(FailOnNegativeCapacity(PerformanceRatioSimulator::default())),
            Arc::new(MemorySink::new()),
        )
        .with_batch_policy(BatchPolicy::ApplyPartial);

        let mut stats = EngineStats::default();
        engine.handle_event(event(1, 5.0), &mut stats).await;

        assert_eq!(stats.model_failures, 1);
        assert_eq!(stats.plants_updated, 2);
        assert!(prom.render().contains("propagation_model_failures_total 1"));
    }
}
