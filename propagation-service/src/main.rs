use anyhow::Result;
use propagation_service::{
    api::{self, ApiState},
    config::{AppConfig, PlantLookup, SinkMode, SourceConfig, SourceKind},
    directory::{InMemoryPlantDirectory, PgPlantDirectory, PlantDirectory},
    engine::PropagationEngine,
    ingest::{EventReceiver, IngestHandle, IngestSource},
    metrics_server,
    models::{FixedSplitIrradianceEstimator, PerformanceRatioSimulator},
    observability,
    pipeline::{MeasurementEvent, PropagationError, Source},
    sinks::{MemorySink, PgLedgerSink, PgUpsertSink, RealtimePowerSink, RetryPolicy},
    sources::{HttpJsonSource, MeasurementCsvFileSource, MeasurementNdjsonFileSource},
    store::LatestPowerStore,
    transform::MeasurementValidation,
};
use sqlx::postgres::PgPoolOptions;
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;

fn spawn_ingest<S>(source: S, cfg: &SourceConfig, cancel: CancellationToken) -> (EventReceiver, IngestHandle)
where
    S: Source<MeasurementEvent> + 'static,
{
    IngestSource::new(source, cfg.channel_capacity, cfg.overflow)
        .with_transform(Arc::new(MeasurementValidation))
        .spawn(cancel)
}

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let cfg = AppConfig::load()?;

    if cfg.http.is_some() {
        metrics_server::install()?;
    }

    let pool = PgPoolOptions::new()
        .max_connections(cfg.database.max_connections)
        .connect(&cfg.database.uri)
        .await?;

    let meters = pv_client::db::get_meters(&pool).await?;
    if meters.is_empty() {
        return Err(PropagationError::Configuration("pv_meters is empty".to_string()).into());
    }

    let plants: Arc<dyn PlantDirectory> = match cfg.engine.plant_lookup {
        PlantLookup::Memory => {
            let directory = InMemoryPlantDirectory::from_plants(pv_client::db::get_plants(&pool).await?);
            if directory.unassigned_count() > 0 {
                tracing::warn!(
                    unassigned = directory.unassigned_count(),
                    "plants without a nearest meter will not be estimated; run update_nearest_meters"
                );
            }
            tracing::info!(meters = meters.len(), plants = directory.assigned_count(), "loaded reference data");
            Arc::new(directory)
        }
        PlantLookup::Database => {
            tracing::info!(meters = meters.len(), "loaded meters, plants are looked up per event");
            Arc::new(PgPlantDirectory::new(pool.clone()))
        }
    };

    let sink: Arc<dyn RealtimePowerSink> = match cfg.sink.mode {
        SinkMode::Ledger => Arc::new(PgLedgerSink::new(pool.clone())),
        SinkMode::Upsert => Arc::new(PgUpsertSink::new(pool.clone())),
        SinkMode::Memory => Arc::new(MemorySink::new()),
    };

    let store = LatestPowerStore::new();

    if let Some(http) = &cfg.http {
        api::serve(
            &http.bind_addr,
            ApiState {
                store: store.clone(),
                pool: Some(pool.clone()),
            },
        )
        .await?;
    }

    let engine = PropagationEngine::new(
        meters,
        plants,
        Arc::new(FixedSplitIrradianceEstimator::new(cfg.models.diffuse_fraction)),
        Arc::new(PerformanceRatioSimulator::new(cfg.models.performance_ratio)),
        store,
        sink,
    )?
    .with_batch_policy(cfg.engine.batch_policy)
    .with_recv_timeout(cfg.engine.recv_timeout())
    .with_retry(RetryPolicy::new(
        cfg.sink.max_retries,
        Duration::from_millis(cfg.sink.retry_backoff_ms),
    ))
    .with_fanout_workers(cfg.engine.fanout_workers)?;

    let cancel = CancellationToken::new();
    let (events, ingest) = match &cfg.source.kind {
        SourceKind::CsvFile { path } => spawn_ingest(MeasurementCsvFileSource::new(path), &cfg.source, cancel.clone()),
        SourceKind::NdjsonFile { path } => {
            spawn_ingest(MeasurementNdjsonFileSource::new(path), &cfg.source, cancel.clone())
        }
        SourceKind::Http { bind_addr } => {
            let source = HttpJsonSource::new(bind_addr, cfg.source.channel_capacity).await?;
            spawn_ingest(source, &cfg.source, cancel.clone())
        }
    };

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for shutdown signal");
            return;
        }
        tracing::info!("shutdown signal received");
        shutdown.cancel();
    });

    let stats = engine.run(events, cancel).await;
    ingest.stop();
    let ingest_stats = ingest.join().await?;

    tracing::info!(
        events = stats.events,
        produced = ingest_stats.produced,
        rejected = ingest_stats.rejected,
        total_power_kw = engine.store().total_power_kw(),
        "propagation service stopped"
    );

    Ok(())
}
