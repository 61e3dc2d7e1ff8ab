use anyhow::Result;
use propagation_service::{
    assignment::{assign_nearest_meters, persist_assignment},
    config::AppConfig,
    observability,
};
use sqlx::postgres::PgPoolOptions;
use std::env;

/// Recompute `pv_plants.nearest_meter_id` for every plant.
///
/// Pass `--dry-run` to log the changes without writing them.
#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let dry_run = env::args().skip(1).any(|a| a == "--dry-run");
    let cfg = AppConfig::load()?;

    let pool = PgPoolOptions::new()
        .max_connections(cfg.database.max_connections)
        .connect(&cfg.database.uri)
        .await?;

    let (plants, meters) = pv_client::db::get_lat_lon(&pool).await?;
    tracing::info!(plants = plants.len(), meters = meters.len(), "computing nearest meters");

    let assignment = assign_nearest_meters(&plants, &meters)?;
    let previous = pv_client::db::get_nearest_meters(&pool).await?;
    let changed = assignment.changed_from(&previous);

    tracing::info!(
        assigned = assignment.len(),
        skipped = plants.len() - assignment.len(),
        changed,
        "nearest meter assignment computed"
    );

    if dry_run {
        tracing::info!("dry run, not writing assignment");
        return Ok(());
    }

    persist_assignment(&pool, &assignment).await?;
    tracing::info!(plants = assignment.len(), "nearest meter assignment written");

    Ok(())
}
