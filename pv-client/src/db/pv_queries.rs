use std::collections::HashMap;

use sqlx::{PgPool, Postgres, QueryBuilder};
use time::OffsetDateTime;

use crate::{
    domain::{Meter, MeterId, Plant, PlantId, RealtimeDataPoint, SiteLocation},
    error::{check_arity, Error},
};

const PLANT_COLUMNS: &str = r#"
    id,
    xtf_id,
    lat,
    lon,
    installed_capacity_kw,
    slope_deg,
    orientation_deg,
    municipality,
    canton,
    zipcode,
    address,
    nearest_meter_id
"#;

/// Load all reference meters keyed by id.
pub async fn get_meters(pool: &PgPool) -> Result<HashMap<MeterId, Meter>, Error> {
    let rows = sqlx::query_as::<_, Meter>(
        r#"
        SELECT
            id,
            utility,
            lat,
            lon,
            installed_capacity_kw,
            slope_deg,
            orientation_deg,
            municipality,
            address
        FROM pv_meters
        ORDER BY id
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(|m| (m.id, m)).collect())
}

/// Load every plant, in id order.
pub async fn get_plants(pool: &PgPool) -> Result<Vec<Plant>, Error> {
    let sql = format!("SELECT {PLANT_COLUMNS} FROM pv_plants ORDER BY id");
    let rows = sqlx::query_as::<_, Plant>(&sql).fetch_all(pool).await?;
    Ok(rows)
}

/// Plants whose estimate is derived from `meter_id`.
pub async fn get_affected_plants(pool: &PgPool, meter_id: MeterId) -> Result<Vec<Plant>, Error> {
    let sql = format!("SELECT {PLANT_COLUMNS} FROM pv_plants WHERE nearest_meter_id = $1 ORDER BY id");
    let rows = sqlx::query_as::<_, Plant>(&sql)
        .bind(meter_id)
        .fetch_all(pool)
        .await?;
    Ok(rows)
}

/// Locations of plants and meters, both in id order.
pub async fn get_lat_lon(pool: &PgPool) -> Result<(Vec<SiteLocation>, Vec<SiteLocation>), Error> {
    let plants = sqlx::query_as::<_, SiteLocation>("SELECT id, lat, lon FROM pv_plants ORDER BY id")
        .fetch_all(pool)
        .await?;
    let meters = sqlx::query_as::<_, SiteLocation>("SELECT id, lat, lon FROM pv_meters ORDER BY id")
        .fetch_all(pool)
        .await?;
    Ok((plants, meters))
}

/// Current `nearest_meter_id` per plant, used to report assignment changes.
pub async fn get_nearest_meters(pool: &PgPool) -> Result<HashMap<PlantId, MeterId>, Error> {
    let rows: Vec<(PlantId, Option<MeterId>)> =
        sqlx::query_as("SELECT id, nearest_meter_id FROM pv_plants")
            .fetch_all(pool)
            .await?;
    Ok(rows
        .into_iter()
        .filter_map(|(plant, meter)| meter.map(|m| (plant, m)))
        .collect())
}

/// Persist the nearest-meter assignment in one transaction.
pub async fn set_nearest_meters(
    pool: &PgPool,
    plant_ids: &[PlantId],
    meter_ids: &[MeterId],
) -> Result<(), Error> {
    check_arity("plant_ids", plant_ids, "meter_ids", meter_ids)?;

    let mut tx = pool.begin().await?;
    for (plant_id, meter_id) in plant_ids.iter().zip(meter_ids) {
        sqlx::query("UPDATE pv_plants SET nearest_meter_id = $1 WHERE id = $2")
            .bind(*meter_id)
            .bind(*plant_id)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;
    Ok(())
}

/// Append one ledger row per plant. All rows are written or none.
pub async fn insert_realtime_power(
    pool: &PgPool,
    ts: OffsetDateTime,
    plant_ids: &[PlantId],
    powers_kw: &[f64],
) -> Result<u64, Error> {
    check_arity("plant_ids", plant_ids, "powers_kw", powers_kw)?;
    if plant_ids.is_empty() {
        return Ok(0);
    }

    let mut builder = QueryBuilder::<Postgres>::new("INSERT INTO pv_realtime (ts, plant_id, power_kw) ");
    builder.push_values(plant_ids.iter().zip(powers_kw), |mut b, (plant_id, power_kw)| {
        b.push_bind(ts).push_bind(*plant_id).push_bind(*power_kw);
    });

    let result = builder.build().execute(pool).await?;
    Ok(result.rows_affected())
}

/// Overwrite `pv_plants.power_kw` in place. History is lost.
pub async fn upsert_realtime_power(
    pool: &PgPool,
    plant_ids: &[PlantId],
    powers_kw: &[f64],
) -> Result<u64, Error> {
    check_arity("plant_ids", plant_ids, "powers_kw", powers_kw)?;

    let mut tx = pool.begin().await?;
    let mut affected = 0;
    for (plant_id, power_kw) in plant_ids.iter().zip(powers_kw) {
        let result = sqlx::query("UPDATE pv_plants SET power_kw = $1 WHERE id = $2")
            .bind(*power_kw)
            .bind(*plant_id)
            .execute(&mut *tx)
            .await?;
        affected += result.rows_affected();
    }
    tx.commit().await?;
    Ok(affected)
}

/// Sum of the latest ledger row per plant.
pub async fn get_total_realtime_power(pool: &PgPool) -> Result<f64, Error> {
    let total: Option<f64> = sqlx::query_scalar(
        r#"
        SELECT SUM(latest.power_kw)
        FROM (
            SELECT DISTINCT ON (plant_id) plant_id, power_kw
            FROM pv_realtime
            ORDER BY plant_id, ts DESC
        ) latest
        "#,
    )
    .fetch_one(pool)
    .await?;

    Ok(total.unwrap_or(0.0))
}

/// Ledger rows in `[start, end)` with the location of their plant.
pub async fn get_real_time_data(
    pool: &PgPool,
    start: OffsetDateTime,
    end: OffsetDateTime,
) -> Result<Vec<RealtimeDataPoint>, Error> {
    let rows = sqlx::query_as::<_, RealtimeDataPoint>(
        r#"
        SELECT
            r.ts,
            r.power_kw,
            p.lat,
            p.lon
        FROM pv_realtime r
        JOIN pv_plants p ON p.id = r.plant_id
        WHERE r.ts >= $1
          AND r.ts <  $2
        ORDER BY r.ts, r.plant_id
        "#,
    )
    .bind(start)
    .bind(end)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}
