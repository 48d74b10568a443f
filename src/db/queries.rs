use chrono::{DateTime, Utc};
use sqlx::PgPool;

use super::models::{ObservationRecord, PredictionRecord};

/// Ascending range read, shared by the eager route handler path
/// (`observations_in_range`) and the streamed path (`SeriesStore::range`).
pub(crate) const OBSERVATIONS_RANGE_SQL: &str =
    "SELECT station_id, timestamp_utc, timestamp_local,
            temperature_c, wind_speed_ms, wind_dir_deg, humidity_pct, pressure_hpa,
            source_ingest_id
     FROM observations
     WHERE station_id = $1 AND timestamp_utc >= $2 AND timestamp_utc <= $3
     ORDER BY timestamp_utc ASC";

/// Upsert one observation, idempotent by `(station_id, timestamp_utc)`.
/// Re-ingesting an existing slot overwrites deterministically (last write
/// wins); it never duplicates the key.
pub async fn upsert_observation(
    pool: &PgPool,
    record: &ObservationRecord,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO observations (
            station_id, timestamp_utc, timestamp_local,
            temperature_c, wind_speed_ms, wind_dir_deg, humidity_pct, pressure_hpa,
            source_ingest_id, created_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, NOW())
        ON CONFLICT (station_id, timestamp_utc) DO UPDATE SET
            timestamp_local = EXCLUDED.timestamp_local,
            temperature_c = EXCLUDED.temperature_c,
            wind_speed_ms = EXCLUDED.wind_speed_ms,
            wind_dir_deg = EXCLUDED.wind_dir_deg,
            humidity_pct = EXCLUDED.humidity_pct,
            pressure_hpa = EXCLUDED.pressure_hpa,
            source_ingest_id = EXCLUDED.source_ingest_id",
    )
    .bind(&record.station_id)
    .bind(record.timestamp_utc)
    .bind(record.timestamp_local)
    .bind(record.temperature_c)
    .bind(record.wind_speed_ms)
    .bind(record.wind_dir_deg)
    .bind(record.humidity_pct)
    .bind(record.pressure_hpa)
    .bind(record.source_ingest_id)
    .execute(pool)
    .await?;

    Ok(())
}

/// All observations for a station in `[from, to]`, ascending by timestamp.
pub async fn observations_in_range(
    pool: &PgPool,
    station_id: &str,
    from_utc: DateTime<Utc>,
    to_utc: DateTime<Utc>,
) -> Result<Vec<ObservationRecord>, sqlx::Error> {
    sqlx::query_as::<_, ObservationRecord>(OBSERVATIONS_RANGE_SQL)
        .bind(station_id)
        .bind(from_utc)
        .bind(to_utc)
        .fetch_all(pool)
        .await
}

/// The most recent observation for a station, if any.
pub async fn latest_observation(
    pool: &PgPool,
    station_id: &str,
) -> Result<Option<ObservationRecord>, sqlx::Error> {
    sqlx::query_as::<_, ObservationRecord>(
        "SELECT station_id, timestamp_utc, timestamp_local,
                temperature_c, wind_speed_ms, wind_dir_deg, humidity_pct, pressure_hpa,
                source_ingest_id
         FROM observations
         WHERE station_id = $1
         ORDER BY timestamp_utc DESC
         LIMIT 1",
    )
    .bind(station_id)
    .fetch_optional(pool)
    .await
}

/// Insert one prediction, idempotent by its full key. Replaying the same
/// batch is a deterministic overwrite, not a duplicate.
pub async fn insert_prediction(
    pool: &PgPool,
    record: &PredictionRecord,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO predictions (
            station_id, issued_at_utc, horizon_minutes, variable,
            predicted_value, lower_bound, upper_bound, model_version, created_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW())
        ON CONFLICT (station_id, issued_at_utc, horizon_minutes, variable) DO UPDATE SET
            predicted_value = EXCLUDED.predicted_value,
            lower_bound = EXCLUDED.lower_bound,
            upper_bound = EXCLUDED.upper_bound,
            model_version = EXCLUDED.model_version",
    )
    .bind(&record.station_id)
    .bind(record.issued_at_utc)
    .bind(record.horizon_minutes)
    .bind(&record.variable)
    .bind(record.predicted_value)
    .bind(record.lower_bound)
    .bind(record.upper_bound)
    .bind(&record.model_version)
    .execute(pool)
    .await?;

    Ok(())
}

/// The most recently issued prediction batch for a station (all horizons and
/// variables sharing the newest `issued_at_utc`).
pub async fn latest_predictions(
    pool: &PgPool,
    station_id: &str,
) -> Result<Vec<PredictionRecord>, sqlx::Error> {
    sqlx::query_as::<_, PredictionRecord>(
        "SELECT station_id, issued_at_utc, horizon_minutes, variable,
                predicted_value, lower_bound, upper_bound, model_version
         FROM predictions
         WHERE station_id = $1
           AND issued_at_utc = (
               SELECT MAX(issued_at_utc) FROM predictions WHERE station_id = $1
           )
         ORDER BY horizon_minutes, variable",
    )
    .bind(station_id)
    .fetch_all(pool)
    .await
}
