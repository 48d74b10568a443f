use chrono::{DateTime, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use sqlx::FromRow;
use uuid::Uuid;

/// One canonical weather observation for a station at a UTC slot.
///
/// `(station_id, timestamp_utc)` is the sole ordering/dedup key. Records are
/// immutable once written; a correction is an overwrite of the same key
/// (last write wins by ingest time), never an in-place edit of history.
#[derive(Debug, Clone, FromRow)]
pub struct ObservationRecord {
    pub station_id: String,
    pub timestamp_utc: DateTime<Utc>,
    /// Civil time at the station, derived from `timestamp_utc`.
    /// Display-only — never used for ordering or dedup.
    pub timestamp_local: NaiveDateTime,
    pub temperature_c: Decimal,
    pub wind_speed_ms: Decimal,
    pub wind_dir_deg: Decimal,
    pub humidity_pct: Decimal,
    pub pressure_hpa: Decimal,
    /// Ingest cycle that wrote (or last overwrote) this record.
    pub source_ingest_id: Uuid,
}

/// A short-horizon prediction for one variable, issued as part of a batch
/// sharing `issued_at_utc` and `model_version`.
///
/// Keyed by `(station_id, issued_at_utc, horizon_minutes, variable)`; never
/// mutated, superseded by batches with a newer `issued_at_utc`.
#[derive(Debug, Clone, FromRow)]
pub struct PredictionRecord {
    pub station_id: String,
    pub issued_at_utc: DateTime<Utc>,
    pub horizon_minutes: i32,
    pub variable: String,
    pub predicted_value: Decimal,
    pub lower_bound: Decimal,
    pub upper_bound: Decimal,
    pub model_version: String,
}
