//! Read-only observation endpoints for the dashboard.
//!
//! - GET /api/v1/observations/range?from=ISO8601&to=ISO8601
//! - GET /api/v1/observations/latest

use axum::extract::{Query, State};
use axum::Json;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use crate::db::{models, queries};
use crate::errors::AppError;
use crate::helpers::dec_to_f64;

/// Shared state for the read-only series endpoints.
#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) pool: sqlx::PgPool,
    pub(crate) station_id: String,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct RangeQuery {
    /// Range start in ISO 8601 (e.g. "2024-06-01T00:00:00Z"), inclusive
    pub from: String,
    /// Range end in ISO 8601, inclusive
    pub to: String,
}

/// One observation as the dashboard sees it.
#[derive(Debug, Serialize, ToSchema)]
pub struct ObservationResponse {
    pub station_id: String,
    pub timestamp_utc: DateTime<Utc>,
    /// Civil time at the station (derived, display-only)
    pub timestamp_local: NaiveDateTime,
    pub temperature_c: f64,
    pub wind_speed_ms: f64,
    pub wind_dir_deg: f64,
    pub humidity_pct: f64,
    pub pressure_hpa: f64,
    /// Ingest cycle that wrote this record
    pub source_ingest_id: Uuid,
}

impl From<&models::ObservationRecord> for ObservationResponse {
    fn from(rec: &models::ObservationRecord) -> Self {
        Self {
            station_id: rec.station_id.clone(),
            timestamp_utc: rec.timestamp_utc,
            timestamp_local: rec.timestamp_local,
            temperature_c: dec_to_f64(rec.temperature_c),
            wind_speed_ms: dec_to_f64(rec.wind_speed_ms),
            wind_dir_deg: dec_to_f64(rec.wind_dir_deg),
            humidity_pct: dec_to_f64(rec.humidity_pct),
            pressure_hpa: dec_to_f64(rec.pressure_hpa),
            source_ingest_id: rec.source_ingest_id,
        }
    }
}

/// Observations in a time range, ascending by timestamp.
#[utoipa::path(
    get,
    path = "/api/v1/observations/range",
    tag = "Observations",
    params(RangeQuery),
    responses(
        (status = 200, description = "Observations in range, ascending", body = [ObservationResponse]),
        (status = 400, description = "Invalid range", body = crate::errors::ErrorResponse),
    )
)]
pub async fn get_observation_range(
    State(state): State<AppState>,
    Query(query): Query<RangeQuery>,
) -> Result<Json<Vec<ObservationResponse>>, AppError> {
    let from = parse_datetime(&query.from, "from")?;
    let to = parse_datetime(&query.to, "to")?;
    if from > to {
        return Err(AppError::BadRequest(
            "'from' must not be after 'to'".to_string(),
        ));
    }

    let records = queries::observations_in_range(&state.pool, &state.station_id, from, to).await?;
    Ok(Json(records.iter().map(ObservationResponse::from).collect()))
}

/// The most recent observation.
#[utoipa::path(
    get,
    path = "/api/v1/observations/latest",
    tag = "Observations",
    responses(
        (status = 200, description = "Most recent observation", body = ObservationResponse),
        (status = 404, description = "No observations ingested yet", body = crate::errors::ErrorResponse),
    )
)]
pub async fn get_latest_observation(
    State(state): State<AppState>,
) -> Result<Json<ObservationResponse>, AppError> {
    let record = queries::latest_observation(&state.pool, &state.station_id)
        .await?
        .ok_or_else(|| AppError::NotFound("no observations ingested yet".to_string()))?;
    Ok(Json(ObservationResponse::from(&record)))
}

fn parse_datetime(value: &str, name: &str) -> Result<DateTime<Utc>, AppError> {
    value
        .parse::<DateTime<Utc>>()
        .map_err(|_| AppError::BadRequest(format!("invalid '{name}' datetime: {value}")))
}
