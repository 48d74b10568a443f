//! Read-only prediction endpoint for the dashboard.
//!
//! GET /api/v1/predictions/latest — the most recently issued batch, one
//! entry per (variable, horizon) pair.

use axum::extract::State;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;
use utoipa::ToSchema;

use crate::db::queries;
use crate::errors::AppError;
use crate::helpers::dec_to_f64;
use crate::routes::observations::AppState;

/// One prediction from the latest batch.
#[derive(Debug, Serialize, ToSchema)]
pub struct PredictionResponse {
    pub horizon_minutes: i32,
    /// "temperature_c", "wind_speed_ms", or "pressure_hpa"
    pub variable: String,
    pub predicted_value: f64,
    pub lower_bound: f64,
    pub upper_bound: f64,
}

/// The latest prediction batch. All entries share `issued_at_utc` and
/// `model_version`.
#[derive(Debug, Serialize, ToSchema)]
pub struct PredictionSetResponse {
    pub station_id: String,
    pub issued_at_utc: DateTime<Utc>,
    pub model_version: String,
    pub predictions: Vec<PredictionResponse>,
}

/// The most recently issued predictions.
#[utoipa::path(
    get,
    path = "/api/v1/predictions/latest",
    tag = "Predictions",
    responses(
        (status = 200, description = "Latest prediction batch", body = PredictionSetResponse),
        (status = 404, description = "No predictions issued yet", body = crate::errors::ErrorResponse),
    )
)]
pub async fn get_latest_predictions(
    State(state): State<AppState>,
) -> Result<Json<PredictionSetResponse>, AppError> {
    let records = queries::latest_predictions(&state.pool, &state.station_id).await?;

    let first = records
        .first()
        .ok_or_else(|| AppError::NotFound("no predictions issued yet".to_string()))?;

    Ok(Json(PredictionSetResponse {
        station_id: first.station_id.clone(),
        issued_at_utc: first.issued_at_utc,
        model_version: first.model_version.clone(),
        predictions: records
            .iter()
            .map(|r| PredictionResponse {
                horizon_minutes: r.horizon_minutes,
                variable: r.variable.clone(),
                predicted_value: dec_to_f64(r.predicted_value),
                lower_bound: dec_to_f64(r.lower_bound),
                upper_bound: dec_to_f64(r.upper_bound),
            })
            .collect(),
    }))
}
