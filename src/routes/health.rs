use axum::extract::State;
use axum::Json;
use serde::Serialize;
use utoipa::ToSchema;

use crate::routes::observations::AppState;

/// Health check response.
#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    /// Service status ("ok" when healthy, "degraded" when DB is unreachable)
    pub status: String,
    /// Service version
    pub version: String,
    /// Station this instance ingests
    pub station_id: String,
    /// Whether the series store is reachable
    pub database: bool,
}

/// Health check endpoint.
///
/// Verifies store connectivity with a trivial query. Returns "degraded"
/// (still 200) when the store is unreachable, so load balancers can tell
/// partial failures from dead instances.
#[utoipa::path(
    get,
    path = "/api/v1/health",
    tag = "Health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse),
    )
)]
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let db_ok = sqlx::query_scalar::<_, i32>("SELECT 1")
        .fetch_one(&state.pool)
        .await
        .is_ok();

    Json(HealthResponse {
        status: if db_ok {
            "ok".to_string()
        } else {
            "degraded".to_string()
        },
        version: env!("CARGO_PKG_VERSION").to_string(),
        station_id: state.station_id.clone(),
        database: db_ok,
    })
}
