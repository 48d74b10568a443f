//! Ingest loop status endpoint.
//!
//! GET /api/v1/ingest/status — the current scheduling state, last cycle
//! result, and gap bookkeeping as JSON.

use axum::extract::State;
use axum::Json;

use crate::services::ingest::{ProcessState, SharedProcessState};

/// Current ingest loop status.
///
/// Reports the next scheduled tick, the last cycle's outcome and record
/// count, coalesced ticks, recorded gaps, and the last forecast pass.
#[utoipa::path(
    get,
    path = "/api/v1/ingest/status",
    tag = "Ingest",
    responses(
        (status = 200, description = "Current ingest loop status", body = ProcessState),
    )
)]
pub async fn get_ingest_status(State(state): State<SharedProcessState>) -> Json<ProcessState> {
    let s = state.read().await;
    Json(s.clone())
}
