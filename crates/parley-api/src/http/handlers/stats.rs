//! Health and pipeline statistics.

use axum::Json;
use axum::extract::State;

use crate::http::error::AppError;
use crate::http::response::{ApiResponse, RequestTimer};
use crate::state::{AppState, StatusSnapshot};

/// GET /health
pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// GET /api/v1/stats - Task counts, open batches, queue headroom and
/// unretried failures.
pub async fn get_stats(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<StatusSnapshot>>, AppError> {
    let timer = RequestTimer::start();
    let snapshot = state.status_snapshot().await?;
    Ok(Json(timer.respond(snapshot)))
}
