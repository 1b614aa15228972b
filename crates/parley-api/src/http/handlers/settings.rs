//! Remote service settings handlers.
//!
//! API keys are accepted on create but only ever returned as a redacted hint.

use axum::Json;
use axum::extract::{Path, State};
use uuid::Uuid;

use parley_core::repository::SettingsRepository;
use parley_types::settings::ServiceSettingsSummary;

use crate::http::error::AppError;
use crate::http::response::{ApiResponse, RequestTimer};
use crate::state::{AppState, NewSettings};

/// POST /api/v1/settings
pub async fn create_settings(
    State(state): State<AppState>,
    Json(body): Json<NewSettings>,
) -> Result<Json<ApiResponse<ServiceSettingsSummary>>, AppError> {
    let timer = RequestTimer::start();
    let summary = state.create_settings(body).await?;
    let activate = format!("/api/v1/settings/{}/activate", summary.id);
    Ok(Json(timer.respond(summary).with_link("activate", &activate)))
}

/// GET /api/v1/settings
pub async fn list_settings(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<Vec<ServiceSettingsSummary>>>, AppError> {
    let timer = RequestTimer::start();
    let all = state.settings.list_settings().await?;
    Ok(Json(
        timer.respond(all.iter().map(|s| s.summary()).collect()),
    ))
}

/// GET /api/v1/settings/active - The active settings, or `null`.
pub async fn get_active_settings(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<Option<ServiceSettingsSummary>>>, AppError> {
    let timer = RequestTimer::start();
    let active = state.active_settings().await?;
    Ok(Json(timer.respond(active.map(|s| s.summary()))))
}

/// POST /api/v1/settings/:id/activate
pub async fn activate_settings(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<ServiceSettingsSummary>>, AppError> {
    let timer = RequestTimer::start();
    let summary = state.activate_settings(id).await?;
    Ok(Json(timer.respond(summary)))
}
