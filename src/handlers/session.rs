use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use chrono::NaiveDate;
use serde::Deserialize;

use super::{existing_session, user_id};
use crate::errors::AppError;
use crate::services::scheduler::SessionSnapshot;
use crate::state::AppState;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchRequest {
    pub start_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
}

// POST /api/listings/:listing_id/availability
pub async fn fetch_availability(
    State(state): State<Arc<AppState>>,
    Path(listing_id): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<FetchRequest>,
) -> Result<Json<SessionSnapshot>, AppError> {
    let scheduler = state.session(&user_id(&headers, &state.config), &listing_id);

    // Without an end date, cover the whole candidate window.
    let end = payload.end_date.unwrap_or_else(|| {
        scheduler
            .settings()
            .day_policy
            .candidate_days(payload.start_date)
            .last()
            .copied()
            .unwrap_or(payload.start_date)
    });

    scheduler.fetch_availability(payload.start_date, end).await?;
    Ok(Json(scheduler.snapshot()))
}

// DELETE /api/listings/:listing_id/availability
pub async fn cancel_fetch(
    State(state): State<Arc<AppState>>,
    Path(listing_id): Path<String>,
    headers: HeaderMap,
) -> Json<serde_json::Value> {
    let cancelled = state
        .existing_session(&user_id(&headers, &state.config), &listing_id)
        .map(|s| s.cancel_fetch())
        .unwrap_or(false);
    Json(serde_json::json!({ "cancelled": cancelled }))
}

// GET /api/listings/:listing_id/session
pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(listing_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<SessionSnapshot>, AppError> {
    let scheduler = existing_session(&state, &headers, &listing_id)?;
    Ok(Json(scheduler.snapshot()))
}

#[derive(Deserialize)]
pub struct SelectionRequest {
    pub date: NaiveDate,
    pub time: Option<String>,
}

// POST /api/listings/:listing_id/selection
pub async fn select(
    State(state): State<Arc<AppState>>,
    Path(listing_id): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<SelectionRequest>,
) -> Result<Json<SessionSnapshot>, AppError> {
    let scheduler = existing_session(&state, &headers, &listing_id)?;
    match payload.time.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
        Some(time) => {
            scheduler.select_date_time(payload.date, time)?;
        }
        None => scheduler.select_date(payload.date)?,
    }
    Ok(Json(scheduler.snapshot()))
}

// DELETE /api/listings/:listing_id/selection
pub async fn clear_selection(
    State(state): State<Arc<AppState>>,
    Path(listing_id): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode, AppError> {
    let scheduler = existing_session(&state, &headers, &listing_id)?;
    scheduler.clear_selection()?;
    Ok(StatusCode::NO_CONTENT)
}

// DELETE /api/listings/:listing_id/error
pub async fn clear_error(
    State(state): State<Arc<AppState>>,
    Path(listing_id): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode, AppError> {
    let scheduler = existing_session(&state, &headers, &listing_id)?;
    scheduler.clear_error()?;
    Ok(StatusCode::NO_CONTENT)
}
