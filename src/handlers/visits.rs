use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::Serialize;

use super::{existing_session, user_id};
use crate::errors::AppError;
use crate::models::{ContactData, VisitConfirmation};
use crate::services::calendar::{generate_ics, google_calendar_url};
use crate::services::messaging::whatsapp::{booking_message, whatsapp_link};
use crate::state::AppState;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingLinks {
    pub ics: String,
    pub google_calendar: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub whatsapp: Option<String>,
}

#[derive(Serialize)]
pub struct BookingResponse {
    pub visit: VisitConfirmation,
    pub links: BookingLinks,
}

fn booking_links(state: &AppState, listing_id: &str, confirmation: &VisitConfirmation) -> BookingLinks {
    let business = &state.config.business_name;
    let agent_phone = confirmation
        .agent
        .as_ref()
        .and_then(|a| a.phone.clone())
        .or_else(|| state.config.agent_whatsapp.clone());
    let whatsapp = agent_phone.and_then(|phone| {
        whatsapp_link(
            &phone,
            &booking_message(confirmation, business, state.config.timezone),
        )
    });

    BookingLinks {
        ics: format!(
            "/api/listings/{listing_id}/visits/{}/ics",
            confirmation.visit_id
        ),
        google_calendar: google_calendar_url(confirmation, business),
        whatsapp,
    }
}

// POST /api/listings/:listing_id/visits
pub async fn create_visit(
    State(state): State<Arc<AppState>>,
    Path(listing_id): Path<String>,
    headers: HeaderMap,
    Json(contact): Json<ContactData>,
) -> Result<(StatusCode, Json<BookingResponse>), AppError> {
    let scheduler = existing_session(&state, &headers, &listing_id)?;
    let confirmation = scheduler.create_visit(contact).await?;
    let links = booking_links(&state, &listing_id, &confirmation);

    Ok((
        StatusCode::CREATED,
        Json(BookingResponse {
            visit: confirmation,
            links,
        }),
    ))
}

// GET /api/listings/:listing_id/visits/:visit_id/ics
pub async fn download_ics(
    State(state): State<Arc<AppState>>,
    Path((listing_id, raw_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    // Strip .ics suffix if present
    let visit_id = raw_id.strip_suffix(".ics").unwrap_or(&raw_id);

    let scheduler = state
        .existing_session(&user_id(&headers, &state.config), &listing_id)
        .ok_or_else(|| AppError::NotFound(format!("visit {visit_id}")))?;
    let visit = scheduler
        .visit(visit_id)
        .ok_or_else(|| AppError::NotFound(format!("visit {visit_id}")))?;
    let confirmation = scheduler
        .confirmation(visit_id)
        .ok_or_else(|| AppError::NotFound(format!("visit {visit_id}")))?;

    let ics = generate_ics(
        &confirmation,
        &state.config.business_name,
        visit.created_at.with_timezone(&Utc),
    );
    let filename = format!("visita-{visit_id}.ics");

    Ok((
        [
            (header::CONTENT_TYPE, "text/calendar; charset=utf-8".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            ),
        ],
        ics,
    )
        .into_response())
}
