pub mod events;
pub mod health;
pub mod session;
pub mod visits;

use axum::http::HeaderMap;

use crate::config::AppConfig;
use crate::errors::AppError;
use crate::services::scheduler::Scheduler;
use crate::state::AppState;

pub const USER_HEADER: &str = "x-user-id";

/// Caller identity from the `x-user-id` header, else the configured default.
pub fn user_id(headers: &HeaderMap, config: &AppConfig) -> String {
    headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| config.default_user.clone())
}

/// The caller's session for `listing_id`. Only fetching availability opens a
/// session; every other route needs one to exist.
pub fn existing_session(
    state: &AppState,
    headers: &HeaderMap,
    listing_id: &str,
) -> Result<Scheduler, AppError> {
    let user = user_id(headers, &state.config);
    state.existing_session(&user, listing_id).ok_or_else(|| {
        AppError::NotFound(format!("no session for listing {listing_id}, fetch availability first"))
    })
}
