use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::state::AppState;

pub fn build(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health::health))
        .route(
            "/api/listings/:listing_id/availability",
            post(handlers::session::fetch_availability).delete(handlers::session::cancel_fetch),
        )
        .route(
            "/api/listings/:listing_id/session",
            get(handlers::session::get_session),
        )
        .route(
            "/api/listings/:listing_id/selection",
            post(handlers::session::select).delete(handlers::session::clear_selection),
        )
        .route(
            "/api/listings/:listing_id/error",
            axum::routing::delete(handlers::session::clear_error),
        )
        .route(
            "/api/listings/:listing_id/visits",
            post(handlers::visits::create_visit),
        )
        .route(
            "/api/listings/:listing_id/visits/:visit_id/ics",
            get(handlers::visits::download_ics),
        )
        .route(
            "/api/listings/:listing_id/events",
            get(handlers::events::events_stream),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
