use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event, Sse};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::{BroadcastStream, IntervalStream};
use tokio_stream::StreamExt;

use super::existing_session;
use crate::errors::AppError;
use crate::state::AppState;

// GET /api/listings/:listing_id/events
pub async fn events_stream(
    State(state): State<Arc<AppState>>,
    Path(listing_id): Path<String>,
    headers: HeaderMap,
) -> Result<Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>>, AppError> {
    let scheduler = existing_session(&state, &headers, &listing_id)?;

    // Start with the current state so late subscribers are not blind.
    let snapshot = serde_json::to_string(&scheduler.snapshot()).unwrap_or_default();
    let initial = tokio_stream::once(Ok::<_, Infallible>(
        Event::default().data(snapshot).event("snapshot"),
    ));

    let live = BroadcastStream::new(scheduler.subscribe()).filter_map(|result| match result {
        Ok(event) => {
            let data = serde_json::to_string(&event).unwrap_or_default();
            Some(Ok(Event::default().data(data).event("session_event")))
        }
        Err(BroadcastStreamRecvError::Lagged(skipped)) => {
            tracing::debug!(skipped, "session event subscriber lagged");
            None
        }
    });

    let keepalive = IntervalStream::new(tokio::time::interval(Duration::from_secs(30)))
        .map(|_| Ok(Event::default().comment("keepalive")));

    Ok(Sse::new(initial.chain(live).merge(keepalive)))
}
