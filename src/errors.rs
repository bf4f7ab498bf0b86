use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Failures talking to the remote availability/booking API.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("request timed out")]
    Timeout,

    #[error("{message}")]
    Server { status: u16, message: String },

    #[error("unexpected response: {0}")]
    Decode(String),

    #[error("invalid API URL: {0}")]
    InvalidUrl(String),
}

impl ApiError {
    /// Whether a GET may be repeated after this failure.
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::Transport(e) => !e.is_decode() && !e.is_builder(),
            ApiError::Timeout => true,
            ApiError::Server { status, .. } => *status == 429 || *status >= 500,
            ApiError::Decode(_) | ApiError::InvalidUrl(_) => false,
        }
    }

    /// Whether the request may never have reached the server. Only these are
    /// safe to repeat for a booking, and only with the same idempotency key.
    pub fn is_connection_failure(&self) -> bool {
        match self {
            ApiError::Transport(e) => e.is_connect() || e.is_timeout() || e.is_request(),
            ApiError::Timeout => true,
            _ => false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("{0}")]
    Validation(String),

    #[error("invalid contact data: {}", .0.join(", "))]
    InvalidContact(Vec<String>),

    #[error("no slot at {date} {time}")]
    SlotNotFound { date: String, time: String },

    #[error("slot {0} is not available")]
    SlotUnavailable(String),

    #[error("cannot {operation} while {phase}")]
    InvalidState {
        operation: &'static str,
        phase: &'static str,
    },

    #[error("request superseded by a newer one")]
    Superseded,

    #[error("request cancelled")]
    Cancelled,

    #[error("time conversion error: {0}")]
    Time(String),

    #[error(transparent)]
    Api(#[from] ApiError),
}

impl SchedulerError {
    /// Text stored as the session's current error and shown to the user.
    pub fn user_message(&self) -> String {
        match self {
            // Server-provided messages are surfaced verbatim.
            SchedulerError::Api(ApiError::Server { message, .. }) => message.clone(),
            SchedulerError::Api(ApiError::Timeout) => {
                "The server took too long to respond. Please try again.".to_string()
            }
            SchedulerError::Api(ApiError::Transport(_)) => {
                "Could not reach the server. Check your connection and try again.".to_string()
            }
            other => other.to_string(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::Scheduler(e) => match e {
                SchedulerError::Validation(_)
                | SchedulerError::InvalidContact(_)
                | SchedulerError::Time(_) => StatusCode::BAD_REQUEST,
                SchedulerError::SlotNotFound { .. } => StatusCode::NOT_FOUND,
                SchedulerError::SlotUnavailable(_)
                | SchedulerError::InvalidState { .. }
                | SchedulerError::Superseded
                | SchedulerError::Cancelled => StatusCode::CONFLICT,
                SchedulerError::Api(ApiError::Timeout) => StatusCode::GATEWAY_TIMEOUT,
                SchedulerError::Api(_) => StatusCode::BAD_GATEWAY,
            },
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
        };

        let message = match &self {
            AppError::Scheduler(e) => e.user_message(),
            other => other.to_string(),
        };

        let body = serde_json::json!({ "error": message });
        (status, axum::Json(body)).into_response()
    }
}
