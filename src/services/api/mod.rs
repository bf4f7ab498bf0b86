pub mod http;

use std::time::Duration;

use async_trait::async_trait;

use crate::errors::ApiError;
use crate::models::{AvailabilityResponse, VisitConfirmation, VisitRequest};

/// Remote availability and booking service.
#[async_trait]
pub trait VisitApi: Send + Sync {
    /// `start` and `end` are wire timestamps.
    async fn fetch_availability(
        &self,
        listing_id: &str,
        start: &str,
        end: &str,
    ) -> Result<AvailabilityResponse, ApiError>;

    async fn create_visit(&self, request: &VisitRequest) -> Result<VisitConfirmation, ApiError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Extra attempts for the availability query.
    pub fetch_retries: u32,
    /// Extra attempts for a booking whose request may not have arrived.
    pub booking_retries: u32,
    pub backoff_base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            fetch_retries: 3,
            booking_retries: 1,
            backoff_base: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            fetch_retries: 0,
            booking_retries: 0,
            backoff_base: Duration::ZERO,
        }
    }

    /// Exponential backoff before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        self.backoff_base.saturating_mul(2u32.saturating_pow(attempt.min(16)))
    }
}
