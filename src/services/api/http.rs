use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;
use serde::de::DeserializeOwned;

use super::{RetryPolicy, VisitApi};
use crate::errors::ApiError;
use crate::models::{AvailabilityResponse, VisitConfirmation, VisitRequest};

pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

const GENERIC_FETCH_ERROR: &str = "Could not load availability. Please try again.";
const GENERIC_BOOKING_ERROR: &str = "Could not schedule the visit. Please try again.";

pub struct HttpVisitApi {
    base_url: Url,
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl HttpVisitApi {
    pub fn new(base_url: &str, timeout: Duration, retry: RetryPolicy) -> Result<Self, ApiError> {
        let base_url = normalize_base_url(base_url)?;
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url,
            client,
            retry,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, ApiError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ApiError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn try_fetch(&self, url: &Url, start: &str, end: &str) -> Result<AvailabilityResponse, ApiError> {
        let resp = self
            .client
            .get(url.clone())
            .query(&[("start", start), ("end", end)])
            .send()
            .await
            .map_err(classify)?;
        read_json(resp, "error", GENERIC_FETCH_ERROR).await
    }

    async fn try_book(&self, url: &Url, request: &VisitRequest) -> Result<VisitConfirmation, ApiError> {
        let resp = self
            .client
            .post(url.clone())
            .header(IDEMPOTENCY_HEADER, &request.idempotency_key)
            .json(request)
            .send()
            .await
            .map_err(classify)?;
        read_json(resp, "message", GENERIC_BOOKING_ERROR).await
    }
}

#[async_trait]
impl VisitApi for HttpVisitApi {
    async fn fetch_availability(
        &self,
        listing_id: &str,
        start: &str,
        end: &str,
    ) -> Result<AvailabilityResponse, ApiError> {
        let url = self.endpoint(&["api", "listings", listing_id, "availability"])?;

        let mut attempt = 0;
        loop {
            match self.try_fetch(&url, start, end).await {
                Ok(resp) => return Ok(resp),
                Err(e) if e.is_retryable() && attempt < self.retry.fetch_retries => {
                    let delay = self.retry.delay(attempt);
                    tracing::warn!(
                        listing_id,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "availability fetch failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn create_visit(&self, request: &VisitRequest) -> Result<VisitConfirmation, ApiError> {
        let url = self.endpoint(&["api", "visits"])?;

        let mut attempt = 0;
        loop {
            match self.try_book(&url, request).await {
                Ok(confirmation) => return Ok(confirmation),
                // Same idempotency key, so a duplicate delivery cannot double-book.
                Err(e) if e.is_connection_failure() && attempt < self.retry.booking_retries => {
                    let delay = self.retry.delay(attempt);
                    tracing::warn!(
                        slot_id = %request.slot_id,
                        idempotency_key = %request.idempotency_key,
                        attempt = attempt + 1,
                        error = %e,
                        "booking request did not complete, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn classify(e: reqwest::Error) -> ApiError {
    if e.is_timeout() {
        ApiError::Timeout
    } else {
        ApiError::Transport(e)
    }
}

/// Decodes a 2xx body, or turns an error body into `ApiError::Server` using
/// the message stored under `message_field`.
async fn read_json<T: DeserializeOwned>(
    resp: reqwest::Response,
    message_field: &str,
    fallback: &str,
) -> Result<T, ApiError> {
    let status = resp.status();
    let body = resp.text().await.map_err(classify)?;

    if !status.is_success() {
        return Err(ApiError::Server {
            status: status.as_u16(),
            message: server_message(&body, message_field).unwrap_or_else(|| fallback.to_string()),
        });
    }

    serde_json::from_str(&body).map_err(|e| ApiError::Decode(e.to_string()))
}

fn server_message(body: &str, field: &str) -> Option<String> {
    let data: serde_json::Value = serde_json::from_str(body).ok()?;
    data.get(field)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(str::to_string)
}

fn normalize_base_url(raw: &str) -> Result<Url, ApiError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ApiError::InvalidUrl("empty".to_string()));
    }
    let url = Url::parse(trimmed).map_err(|e| ApiError::InvalidUrl(format!("{trimmed}: {e}")))?;
    if url.cannot_be_a_base() {
        return Err(ApiError::InvalidUrl(trimmed.to_string()));
    }
    Ok(url)
}
