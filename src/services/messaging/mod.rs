pub mod webhook;
pub mod whatsapp;

use async_trait::async_trait;
use serde::Serialize;

use crate::models::{ContactData, VisitConfirmation};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingNotice {
    pub listing_id: String,
    pub contact: ContactData,
    pub confirmation: VisitConfirmation,
}

/// Fire-and-forget delivery of booking notifications. Failures are logged by
/// the caller and never affect the booking.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn visit_booked(&self, notice: &BookingNotice) -> anyhow::Result<()>;
}
