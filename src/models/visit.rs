use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

use crate::models::{ContactData, SlotStatus};
use crate::services::wire_time::wire_format;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VisitStatus {
    Pending,
    Confirmed,
    Canceled,
    NoShow,
    Completed,
}

impl VisitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VisitStatus::Pending => "pending",
            VisitStatus::Confirmed => "confirmed",
            VisitStatus::Canceled => "canceled",
            VisitStatus::NoShow => "no_show",
            VisitStatus::Completed => "completed",
        }
    }

    pub fn is_active(&self) -> bool {
        *self != VisitStatus::Canceled
    }

    /// Slot status implied by a visit in this state, if it holds the slot.
    pub fn slot_status(&self) -> Option<SlotStatus> {
        match self {
            VisitStatus::Pending => Some(SlotStatus::Reserved),
            VisitStatus::Confirmed | VisitStatus::Completed | VisitStatus::NoShow => {
                Some(SlotStatus::Confirmed)
            }
            VisitStatus::Canceled => None,
        }
    }
}

/// A booked visit as recorded in the local session ledger.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Visit {
    pub id: String,
    pub listing_id: String,
    pub slot_id: String,
    pub user_id: String,
    pub status: VisitStatus,
    #[serde(with = "wire_format")]
    pub created_at: DateTime<FixedOffset>,
    pub idempotency_key: String,
    pub agent_id: Option<String>,
}

/// Body of the booking submission endpoint. The idempotency key is also sent
/// as the `Idempotency-Key` header.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VisitRequest {
    pub listing_id: String,
    pub slot_id: String,
    pub user_id: String,
    pub channel: String,
    pub idempotency_key: String,
    pub contact: ContactData,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentContact {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BookedInterval {
    #[serde(with = "wire_format")]
    pub start: DateTime<FixedOffset>,
    #[serde(with = "wire_format")]
    pub end: DateTime<FixedOffset>,
}

/// Successful response of the booking submission endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VisitConfirmation {
    pub visit_id: String,
    pub status: VisitStatus,
    #[serde(default)]
    pub agent: Option<AgentContact>,
    pub slot: BookedInterval,
    #[serde(default)]
    pub message: String,
}
