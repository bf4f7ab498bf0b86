use chrono::{DateTime, FixedOffset, NaiveDate};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::services::wire_time::wire_format;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SlotStatus {
    Open,
    Blocked,
    Reserved,
    Confirmed,
}

impl SlotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlotStatus::Open => "open",
            SlotStatus::Blocked => "blocked",
            SlotStatus::Reserved => "reserved",
            SlotStatus::Confirmed => "confirmed",
        }
    }

    pub fn is_open(&self) -> bool {
        *self == SlotStatus::Open
    }

    /// Booking only moves forward: open -> reserved -> confirmed.
    pub fn can_advance_to(&self, next: SlotStatus) -> bool {
        matches!(
            (self, next),
            (SlotStatus::Open, SlotStatus::Reserved)
                | (SlotStatus::Open, SlotStatus::Confirmed)
                | (SlotStatus::Reserved, SlotStatus::Confirmed)
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SlotSource {
    Owner,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VisitSlot {
    pub id: String,
    #[serde(alias = "listing_id")]
    pub listing_id: String,
    #[serde(with = "wire_format")]
    pub start: DateTime<FixedOffset>,
    #[serde(with = "wire_format")]
    pub end: DateTime<FixedOffset>,
    pub status: SlotStatus,
    pub source: SlotSource,
    #[serde(with = "wire_format", alias = "created_at")]
    pub created_at: DateTime<FixedOffset>,
}

impl VisitSlot {
    pub fn is_well_formed(&self) -> bool {
        self.start < self.end
    }

    pub fn local_date(&self, tz: Tz) -> NaiveDate {
        self.start.with_timezone(&tz).date_naive()
    }

    /// Local start time as `HH:MM`.
    pub fn local_time(&self, tz: Tz) -> String {
        self.start.with_timezone(&tz).format("%H:%M").to_string()
    }

    pub fn duration_minutes(&self) -> i64 {
        (self.end - self.start).num_minutes()
    }
}

/// Body of the availability query endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailabilityResponse {
    #[serde(alias = "listing_id")]
    pub listing_id: String,
    pub timezone: String,
    #[serde(default)]
    pub slots: Vec<VisitSlot>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAYLOAD: &str = r#"{
        "listingId": "bldg-42",
        "timezone": "America/Santiago",
        "slots": [
            {"id":"s1","listingId":"bldg-42","start":"2024-06-10T09:00:00-04:00","end":"2024-06-10T09:30:00-04:00","status":"open","source":"system","createdAt":"2024-06-01T12:00:00Z"},
            {"id":"s2","listing_id":"bldg-42","start":"2024-06-10T09:30:00-04:00","end":"2024-06-10T10:00:00-04:00","status":"reserved","source":"owner","created_at":"2024-06-01T12:00:00Z"}
        ]
    }"#;

    #[test]
    fn test_parse_availability_payload() {
        let resp: AvailabilityResponse = serde_json::from_str(PAYLOAD).unwrap();
        assert_eq!(resp.listing_id, "bldg-42");
        assert_eq!(resp.slots.len(), 2);
        assert_eq!(resp.slots[0].status, SlotStatus::Open);
        assert_eq!(resp.slots[1].source, SlotSource::Owner);
        assert_eq!(resp.slots[1].listing_id, "bldg-42");
    }

    #[test]
    fn test_slot_serializes_with_seconds_precision() {
        let resp: AvailabilityResponse = serde_json::from_str(PAYLOAD).unwrap();
        let json = serde_json::to_value(&resp.slots[0]).unwrap();
        assert_eq!(json["start"], "2024-06-10T09:00:00-04:00");
        assert_eq!(json["createdAt"], "2024-06-01T12:00:00+00:00");
        assert_eq!(json["status"], "open");
    }

    #[test]
    fn test_local_projection() {
        let resp: AvailabilityResponse = serde_json::from_str(PAYLOAD).unwrap();
        let slot = &resp.slots[0];
        let tz = chrono_tz::America::Santiago;
        assert_eq!(slot.local_date(tz), NaiveDate::from_ymd_opt(2024, 6, 10).unwrap());
        assert_eq!(slot.local_time(tz), "09:00");
        assert_eq!(slot.duration_minutes(), 30);
        assert!(slot.is_well_formed());
    }

    #[test]
    fn test_status_transitions_are_monotonic() {
        assert!(SlotStatus::Open.can_advance_to(SlotStatus::Reserved));
        assert!(SlotStatus::Reserved.can_advance_to(SlotStatus::Confirmed));
        assert!(!SlotStatus::Confirmed.can_advance_to(SlotStatus::Reserved));
        assert!(!SlotStatus::Reserved.can_advance_to(SlotStatus::Open));
        assert!(!SlotStatus::Blocked.can_advance_to(SlotStatus::Reserved));
    }

    #[test]
    fn test_rejects_unknown_status() {
        let raw = r#"{"id":"s","listingId":"l","start":"2024-06-10T09:00:00-04:00","end":"2024-06-10T09:30:00-04:00","status":"maybe","source":"system","createdAt":"2024-06-01T12:00:00Z"}"#;
        assert!(serde_json::from_str::<VisitSlot>(raw).is_err());
    }
}
