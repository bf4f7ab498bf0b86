use chrono::{DateTime, FixedOffset, NaiveDate, Timelike, Weekday};
use serde::Serialize;

use crate::services::wire_time::wire_format;

/// Time-of-day bucket used to group slots within a day.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum DayPeriod {
    Morning,
    Afternoon,
    Evening,
}

impl DayPeriod {
    pub fn from_hour(hour: u32) -> Self {
        match hour {
            0..=11 => DayPeriod::Morning,
            12..=17 => DayPeriod::Afternoon,
            _ => DayPeriod::Evening,
        }
    }

    pub fn of<T: Timelike>(t: &T) -> Self {
        Self::from_hour(t.hour())
    }
}

/// One candidate day in the booking window.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DaySlot {
    pub date: NaiveDate,
    #[serde(serialize_with = "serialize_weekday")]
    pub weekday: Weekday,
    pub available_count: usize,
}

impl DaySlot {
    pub fn is_available(&self) -> bool {
        self.available_count > 0
    }
}

/// One slot on the selected day, as offered to the user.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TimeSlot {
    pub slot_id: String,
    /// Local start time, `HH:MM`.
    pub time: String,
    #[serde(with = "wire_format")]
    pub start: DateTime<FixedOffset>,
    #[serde(with = "wire_format")]
    pub end: DateTime<FixedOffset>,
    pub period: DayPeriod,
    pub available: bool,
}

fn serialize_weekday<S: serde::Serializer>(w: &Weekday, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&w.to_string().to_lowercase())
}
