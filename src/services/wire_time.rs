//! Conversion between wall-clock times in the listing's timezone and the
//! absolute timestamp strings exchanged with the visit API.
//!
//! Wire strings are RFC 3339 with seconds precision and an explicit offset,
//! e.g. `2024-06-10T09:00:00-04:00`. The offset is always derived from the
//! timezone database for the instant being formatted, so daylight-saving
//! changes are honoured.

use chrono::{DateTime, Duration, FixedOffset, LocalResult, NaiveDate, NaiveDateTime, TimeZone};
use chrono_tz::Tz;

use crate::errors::SchedulerError;
use crate::models::VisitSlot;

pub const WIRE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%:z";

/// Formats a local wall-clock time in `tz` as a wire timestamp.
///
/// Times skipped by a DST transition are rejected. Times repeated by a
/// transition resolve to the earlier instant.
pub fn format_rfc3339(local: NaiveDateTime, tz: Tz) -> Result<String, SchedulerError> {
    let instant = resolve_local(local, tz).ok_or_else(|| {
        SchedulerError::Time(format!("{local} does not exist in {}", tz.name()))
    })?;
    Ok(format_instant(&instant))
}

pub fn format_instant<Z: TimeZone>(instant: &DateTime<Z>) -> String
where
    Z::Offset: std::fmt::Display,
{
    instant.format(WIRE_FORMAT).to_string()
}

pub fn parse_rfc3339(s: &str) -> Result<DateTime<FixedOffset>, SchedulerError> {
    DateTime::parse_from_rfc3339(s.trim())
        .map_err(|e| SchedulerError::Time(format!("invalid timestamp {s:?}: {e}")))
}

fn resolve_local(local: NaiveDateTime, tz: Tz) -> Option<DateTime<Tz>> {
    match tz.from_local_datetime(&local) {
        LocalResult::Single(dt) => Some(dt),
        LocalResult::Ambiguous(earliest, _) => Some(earliest),
        LocalResult::None => None,
    }
}

/// First instant of `date` in `tz`. When midnight falls inside a DST gap the
/// day starts at the first wall-clock minute that exists.
pub fn day_start(date: NaiveDate, tz: Tz) -> Result<DateTime<Tz>, SchedulerError> {
    let midnight = date.and_hms_opt(0, 0, 0).unwrap_or_default();
    first_existing(midnight, tz)
}

/// Last whole second of `date` in `tz`.
pub fn day_end(date: NaiveDate, tz: Tz) -> Result<DateTime<Tz>, SchedulerError> {
    let next = date
        .succ_opt()
        .ok_or_else(|| SchedulerError::Time(format!("no day after {date}")))?;
    Ok(day_start(next, tz)? - Duration::seconds(1))
}

fn first_existing(local: NaiveDateTime, tz: Tz) -> Result<DateTime<Tz>, SchedulerError> {
    // Gaps are at most a couple of hours.
    let mut candidate = local;
    for _ in 0..=240 {
        if let Some(dt) = resolve_local(candidate, tz) {
            return Ok(dt);
        }
        candidate += Duration::minutes(1);
    }
    Err(SchedulerError::Time(format!("{local} does not exist in {}", tz.name())))
}

/// Wire range covering `start..=end` as whole local days.
pub fn range_bounds(
    start: NaiveDate,
    end: NaiveDate,
    tz: Tz,
) -> Result<(String, String), SchedulerError> {
    Ok((
        format_instant(&day_start(start, tz)?),
        format_instant(&day_end(end, tz)?),
    ))
}

pub fn is_slot_available<Z: TimeZone>(slot: &VisitSlot, now: &DateTime<Z>) -> bool {
    slot.status.is_open() && slot.start > *now
}

/// Token for one booking attempt: millisecond timestamp plus a random suffix.
pub fn generate_idempotency_key() -> String {
    format!(
        "visit-{}-{}",
        chrono::Utc::now().timestamp_millis(),
        uuid::Uuid::new_v4().simple()
    )
}

/// serde adapter keeping wire timestamps at seconds precision.
pub mod wire_format {
    use chrono::{DateTime, FixedOffset};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(dt: &DateTime<FixedOffset>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::format_instant(dt))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<FixedOffset>, D::Error> {
        let raw = String::deserialize(d)?;
        DateTime::parse_from_rfc3339(raw.trim()).map_err(serde::de::Error::custom)
    }
}
