use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Weekday};
use chrono_tz::Tz;

use crate::models::{DayPeriod, DaySlot, TimeSlot, VisitSlot};
use crate::services::wire_time::is_slot_available;

/// Which calendar days are offered for visits.
#[derive(Debug, Clone, PartialEq)]
pub struct DayPolicy {
    pub window_days: usize,
    pub excluded_weekdays: Vec<Weekday>,
}

impl Default for DayPolicy {
    fn default() -> Self {
        Self::new(5, vec![Weekday::Sat, Weekday::Sun])
    }
}

impl DayPolicy {
    pub fn new(window_days: usize, excluded_weekdays: Vec<Weekday>) -> Self {
        Self {
            window_days,
            excluded_weekdays,
        }
    }

    pub fn allows(&self, date: NaiveDate) -> bool {
        !self.excluded_weekdays.contains(&date.weekday())
    }

    /// The next `window_days` allowed dates starting at `from` (inclusive).
    pub fn candidate_days(&self, from: NaiveDate) -> Vec<NaiveDate> {
        if self.excluded_weekdays.len() >= 7 {
            return Vec::new();
        }
        from.iter_days()
            .filter(|d| self.allows(*d))
            .take(self.window_days)
            .collect()
    }
}

/// Groups the fetched slots onto the candidate days. Every candidate day is
/// returned, including days with nothing available.
pub fn project_days<Z: TimeZone>(
    slots: &[VisitSlot],
    policy: &DayPolicy,
    from: NaiveDate,
    tz: Tz,
    now: &DateTime<Z>,
) -> Vec<DaySlot> {
    policy
        .candidate_days(from)
        .into_iter()
        .map(|date| DaySlot {
            date,
            weekday: date.weekday(),
            available_count: slots
                .iter()
                .filter(|s| s.local_date(tz) == date && is_slot_available(s, now))
                .count(),
        })
        .collect()
}

/// Slots starting on `date`, ordered by start time.
pub fn project_time_slots<Z: TimeZone>(
    slots: &[VisitSlot],
    date: NaiveDate,
    tz: Tz,
    now: &DateTime<Z>,
) -> Vec<TimeSlot> {
    let mut day: Vec<&VisitSlot> = slots.iter().filter(|s| s.local_date(tz) == date).collect();
    day.sort_by_key(|s| s.start);

    day.into_iter()
        .map(|s| TimeSlot {
            slot_id: s.id.clone(),
            time: s.local_time(tz),
            start: s.start,
            end: s.end,
            period: DayPeriod::of(&s.start.with_timezone(&tz)),
            available: is_slot_available(s, now),
        })
        .collect()
}

/// Finds the slot starting at local `date` `time` (`HH:MM`).
///
/// When a DST fall-back repeats the wall-clock time, several slots can match;
/// the earliest bookable one wins, otherwise the earliest match.
pub fn find_slot<'a, Z: TimeZone>(
    slots: &'a [VisitSlot],
    date: NaiveDate,
    time: &str,
    tz: Tz,
    now: &DateTime<Z>,
) -> Option<&'a VisitSlot> {
    let mut matches: Vec<&VisitSlot> = slots
        .iter()
        .filter(|s| s.local_date(tz) == date && s.local_time(tz) == time)
        .collect();
    matches.sort_by_key(|s| s.start);
    matches
        .iter()
        .find(|s| is_slot_available(s, now))
        .or_else(|| matches.first())
        .copied()
}
