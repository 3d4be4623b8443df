//! Bookable windows of a counselor on a calendar date.
//!
//! Entries are keyed by a concrete date, not a weekday. Matching is plain
//! calendar-date equality; "Today" and "Tomorrow" only exist in
//! [`day_label`].

use crate::types::{DayAvailability, TimeSlot};
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use validator::Validate;

/// Normalizes an incoming date to calendar-day granularity.
///
/// Accepts `YYYY-MM-DD`, RFC 3339 timestamps and naive
/// `YYYY-MM-DDTHH:MM:SS` values. The date is taken as written: time of day
/// and offset are dropped, never converted.
pub fn calendar_date(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        return Some(date);
    }
    if let Ok(datetime) = DateTime::parse_from_rfc3339(value) {
        return Some(datetime.date_naive());
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M:%S"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
        .map(|datetime| datetime.date())
}

/// Slots of the first entry declared for `date`, or nothing.
pub fn slots_for_date(availability: &[DayAvailability], date: NaiveDate) -> &[TimeSlot] {
    availability
        .iter()
        .find(|entry| entry.day == date)
        .map(|entry| entry.slots.as_slice())
        .unwrap_or(&[])
}

/// A slot is elapsed once its start time is reached on its own date.
/// Everything on a past date is elapsed too.
pub fn is_elapsed(date: NaiveDate, slot: &TimeSlot, now: NaiveDateTime) -> bool {
    let today = now.date();
    if date != today {
        return date < today;
    }
    match slot.start() {
        Some(start) => start <= now.time(),
        None => true,
    }
}

/// What a client may pick for `date`, given the wall clock `now`.
pub fn bookable_slots(
    availability: &[DayAvailability],
    date: NaiveDate,
    now: NaiveDateTime,
) -> Vec<TimeSlot> {
    slots_for_date(availability, date)
        .iter()
        .filter(|slot| !is_elapsed(date, slot, now))
        .cloned()
        .collect()
}

pub fn day_label(date: NaiveDate, today: NaiveDate) -> String {
    if date == today {
        "Today".into()
    } else if today.succ_opt() == Some(date) {
        "Tomorrow".into()
    } else {
        date.format("%B %-d, %Y").to_string()
    }
}

/// Checks a schedule before it replaces the stored one.
pub fn validate_schedule(availability: &[DayAvailability]) -> Result<(), String> {
    for entry in availability {
        entry
            .validate()
            .map_err(|err| format!("invalid slot on {}: {err}", entry.day))?;

        for (index, slot) in entry.slots.iter().enumerate() {
            if let Some(other) = entry.slots[index + 1..]
                .iter()
                .find(|other| slot.overlaps(other))
            {
                return Err(format!(
                    "slots {slot} and {other} on {} overlap",
                    entry.day
                ));
            }
        }
    }
    Ok(())
}
