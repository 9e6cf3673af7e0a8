use std::collections::HashSet;

use chrono::{Datelike, NaiveDate, TimeDelta};

use crate::limits::*;
use crate::model::*;

// ── Slot grid ─────────────────────────────────────────────────────

/// The service clock at the moment of a query, in service time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalNow {
    pub date: NaiveDate,
    pub minute: u16,
}

/// Every slot of a day at `interval_min` spacing, starting at 00:00.
pub fn all_slots(interval_min: u16) -> Vec<Slot> {
    if interval_min == 0 {
        return Vec::new();
    }
    (0..MINUTES_PER_DAY)
        .step_by(interval_min as usize)
        .filter_map(Slot::new)
        .collect()
}

/// Slots inside the opening hours for `date`'s weekday. A weekday with no
/// schedule entry has no slots.
pub fn open_slots(date: NaiveDate, schedule: &[ScheduleEntry], interval_min: u16) -> Vec<Slot> {
    let Some(entry) = schedule.iter().find(|e| e.weekday == date.weekday()) else {
        return Vec::new();
    };
    all_slots(interval_min)
        .into_iter()
        .filter(|s| entry.covers_hour(s.hour()))
        .collect()
}

/// Open slots on `date` not held by an active booking and, if `date` is
/// today, strictly after the current minute. Ascending order.
pub fn free_slots(
    date: NaiveDate,
    schedule: &[ScheduleEntry],
    bookings: &[Booking],
    interval_min: u16,
    now: LocalNow,
) -> Vec<Slot> {
    if date < now.date {
        return Vec::new();
    }
    let taken: HashSet<Slot> = bookings
        .iter()
        .filter(|b| b.date == date && b.is_active())
        .map(|b| b.slot)
        .collect();

    open_slots(date, schedule, interval_min)
        .into_iter()
        .filter(|s| !taken.contains(s))
        .filter(|s| date != now.date || s.minute_of_day() > now.minute)
        .collect()
}

// ── Booking window ────────────────────────────────────────────────

/// Two calendar weeks starting at the Monday of `today`'s week, minus the
/// days already gone. Never before `today`, never past `today + 13`.
pub fn booking_window(today: NaiveDate) -> Vec<NaiveDate> {
    let monday = today - TimeDelta::days(today.weekday().num_days_from_monday() as i64);
    (0..BOOKING_WINDOW_DAYS)
        .map(|i| monday + TimeDelta::days(i))
        .filter(|d| *d >= today)
        .collect()
}

/// Window dates with at least one free slot.
pub fn available_dates(
    schedule: &[ScheduleEntry],
    bookings: &[Booking],
    interval_min: u16,
    now: LocalNow,
) -> Vec<NaiveDate> {
    booking_window(now.date)
        .into_iter()
        .filter(|d| !free_slots(*d, schedule, bookings, interval_min, now).is_empty())
        .collect()
}

/// Active bookings `requester` holds on `date`.
pub fn active_count(bookings: &[Booking], requester: UserId, date: NaiveDate) -> usize {
    bookings
        .iter()
        .filter(|b| b.requester_id == Some(requester) && b.date == date && b.is_active())
        .count()
}
