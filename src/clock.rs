use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, NaiveTime, TimeDelta, Timelike, Utc};

use crate::model::{InputError, Slot};

/// Source of "now". Injected so tests can drive time by hand.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(at: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(at) }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = at;
    }

    pub fn advance(&self, by: TimeDelta) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The service's fixed time zone. Every "today", window and slot-start
/// computation goes through here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceTime {
    offset: FixedOffset,
}

impl ServiceTime {
    pub fn from_offset_hours(hours: i32) -> Option<Self> {
        let seconds = hours.checked_mul(3600)?;
        FixedOffset::east_opt(seconds).map(|offset| Self { offset })
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    pub fn local(&self, at: DateTime<Utc>) -> DateTime<FixedOffset> {
        at.with_timezone(&self.offset)
    }

    pub fn today(&self, at: DateTime<Utc>) -> NaiveDate {
        self.local(at).date_naive()
    }

    /// Minute of day in service time.
    pub fn minute_of_day(&self, at: DateTime<Utc>) -> u16 {
        let local = self.local(at).time();
        (local.hour() * 60 + local.minute()) as u16
    }

    /// The UTC instant at which `slot` on `date` starts.
    pub fn slot_start(&self, date: NaiveDate, slot: Slot) -> DateTime<Utc> {
        let naive = date.and_time(NaiveTime::MIN) + TimeDelta::minutes(slot.minute_of_day() as i64);
        (naive - TimeDelta::seconds(self.offset.local_minus_utc() as i64)).and_utc()
    }
}

impl Default for ServiceTime {
    /// UTC+3.
    fn default() -> Self {
        Self::from_offset_hours(3).expect("UTC+3 is a valid offset")
    }
}

// ── Date labels ──────────────────────────────────────────────────

const WEEKDAY_SHORT: [&str; 7] = ["Mo", "Tu", "We", "Th", "Fr", "Sa", "Su"];
const LABEL_DATE_FORMAT: &str = "%d.%m.%y";

/// `"Mo - 19.10.26"`
pub fn format_date_label(date: NaiveDate) -> String {
    let wd = WEEKDAY_SHORT[date.weekday().num_days_from_monday() as usize];
    format!("{wd} - {}", date.format(LABEL_DATE_FORMAT))
}

/// Inverse of [`format_date_label`]. The weekday prefix is optional and ignored.
pub fn parse_date_label(text: &str) -> Result<NaiveDate, InputError> {
    let text = text.trim();
    let date_part = match text.split_once('-') {
        Some((_, rest)) => rest.trim(),
        None => text,
    };
    NaiveDate::parse_from_str(date_part, LABEL_DATE_FORMAT)
        .map_err(|_| InputError::BadDate(text.to_string()))
}
