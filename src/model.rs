use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc, Weekday};
use serde::{Deserialize, Serialize};

use crate::limits::MINUTES_PER_DAY;

/// Stable handle of a booking record in the backing store.
pub type BookingId = u64;

/// Numeric id of a chat user (requester or admin).
pub type UserId = i64;

/// A point on the day's slot grid, stored as minute of day (`"HH:MM"` on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Slot(u16);

impl Slot {
    pub fn new(minute_of_day: u16) -> Option<Self> {
        (minute_of_day < MINUTES_PER_DAY).then_some(Self(minute_of_day))
    }

    pub fn from_hm(hour: u8, minute: u8) -> Option<Self> {
        if hour >= 24 || minute >= 60 {
            return None;
        }
        Self::new(hour as u16 * 60 + minute as u16)
    }

    pub fn minute_of_day(self) -> u16 {
        self.0
    }

    pub fn hour(self) -> u8 {
        (self.0 / 60) as u8
    }

    pub fn minute(self) -> u8 {
        (self.0 % 60) as u8
    }

    /// True if the slot lies on a grid of `interval_min` minutes starting at 00:00.
    pub fn on_grid(self, interval_min: u16) -> bool {
        interval_min > 0 && self.0 % interval_min == 0
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour(), self.minute())
    }
}

impl FromStr for Slot {
    type Err = InputError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (h, m) = s
            .split_once(':')
            .ok_or_else(|| InputError::BadSlot(s.to_string()))?;
        if h.is_empty() || h.len() > 2 || m.len() != 2 {
            return Err(InputError::BadSlot(s.to_string()));
        }
        let hour: u8 = h.parse().map_err(|_| InputError::BadSlot(s.to_string()))?;
        let minute: u8 = m.parse().map_err(|_| InputError::BadSlot(s.to_string()))?;
        Slot::from_hm(hour, minute).ok_or_else(|| InputError::BadSlot(s.to_string()))
    }
}

/// Where a booking is in its lifecycle. Completion and cancellation delete the
/// record outright, so there is no variant for them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Rejected,
    /// Administrative hold on a slot.
    Blocked,
}

/// Statuses that occupy their slot.
pub const ACTIVE_STATUSES: [BookingStatus; 3] = [
    BookingStatus::Pending,
    BookingStatus::Confirmed,
    BookingStatus::Blocked,
];

impl BookingStatus {
    pub fn is_active(self) -> bool {
        ACTIVE_STATUSES.contains(&self)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Rejected => "rejected",
            BookingStatus::Blocked => "blocked",
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Add-on catalog ───────────────────────────────────────────────

/// Price of a wash without add-ons.
pub const BASE_PRICE: u32 = 90;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AddOn {
    Bleach,
    Powder,
    Softener,
    Gel,
}

impl AddOn {
    pub const ALL: [AddOn; 4] = [AddOn::Bleach, AddOn::Powder, AddOn::Softener, AddOn::Gel];

    pub fn price(self) -> u32 {
        match self {
            AddOn::Bleach => 20,
            AddOn::Powder => 15,
            AddOn::Softener => 20,
            AddOn::Gel => 20,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            AddOn::Bleach => "Bleach",
            AddOn::Powder => "Powder",
            AddOn::Softener => "Softener",
            AddOn::Gel => "Gel",
        }
    }

    pub fn from_label(label: &str) -> Option<AddOn> {
        let label = label.trim();
        AddOn::ALL
            .into_iter()
            .find(|a| a.label().eq_ignore_ascii_case(label))
    }
}

/// Total price of a wash with the given add-ons.
pub fn quote(add_ons: &BTreeSet<AddOn>) -> u32 {
    BASE_PRICE + add_ons.iter().map(|a| a.price()).sum::<u32>()
}

/// Human-readable add-on list, `"No add-ons"` when empty.
pub fn describe_add_ons(add_ons: &BTreeSet<AddOn>) -> String {
    if add_ons.is_empty() {
        return "No add-ons".to_string();
    }
    add_ons
        .iter()
        .map(|a| a.label())
        .collect::<Vec<_>>()
        .join(", ")
}

// ── Records ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: BookingId,
    pub requester_name: String,
    pub requester_link: String,
    /// Absent for administrative blocks.
    pub requester_id: Option<UserId>,
    pub date: NaiveDate,
    pub slot: Slot,
    pub status: BookingStatus,
    pub created_at: DateTime<Utc>,
    pub add_ons: BTreeSet<AddOn>,
    pub confirmed_by: Option<String>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub decline_reason: Option<String>,
}

impl Booking {
    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }
}

/// A booking that has not been assigned a store id yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewBooking {
    pub requester_name: String,
    pub requester_link: String,
    pub requester_id: Option<UserId>,
    pub date: NaiveDate,
    pub slot: Slot,
    pub status: BookingStatus,
    pub created_at: DateTime<Utc>,
    pub add_ons: BTreeSet<AddOn>,
}

impl NewBooking {
    /// Whether `stored` is this request as a store recorded it. The creation
    /// instant together with requester and slot identifies a request.
    pub fn is_stored_as(&self, stored: &Booking) -> bool {
        stored.created_at == self.created_at
            && stored.requester_id == self.requester_id
            && stored.requester_name == self.requester_name
            && stored.date == self.date
            && stored.slot == self.slot
            && stored.status == self.status
    }

    pub fn into_booking(self, id: BookingId) -> Booking {
        Booking {
            id,
            requester_name: self.requester_name,
            requester_link: self.requester_link,
            requester_id: self.requester_id,
            date: self.date,
            slot: self.slot,
            status: self.status,
            created_at: self.created_at,
            add_ons: self.add_ons,
            confirmed_by: None,
            confirmed_at: None,
            decline_reason: None,
        }
    }
}

/// Field updates applied by `BookingStore::update`. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingPatch {
    pub status: Option<BookingStatus>,
    pub confirmed_by: Option<String>,
    pub confirmed_at: Option<DateTime<Utc>>,
    /// `Some(None)` clears the reason.
    pub decline_reason: Option<Option<String>>,
}

impl BookingPatch {
    pub fn apply(&self, booking: &mut Booking) {
        if let Some(status) = self.status {
            booking.status = status;
        }
        if let Some(ref by) = self.confirmed_by {
            booking.confirmed_by = Some(by.clone());
        }
        if let Some(at) = self.confirmed_at {
            booking.confirmed_at = Some(at);
        }
        if let Some(ref reason) = self.decline_reason {
            booking.decline_reason = reason.clone();
        }
    }
}

/// Opening hours for one weekday: slots whose hour is in `[opens, closes)` are offered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub weekday: Weekday,
    pub opens: u8,
    pub closes: u8,
}

impl ScheduleEntry {
    pub fn covers_hour(&self, hour: u8) -> bool {
        self.opens <= hour && hour < self.closes
    }
}

// ── Queries ──────────────────────────────────────────────────────

/// In-process filter over the cached booking list.
#[derive(Debug, Clone, Default)]
pub struct BookingFilter {
    pub date: Option<NaiveDate>,
    pub requester: Option<UserId>,
    pub statuses: Option<Vec<BookingStatus>>,
}

impl BookingFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(mut self, date: NaiveDate) -> Self {
        self.date = Some(date);
        self
    }

    pub fn by(mut self, requester: UserId) -> Self {
        self.requester = Some(requester);
        self
    }

    pub fn with_statuses(mut self, statuses: &[BookingStatus]) -> Self {
        self.statuses = Some(statuses.to_vec());
        self
    }

    pub fn active(self) -> Self {
        self.with_statuses(&ACTIVE_STATUSES)
    }

    pub fn matches(&self, booking: &Booking) -> bool {
        if self.date.is_some_and(|d| d != booking.date) {
            return false;
        }
        if self.requester.is_some() && self.requester != booking.requester_id {
            return false;
        }
        if let Some(ref statuses) = self.statuses
            && !statuses.contains(&booking.status) {
                return false;
            }
        true
    }
}

// ── Boundary errors ──────────────────────────────────────────────

/// Malformed user input, rejected before it reaches the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputError {
    BadSlot(String),
    OffGrid(Slot),
    BadDate(String),
    OutsideWindow(NaiveDate),
    UnknownAddOn(String),
    BadProfileLink(String),
}

impl fmt::Display for InputError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputError::BadSlot(s) => write!(f, "not a time slot: {s:?}"),
            InputError::OffGrid(slot) => write!(f, "slot {slot} is not on the booking grid"),
            InputError::BadDate(s) => write!(f, "not a date: {s:?}"),
            InputError::OutsideWindow(d) => write!(f, "date {d} is outside the booking window"),
            InputError::UnknownAddOn(s) => write!(f, "unknown add-on: {s:?}"),
            InputError::BadProfileLink(s) => write!(f, "not a profile link: {s:?}"),
        }
    }
}

impl std::error::Error for InputError {}
