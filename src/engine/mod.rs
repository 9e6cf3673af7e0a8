mod availability;
mod error;
mod lifecycle;

pub use availability::{
    LocalNow, active_count, all_slots, available_dates, booking_window, free_slots, open_slots,
};
pub use error::EngineError;
pub use lifecycle::BookingRequest;

use std::sync::Arc;

use chrono::NaiveDate;
use tokio::sync::Mutex;

use crate::cache::TtlCache;
use crate::clock::{Clock, ServiceTime};
use crate::config::Config;
use crate::limits::*;
use crate::model::*;
use crate::store::{StoreError, Stores};

/// Cached payloads. One list per entity kind, one cache key each.
#[derive(Debug, Clone)]
pub enum Snapshot {
    Bookings(Arc<Vec<Booking>>),
    Schedule(Arc<Vec<ScheduleEntry>>),
    Blacklist(Arc<Vec<String>>),
}

pub type SnapshotCache = TtlCache<Snapshot>;

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub slot_interval_min: u16,
    pub max_slots_per_day: usize,
    pub service_time: ServiceTime,
}

impl Default for EngineSettings {
    fn default() -> Self {
        EngineSettings::from(&Config::default())
    }
}

impl From<&Config> for EngineSettings {
    fn from(cfg: &Config) -> Self {
        Self {
            slot_interval_min: cfg.slot_interval_min,
            max_slots_per_day: cfg.max_slots_per_day,
            service_time: cfg.service_time,
        }
    }
}

/// Booking engine: cached reads over the record store, availability, and
/// the booking lifecycle. Cheap to share behind an `Arc`.
pub struct Engine {
    pub(super) stores: Stores,
    pub(super) cache: Arc<SnapshotCache>,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) settings: EngineSettings,
    /// Serializes check-then-write sequences within this process.
    pub(super) writes: Mutex<()>,
}

fn mismatch(key: &str) -> EngineError {
    EngineError::Store(StoreError::Malformed(format!("unexpected payload under {key}")))
}

impl Engine {
    pub fn new(
        stores: Stores,
        cache: Arc<SnapshotCache>,
        clock: Arc<dyn Clock>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            stores,
            cache,
            clock,
            settings,
            writes: Mutex::new(()),
        }
    }

    pub fn cache(&self) -> &Arc<SnapshotCache> {
        &self.cache
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn local_now(&self) -> LocalNow {
        let now = self.clock.now();
        let st = self.settings.service_time;
        LocalNow {
            date: st.today(now),
            minute: st.minute_of_day(now),
        }
    }

    pub fn today(&self) -> NaiveDate {
        self.local_now().date
    }

    // ── Cached bulk reads ────────────────────────────────────────

    pub async fn all_bookings(&self) -> Result<Arc<Vec<Booking>>, EngineError> {
        let store = self.stores.bookings.clone();
        let snapshot = self
            .cache
            .get(BOOKINGS_KEY, None, move || async move {
                store.fetch_all().await.map(|v| Snapshot::Bookings(Arc::new(v)))
            })
            .await?;
        match snapshot {
            Snapshot::Bookings(list) => Ok(list),
            _ => Err(mismatch(BOOKINGS_KEY)),
        }
    }

    pub async fn schedule(&self) -> Result<Arc<Vec<ScheduleEntry>>, EngineError> {
        let store = self.stores.schedule.clone();
        let snapshot = self
            .cache
            .get(SCHEDULE_KEY, None, move || async move {
                store.fetch_all().await.map(|v| Snapshot::Schedule(Arc::new(v)))
            })
            .await?;
        match snapshot {
            Snapshot::Schedule(list) => Ok(list),
            _ => Err(mismatch(SCHEDULE_KEY)),
        }
    }

    pub async fn blacklist(&self) -> Result<Arc<Vec<String>>, EngineError> {
        let store = self.stores.blacklist.clone();
        let snapshot = self
            .cache
            .get(BLACKLIST_KEY, None, move || async move {
                store.fetch_all().await.map(|v| Snapshot::Blacklist(Arc::new(v)))
            })
            .await?;
        match snapshot {
            Snapshot::Blacklist(list) => Ok(list),
            _ => Err(mismatch(BLACKLIST_KEY)),
        }
    }

    /// Drop every booking-derived key.
    pub fn invalidate_bookings(&self) -> usize {
        self.cache.invalidate_pattern(BOOKINGS_PREFIX)
    }

    /// Bypass the cache: drop the booking list and load it again.
    pub async fn fresh_bookings(&self) -> Result<Arc<Vec<Booking>>, EngineError> {
        self.invalidate_bookings();
        self.all_bookings().await
    }

    // ── Queries ──────────────────────────────────────────────────

    /// Matching bookings, ordered by (date, slot).
    pub async fn bookings(&self, filter: &BookingFilter) -> Result<Vec<Booking>, EngineError> {
        let all = self.all_bookings().await?;
        let mut out: Vec<Booking> = all.iter().filter(|b| filter.matches(b)).cloned().collect();
        out.sort_by_key(|b| (b.date, b.slot, b.id));
        Ok(out)
    }

    pub async fn booking(&self, id: BookingId) -> Result<Option<Booking>, EngineError> {
        let all = self.all_bookings().await?;
        Ok(all.iter().find(|b| b.id == id).cloned())
    }

    pub async fn active_bookings_for(&self, requester: UserId) -> Result<Vec<Booking>, EngineError> {
        self.bookings(&BookingFilter::new().by(requester).active()).await
    }

    pub async fn pending_bookings(&self) -> Result<Vec<Booking>, EngineError> {
        self.bookings(&BookingFilter::new().with_statuses(&[BookingStatus::Pending]))
            .await
    }

    pub async fn confirmed_bookings(&self) -> Result<Vec<Booking>, EngineError> {
        self.bookings(&BookingFilter::new().with_statuses(&[BookingStatus::Confirmed]))
            .await
    }

    pub async fn confirmed_on(&self, date: NaiveDate) -> Result<Vec<Booking>, EngineError> {
        self.bookings(
            &BookingFilter::new()
                .on(date)
                .with_statuses(&[BookingStatus::Confirmed]),
        )
        .await
    }

    pub async fn admin_blocks(&self) -> Result<Vec<Booking>, EngineError> {
        self.bookings(&BookingFilter::new().with_statuses(&[BookingStatus::Blocked]))
            .await
    }

    pub async fn is_slot_free(&self, date: NaiveDate, slot: Slot) -> Result<bool, EngineError> {
        let all = self.all_bookings().await?;
        Ok(!all
            .iter()
            .any(|b| b.date == date && b.slot == slot && b.is_active()))
    }

    pub async fn is_blacklisted(&self, identity: &str) -> Result<bool, EngineError> {
        let list = self.blacklist().await?;
        Ok(list.iter().any(|e| e == identity))
    }

    // ── Availability ─────────────────────────────────────────────

    pub async fn free_slots(&self, date: NaiveDate) -> Result<Vec<Slot>, EngineError> {
        let schedule = self.schedule().await?;
        let bookings = self.all_bookings().await?;
        Ok(free_slots(
            date,
            &schedule,
            &bookings,
            self.settings.slot_interval_min,
            self.local_now(),
        ))
    }

    pub fn booking_window(&self) -> Vec<NaiveDate> {
        booking_window(self.today())
    }

    pub async fn available_dates(&self) -> Result<Vec<NaiveDate>, EngineError> {
        let schedule = self.schedule().await?;
        let bookings = self.all_bookings().await?;
        Ok(available_dates(
            &schedule,
            &bookings,
            self.settings.slot_interval_min,
            self.local_now(),
        ))
    }
}
