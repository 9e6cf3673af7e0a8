use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::model::{Booking, BookingId, BookingPatch, NewBooking, ScheduleEntry};

use super::{BlacklistStore, BookingStore, ChangeProbe, ScheduleStore, StoreError};

/// Process-local backend. Used by tests and demos; supports injected latency
/// and transient failures so the cache and retry paths can be exercised.
pub struct MemoryStore {
    bookings: DashMap<BookingId, Booking>,
    next_id: AtomicU64,
    schedule: Mutex<Vec<ScheduleEntry>>,
    blacklist: Mutex<Vec<String>>,
    last_modified: Mutex<Option<DateTime<Utc>>>,
    latency: Mutex<Option<Duration>>,
    failures: AtomicU32,
    lost_acks: AtomicU32,
    booking_fetches: AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            bookings: DashMap::new(),
            next_id: AtomicU64::new(1),
            schedule: Mutex::new(Vec::new()),
            blacklist: Mutex::new(Vec::new()),
            last_modified: Mutex::new(None),
            latency: Mutex::new(None),
            failures: AtomicU32::new(0),
            lost_acks: AtomicU32::new(0),
            booking_fetches: AtomicU64::new(0),
        }
    }

    pub fn with_schedule(self, schedule: Vec<ScheduleEntry>) -> Self {
        *self.schedule.lock().unwrap_or_else(PoisonError::into_inner) = schedule;
        self
    }

    pub fn set_schedule(&self, schedule: Vec<ScheduleEntry>) {
        *self.schedule.lock().unwrap_or_else(PoisonError::into_inner) = schedule;
        self.touch();
    }

    /// Insert a record as-is, bypassing the engine. Returns its id.
    pub fn seed(&self, booking: NewBooking) -> BookingId {
        self.insert(booking).id
    }

    fn insert(&self, booking: NewBooking) -> Booking {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let booking = booking.into_booking(id);
        self.bookings.insert(id, booking.clone());
        booking
    }

    /// Every call sleeps this long before touching state.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock().unwrap_or_else(PoisonError::into_inner) = latency;
    }

    /// The next `n` calls fail with `StoreError::Unavailable`.
    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// The next `n` booking appends are stored, then reported as failed, as
    /// when a reply is lost on the way back from a remote store.
    pub fn lose_next_acks(&self, n: u32) {
        self.lost_acks.store(n, Ordering::SeqCst);
    }

    pub fn failures_remaining(&self) -> u32 {
        self.failures.load(Ordering::SeqCst)
    }

    /// How many times the booking list has been read.
    pub fn booking_fetches(&self) -> u64 {
        self.booking_fetches.load(Ordering::SeqCst)
    }

    pub fn set_last_modified(&self, at: Option<DateTime<Utc>>) {
        *self.last_modified.lock().unwrap_or_else(PoisonError::into_inner) = at;
    }

    fn touch(&self) {
        self.set_last_modified(Some(Utc::now()));
    }

    async fn enter(&self) -> Result<(), StoreError> {
        let latency = *self.latency.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(d) = latency {
            tokio::time::sleep(d).await;
        }
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Unavailable("injected failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl BookingStore for MemoryStore {
    async fn fetch_all(&self) -> Result<Vec<Booking>, StoreError> {
        self.booking_fetches.fetch_add(1, Ordering::SeqCst);
        self.enter().await?;
        let mut all: Vec<Booking> = self.bookings.iter().map(|e| e.value().clone()).collect();
        all.sort_by_key(|b| b.id);
        Ok(all)
    }

    async fn append(&self, booking: NewBooking) -> Result<Booking, StoreError> {
        self.enter().await?;
        let booking = self.insert(booking);
        self.touch();
        let lost = self
            .lost_acks
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if lost {
            return Err(StoreError::Unavailable("reply lost after commit".into()));
        }
        Ok(booking)
    }

    async fn update(&self, id: BookingId, patch: &BookingPatch) -> Result<Option<Booking>, StoreError> {
        self.enter().await?;
        let updated = self.bookings.get_mut(&id).map(|mut entry| {
            patch.apply(entry.value_mut());
            entry.value().clone()
        });
        if updated.is_some() {
            self.touch();
        }
        Ok(updated)
    }

    async fn delete(&self, id: BookingId) -> Result<bool, StoreError> {
        self.enter().await?;
        let removed = self.bookings.remove(&id).is_some();
        if removed {
            self.touch();
        }
        Ok(removed)
    }
}

#[async_trait]
impl ScheduleStore for MemoryStore {
    async fn fetch_all(&self) -> Result<Vec<ScheduleEntry>, StoreError> {
        self.enter().await?;
        Ok(self.schedule.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }
}

#[async_trait]
impl BlacklistStore for MemoryStore {
    async fn fetch_all(&self) -> Result<Vec<String>, StoreError> {
        self.enter().await?;
        Ok(self.blacklist.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }

    async fn append(&self, identity: &str) -> Result<(), StoreError> {
        self.enter().await?;
        self.blacklist
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(identity.to_string());
        self.touch();
        Ok(())
    }

    async fn remove(&self, identity: &str) -> Result<bool, StoreError> {
        self.enter().await?;
        let removed = {
            let mut list = self.blacklist.lock().unwrap_or_else(PoisonError::into_inner);
            match list.iter().position(|e| e == identity) {
                Some(pos) => {
                    list.remove(pos);
                    true
                }
                None => false,
            }
        };
        if removed {
            self.touch();
        }
        Ok(removed)
    }
}

#[async_trait]
impl ChangeProbe for MemoryStore {
    async fn last_modified(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        self.enter().await?;
        Ok(*self.last_modified.lock().unwrap_or_else(PoisonError::into_inner))
    }
}
