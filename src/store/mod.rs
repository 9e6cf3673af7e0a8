//! Capability interfaces over the external record store, plus the adapters
//! that implement them.

mod journal;
mod memory;
mod retry;

pub use journal::JournalStore;
pub use memory::MemoryStore;
pub use retry::{RetryPolicy, Retrying};

use std::fmt;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::model::{Booking, BookingId, BookingPatch, NewBooking, ScheduleEntry};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Backend unreachable or rate limited.
    Unavailable(String),
    Io(String),
    /// A record could not be decoded. Retrying will not help.
    Malformed(String),
    /// A write may or may not have been applied. Never retried blindly.
    Indeterminate(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Io(_))
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Unavailable(e) => write!(f, "store unavailable: {e}"),
            StoreError::Io(e) => write!(f, "store I/O error: {e}"),
            StoreError::Malformed(e) => write!(f, "malformed record: {e}"),
            StoreError::Indeterminate(e) => write!(f, "store write outcome unknown: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<io::Error> for StoreError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::InvalidData => StoreError::Malformed(e.to_string()),
            _ => StoreError::Io(e.to_string()),
        }
    }
}

#[async_trait]
pub trait BookingStore: Send + Sync {
    /// Every booking record, in store order.
    async fn fetch_all(&self) -> Result<Vec<Booking>, StoreError>;
    /// Store a new record and return it with its assigned id.
    async fn append(&self, booking: NewBooking) -> Result<Booking, StoreError>;
    /// `Ok(None)` if the record no longer exists.
    async fn update(&self, id: BookingId, patch: &BookingPatch) -> Result<Option<Booking>, StoreError>;
    /// `Ok(false)` if the record no longer exists.
    async fn delete(&self, id: BookingId) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait ScheduleStore: Send + Sync {
    async fn fetch_all(&self) -> Result<Vec<ScheduleEntry>, StoreError>;
}

#[async_trait]
pub trait BlacklistStore: Send + Sync {
    async fn fetch_all(&self) -> Result<Vec<String>, StoreError>;
    async fn append(&self, identity: &str) -> Result<(), StoreError>;
    async fn remove(&self, identity: &str) -> Result<bool, StoreError>;
}

/// Reports when the backing store last changed, by anyone.
#[async_trait]
pub trait ChangeProbe: Send + Sync {
    async fn last_modified(&self) -> Result<Option<DateTime<Utc>>, StoreError>;
}

/// The full capability set the engine runs against.
#[derive(Clone)]
pub struct Stores {
    pub bookings: Arc<dyn BookingStore>,
    pub schedule: Arc<dyn ScheduleStore>,
    pub blacklist: Arc<dyn BlacklistStore>,
    pub probe: Arc<dyn ChangeProbe>,
}

impl Stores {
    /// All four capabilities served by one backend.
    pub fn from_backend<S>(backend: Arc<S>) -> Self
    where
        S: BookingStore + ScheduleStore + BlacklistStore + ChangeProbe + 'static,
    {
        Self {
            bookings: backend.clone(),
            schedule: backend.clone(),
            blacklist: backend.clone(),
            probe: backend,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(StoreError::Unavailable("503".into()).is_transient());
        assert!(StoreError::Io("reset".into()).is_transient());
        assert!(!StoreError::Malformed("bad row".into()).is_transient());
        assert!(!StoreError::Indeterminate("rollback failed".into()).is_transient());
    }

    #[test]
    fn io_error_conversion() {
        let e: StoreError = io::Error::new(io::ErrorKind::InvalidData, "crc").into();
        assert!(matches!(e, StoreError::Malformed(_)));
        let e: StoreError = io::Error::new(io::ErrorKind::ConnectionReset, "reset").into();
        assert!(matches!(e, StoreError::Io(_)));
    }
}
