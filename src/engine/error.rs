use chrono::NaiveDate;

use crate::cache::CacheError;
use crate::model::{BookingId, Slot};
use crate::store::StoreError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// An active booking already holds this slot.
    SlotTaken { date: NaiveDate, slot: Slot },
    /// The requester already has `limit` active bookings that day.
    QuotaExceeded { limit: usize },
    /// The record is gone or no longer in the state the transition expects.
    AlreadyHandled(BookingId),
    NotFound(BookingId),
    LimitExceeded(&'static str),
    Store(StoreError),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::SlotTaken { date, slot } => write!(f, "slot {date} {slot} is already taken"),
            EngineError::QuotaExceeded { limit } => {
                write!(f, "daily limit of {limit} active bookings reached")
            }
            EngineError::AlreadyHandled(id) => write!(f, "booking {id} was already handled"),
            EngineError::NotFound(id) => write!(f, "booking not found: {id}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::Store(e) => write!(f, "store error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EngineError::Store(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        EngineError::Store(e)
    }
}

impl From<CacheError> for EngineError {
    fn from(e: CacheError) -> Self {
        match e {
            CacheError::Load { source, .. } => EngineError::Store(source),
        }
    }
}
