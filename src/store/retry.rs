use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::warn;

use crate::model::{Booking, BookingId, BookingPatch, NewBooking, ScheduleEntry};

use super::{BlacklistStore, BookingStore, ChangeProbe, ScheduleStore, StoreError};

/// Exponential backoff: `attempts` tries in total, sleeping `base_delay`,
/// then twice that, and so on between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            base_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    pub async fn run<T, F, Fut>(&self, what: &'static str, mut op: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let attempts = self.attempts.max(1);
        let mut delay = self.base_delay;
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if !e.is_transient() || attempt >= attempts => return Err(e),
                Err(e) => {
                    warn!("{what} failed (attempt {attempt}/{attempts}), retrying in {delay:?}: {e}");
                    metrics::counter!(crate::observability::STORE_RETRIES_TOTAL, "op" => what)
                        .increment(1);
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
            }
        }
    }
}

/// Wraps any store adapter so every call goes through a [`RetryPolicy`].
///
/// A transient failure on a write may arrive after the backend already
/// applied it, so before repeating a write the adapter checks whether the
/// earlier attempt landed.
pub struct Retrying<S> {
    inner: S,
    policy: RetryPolicy,
}

impl<S> Retrying<S> {
    pub fn new(inner: S, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

#[async_trait]
impl<S: BookingStore> BookingStore for Retrying<S> {
    async fn fetch_all(&self) -> Result<Vec<Booking>, StoreError> {
        self.policy
            .run("fetch_bookings", || BookingStore::fetch_all(&self.inner))
            .await
    }

    async fn append(&self, booking: NewBooking) -> Result<Booking, StoreError> {
        let inner = &self.inner;
        let tried = &AtomicBool::new(false);
        self.policy
            .run("append_booking", || {
                let booking = booking.clone();
                async move {
                    if tried.swap(true, Ordering::SeqCst)
                        && let Some(landed) = BookingStore::fetch_all(inner)
                            .await?
                            .into_iter()
                            .find(|b| booking.is_stored_as(b))
                    {
                        return Ok(landed);
                    }
                    BookingStore::append(inner, booking).await
                }
            })
            .await
    }

    async fn update(&self, id: BookingId, patch: &BookingPatch) -> Result<Option<Booking>, StoreError> {
        self.policy
            .run("update_booking", || self.inner.update(id, patch))
            .await
    }

    async fn delete(&self, id: BookingId) -> Result<bool, StoreError> {
        let inner = &self.inner;
        let tried = &AtomicBool::new(false);
        self.policy
            .run("delete_booking", || async move {
                let retry = tried.swap(true, Ordering::SeqCst);
                // gone on a retry means the failed attempt removed it
                Ok(inner.delete(id).await? || retry)
            })
            .await
    }
}

#[async_trait]
impl<S: ScheduleStore> ScheduleStore for Retrying<S> {
    async fn fetch_all(&self) -> Result<Vec<ScheduleEntry>, StoreError> {
        self.policy
            .run("fetch_schedule", || ScheduleStore::fetch_all(&self.inner))
            .await
    }
}

#[async_trait]
impl<S: BlacklistStore> BlacklistStore for Retrying<S> {
    async fn fetch_all(&self) -> Result<Vec<String>, StoreError> {
        self.policy
            .run("fetch_blacklist", || BlacklistStore::fetch_all(&self.inner))
            .await
    }

    async fn append(&self, identity: &str) -> Result<(), StoreError> {
        let inner = &self.inner;
        let tried = &AtomicBool::new(false);
        self.policy
            .run("append_blacklist", || async move {
                if tried.swap(true, Ordering::SeqCst)
                    && BlacklistStore::fetch_all(inner).await?.iter().any(|e| e == identity)
                {
                    return Ok(());
                }
                BlacklistStore::append(inner, identity).await
            })
            .await
    }

    async fn remove(&self, identity: &str) -> Result<bool, StoreError> {
        let inner = &self.inner;
        let tried = &AtomicBool::new(false);
        self.policy
            .run("remove_blacklist", || async move {
                let retry = tried.swap(true, Ordering::SeqCst);
                Ok(inner.remove(identity).await? || retry)
            })
            .await
    }
}

#[async_trait]
impl<S: ChangeProbe> ChangeProbe for Retrying<S> {
    async fn last_modified(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        self.policy
            .run("last_modified", || self.inner.last_modified())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryPolicy {
        RetryPolicy {
            attempts: 5,
            base_delay: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let result = fast()
            .run("test", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 3 {
                        Err(StoreError::Unavailable("busy".into()))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;
        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn gives_up_after_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = fast()
            .run("test", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(StoreError::Io("down".into())) }
            })
            .await;
        assert_eq!(result, Err(StoreError::Io("down".into())));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn permanent_error_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = fast()
            .run("test", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(StoreError::Malformed("row 3".into())) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn backoff_doubles() {
        let policy = RetryPolicy {
            attempts: 3,
            base_delay: Duration::from_millis(20),
        };
        let start = std::time::Instant::now();
        let _: Result<(), _> = policy
            .run("test", || async { Err(StoreError::Unavailable("x".into())) })
            .await;
        // 20ms + 40ms of sleeping between three attempts
        assert!(start.elapsed() >= Duration::from_millis(60));
    }

    fn new_booking(hour: u8) -> NewBooking {
        NewBooking {
            requester_name: "Ann".into(),
            requester_link: "https://vk.com/id7".into(),
            requester_id: Some(7),
            date: chrono::NaiveDate::from_ymd_opt(2026, 10, 19).unwrap(),
            slot: crate::model::Slot::from_hm(hour, 0).unwrap(),
            status: crate::model::BookingStatus::Pending,
            created_at: Utc::now(),
            add_ons: Default::default(),
        }
    }

    #[tokio::test]
    async fn append_is_not_repeated_after_a_lost_reply() {
        let store = Retrying::new(MemoryStore::new(), fast());
        store.inner().lose_next_acks(1);
        let booking = BookingStore::append(&store, new_booking(10)).await.unwrap();
        assert_eq!(booking.id, 1);
        assert_eq!(BookingStore::fetch_all(&store).await.unwrap(), vec![booking]);
    }

    #[tokio::test]
    async fn append_is_repeated_when_nothing_landed() {
        let store = Retrying::new(MemoryStore::new(), fast());
        store.inner().fail_next(2);
        let booking = BookingStore::append(&store, new_booking(10)).await.unwrap();
        assert_eq!(BookingStore::fetch_all(&store).await.unwrap(), vec![booking]);
    }

    #[tokio::test]
    async fn unknown_write_outcome_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = fast()
            .run("test", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(StoreError::Indeterminate("rollback failed".into())) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn wrapper_masks_transient_store_failures() {
        let store = Retrying::new(MemoryStore::new(), fast());
        store.inner().fail_next(2);
        let bookings = BookingStore::fetch_all(&store).await.unwrap();
        assert!(bookings.is_empty());
        assert_eq!(store.inner().failures_remaining(), 0);
    }
}
