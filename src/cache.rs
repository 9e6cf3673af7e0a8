//! Keyed TTL cache in front of the record store.
//!
//! Concurrent misses on one key share a single loader execution. The lock is
//! held only for bookkeeping, never while a loader runs, so a slow load does
//! not stall reads of other keys.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::observability::{
    CACHE_HITS_TOTAL, CACHE_INVALIDATIONS_TOTAL, CACHE_LOAD_FAILURES_TOTAL, CACHE_LOADS_TOTAL,
    CACHE_MISSES_TOTAL, CACHE_STALE_FALLBACKS_TOTAL,
};
use crate::store::StoreError;

type LoadFuture<V> = Shared<BoxFuture<'static, Result<V, StoreError>>>;

#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    pub created_at: DateTime<Utc>,
    /// `None` never expires.
    pub ttl: Option<Duration>,
}

impl<V> CacheEntry<V> {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.ttl {
            None => false,
            Some(ttl) => now - self.created_at > TimeDelta::from_std(ttl).unwrap_or(TimeDelta::MAX),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub total_entries: usize,
    pub expired_entries: usize,
    pub valid_entries: usize,
    pub pending_loads: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// The loader failed and there was no previous value to fall back to.
    Load { key: String, source: StoreError },
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheError::Load { key, source } => write!(f, "loading {key:?} failed: {source}"),
        }
    }
}

impl std::error::Error for CacheError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CacheError::Load { source, .. } => Some(source),
        }
    }
}

struct InFlight<V> {
    id: u64,
    future: LoadFuture<V>,
}

struct Inner<V> {
    entries: HashMap<String, CacheEntry<V>>,
    in_flight: HashMap<String, InFlight<V>>,
    next_load_id: u64,
}

pub struct TtlCache<V> {
    inner: Mutex<Inner<V>>,
    default_ttl: Option<Duration>,
    clock: Arc<dyn Clock>,
}

impl<V> TtlCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(default_ttl: Option<Duration>, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                in_flight: HashMap::new(),
                next_load_id: 0,
            }),
            default_ttl,
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<V>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Live value for `key`, if any. Never loads.
    pub fn peek(&self, key: &str) -> Option<V> {
        let now = self.clock.now();
        self.lock()
            .entries
            .get(key)
            .filter(|e| !e.is_expired(now))
            .map(|e| e.value.clone())
    }

    /// Return the live value for `key`, or load it.
    ///
    /// If a load for `key` is already running, this waits for it instead of
    /// calling `loader`. `loader` must be lazy: it is called under the cache
    /// lock and only the future it returns may do I/O. `ttl` overrides the
    /// cache-wide default for the stored entry.
    ///
    /// On loader failure the previous value for `key` is returned if there is
    /// one, expired or not.
    pub async fn get<F, Fut>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        loader: F,
    ) -> Result<V, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, StoreError>> + Send + 'static,
    {
        let (load_id, future) = {
            let mut inner = self.lock();
            if let Some(entry) = inner.entries.get(key)
                && !entry.is_expired(self.clock.now())
            {
                metrics::counter!(CACHE_HITS_TOTAL, "key" => key.to_string()).increment(1);
                return Ok(entry.value.clone());
            }
            metrics::counter!(CACHE_MISSES_TOTAL, "key" => key.to_string()).increment(1);

            let joined = inner
                .in_flight
                .get(key)
                .map(|pending| (pending.id, pending.future.clone()));
            match joined {
                Some(joined) => joined,
                None => {
                    let id = inner.next_load_id;
                    inner.next_load_id += 1;
                    let future = loader().boxed().shared();
                    inner.in_flight.insert(
                        key.to_string(),
                        InFlight {
                            id,
                            future: future.clone(),
                        },
                    );
                    metrics::counter!(CACHE_LOADS_TOTAL, "key" => key.to_string()).increment(1);
                    debug!("cache load started for {key}");
                    (id, future)
                }
            }
        };

        let result = future.await;

        let mut inner = self.lock();
        // Only the waiter that finds its own load still registered writes the
        // result back. A load detached by invalidation is never stored.
        let owns_slot = inner.in_flight.get(key).is_some_and(|f| f.id == load_id);
        if owns_slot {
            inner.in_flight.remove(key);
        }

        match result {
            Ok(value) => {
                if owns_slot {
                    let entry = CacheEntry {
                        value: value.clone(),
                        created_at: self.clock.now(),
                        ttl: ttl.or(self.default_ttl),
                    };
                    inner.entries.insert(key.to_string(), entry);
                }
                Ok(value)
            }
            Err(source) => {
                if owns_slot {
                    metrics::counter!(CACHE_LOAD_FAILURES_TOTAL, "key" => key.to_string())
                        .increment(1);
                }
                match inner.entries.get(key) {
                    Some(previous) => {
                        if owns_slot {
                            warn!("cache load for {key} failed, serving previous value: {source}");
                            metrics::counter!(CACHE_STALE_FALLBACKS_TOTAL).increment(1);
                        }
                        Ok(previous.value.clone())
                    }
                    None => Err(CacheError::Load {
                        key: key.to_string(),
                        source,
                    }),
                }
            }
        }
    }

    /// Drop one key, or everything when `key` is `None`. Loads in flight for
    /// the dropped keys are detached. Returns the number of entries removed.
    pub fn invalidate(&self, key: Option<&str>) -> usize {
        let mut inner = self.lock();
        let removed = match key {
            Some(key) => {
                inner.in_flight.remove(key);
                usize::from(inner.entries.remove(key).is_some())
            }
            None => {
                inner.in_flight.clear();
                let n = inner.entries.len();
                inner.entries.clear();
                n
            }
        };
        drop(inner);
        debug!("cache invalidate {}: {removed} removed", key.unwrap_or("*"));
        metrics::counter!(CACHE_INVALIDATIONS_TOTAL).increment(removed as u64);
        removed
    }

    /// Drop every key starting with `prefix`.
    pub fn invalidate_pattern(&self, prefix: &str) -> usize {
        let mut inner = self.lock();
        let before = inner.entries.len();
        inner.entries.retain(|k, _| !k.starts_with(prefix));
        inner.in_flight.retain(|k, _| !k.starts_with(prefix));
        let removed = before - inner.entries.len();
        drop(inner);
        debug!("cache invalidate {prefix}*: {removed} removed");
        metrics::counter!(CACHE_INVALIDATIONS_TOTAL).increment(removed as u64);
        removed
    }

    /// Remove entries whose TTL has elapsed. Returns how many went.
    pub fn clear_expired(&self) -> usize {
        let now = self.clock.now();
        let mut inner = self.lock();
        let before = inner.entries.len();
        inner.entries.retain(|_, e| !e.is_expired(now));
        before - inner.entries.len()
    }

    pub fn stats(&self) -> CacheStats {
        let now = self.clock.now();
        let inner = self.lock();
        let expired = inner.entries.values().filter(|e| e.is_expired(now)).count();
        CacheStats {
            total_entries: inner.entries.len(),
            expired_entries: expired,
            valid_entries: inner.entries.len() - expired,
            pending_loads: inner.in_flight.len(),
        }
    }
}
