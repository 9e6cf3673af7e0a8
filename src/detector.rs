use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::store::{ChangeProbe, StoreError};

/// Opaque marker of the store's state. Two equal tokens mean "nothing
/// observable changed in between"; timestamps coarser than the poll period
/// can hide a change, which only costs a late refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct VersionToken(DateTime<Utc>);

impl VersionToken {
    pub fn at(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Anything that can drop every cached key at once.
pub trait Invalidate: Send + Sync {
    fn invalidate_all(&self) -> usize;
}

impl<V: Clone + Send + Sync + 'static> Invalidate for crate::cache::TtlCache<V> {
    fn invalidate_all(&self) -> usize {
        self.invalidate(None)
    }
}

/// Polls the store's modification time and clears the cache when it moves.
pub struct ChangeDetector {
    probe: Arc<dyn ChangeProbe>,
    cache: Arc<dyn Invalidate>,
    last_seen: Mutex<Option<VersionToken>>,
}

impl ChangeDetector {
    pub fn new(probe: Arc<dyn ChangeProbe>, cache: Arc<dyn Invalidate>) -> Self {
        Self {
            probe,
            cache,
            last_seen: Mutex::new(None),
        }
    }

    pub fn last_seen(&self) -> Option<VersionToken> {
        *self.last_seen.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns `true` if a change was detected and the cache was cleared.
    ///
    /// The first observation only records the token. The cache cannot tell
    /// which entity kind changed, so a change invalidates every key.
    pub async fn check(&self) -> Result<bool, StoreError> {
        let Some(at) = self.probe.last_modified().await? else {
            return Ok(false);
        };
        let token = VersionToken(at);

        let previous = {
            let mut last = self.last_seen.lock().unwrap_or_else(PoisonError::into_inner);
            let previous = *last;
            if previous.is_none_or(|p| token > p) {
                *last = Some(token);
            }
            previous
        };

        match previous {
            None => {
                debug!("change detector baseline at {at}");
                Ok(false)
            }
            Some(p) if token > p => {
                let removed = self.cache.invalidate_all();
                info!("store modified at {at}, dropped {removed} cached entries");
                metrics::counter!(crate::observability::CHANGE_DETECTIONS_TOTAL).increment(1);
                Ok(true)
            }
            Some(_) => Ok(false),
        }
    }
}
