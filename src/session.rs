use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use dashmap::DashMap;
use tracing::debug;

use crate::clock::Clock;
use crate::model::{AddOn, BookingId, Slot, UserId};

/// Dialog sessions are keyed by the chat user driving them.
pub type SessionId = UserId;

/// Where a user is in a multi-step dialog.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    ChoosingDate,
    ChoosingTime {
        date: NaiveDate,
    },
    ChoosingAddOns {
        date: NaiveDate,
        slot: Slot,
        add_ons: BTreeSet<AddOn>,
    },
    /// Admin picked a booking to reject and owes a reason.
    AwaitingRejectReason {
        booking: BookingId,
    },
    BlockingDate,
    BlockingTime {
        date: NaiveDate,
    },
}

#[derive(Debug, Clone)]
struct Session {
    state: SessionState,
    last_touched: DateTime<Utc>,
}

/// Per-user dialog state with an idle timeout.
pub struct SessionStore {
    sessions: DashMap<SessionId, Session>,
    timeout: TimeDelta,
    clock: Arc<dyn Clock>,
}

impl SessionStore {
    pub fn new(timeout: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            sessions: DashMap::new(),
            timeout: TimeDelta::from_std(timeout).unwrap_or(TimeDelta::MAX),
            clock,
        }
    }

    /// Current state. A session idle past the timeout is dropped and reads as `Idle`.
    pub fn get(&self, id: SessionId) -> SessionState {
        let now = self.clock.now();
        let expired = match self.sessions.get(&id) {
            None => return SessionState::Idle,
            Some(s) if now - s.last_touched <= self.timeout => return s.state.clone(),
            Some(_) => true,
        };
        if expired {
            debug!("session {id} timed out");
            self.sessions.remove(&id);
        }
        SessionState::Idle
    }

    pub fn set(&self, id: SessionId, state: SessionState) {
        if state == SessionState::Idle {
            self.reset(id);
            return;
        }
        let session = Session {
            state,
            last_touched: self.clock.now(),
        };
        self.sessions.insert(id, session);
    }

    pub fn reset(&self, id: SessionId) {
        self.sessions.remove(&id);
    }

    /// Drop every timed-out session. Returns how many went.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.sessions.len();
        self.sessions
            .retain(|_, s| now - s.last_touched <= self.timeout);
        before - self.sessions.len()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
