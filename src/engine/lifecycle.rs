use std::collections::BTreeSet;

use chrono::NaiveDate;
use tracing::info;

use crate::limits::*;
use crate::model::*;
use crate::observability::TRANSITIONS_TOTAL;

use super::availability::active_count;
use super::{Engine, EngineError};

/// A requester's ask for one slot, already parsed and validated at the boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRequest {
    pub requester_name: String,
    pub requester_link: String,
    pub requester_id: UserId,
    pub date: NaiveDate,
    pub slot: Slot,
    pub add_ons: BTreeSet<AddOn>,
}

fn record<T>(transition: &'static str, result: &Result<T, EngineError>) {
    let outcome = match result {
        Ok(_) => "ok",
        Err(EngineError::AlreadyHandled(_)) => "already_handled",
        Err(EngineError::Store(_)) => "store_error",
        Err(_) => "refused",
    };
    metrics::counter!(TRANSITIONS_TOTAL, "transition" => transition, "outcome" => outcome)
        .increment(1);
}

fn check_len(value: &str, max: usize, what: &'static str) -> Result<(), EngineError> {
    if value.len() > max {
        return Err(EngineError::LimitExceeded(what));
    }
    Ok(())
}

impl Engine {
    // ── Creation ─────────────────────────────────────────────────

    /// Create a Pending booking. Refused if an active booking holds the slot
    /// or the requester is at the daily quota. The blacklist is the caller's
    /// job.
    pub async fn create_booking(&self, request: BookingRequest) -> Result<Booking, EngineError> {
        let result = self.create_booking_inner(request).await;
        record("create", &result);
        result
    }

    async fn create_booking_inner(&self, request: BookingRequest) -> Result<Booking, EngineError> {
        check_len(&request.requester_name, MAX_NAME_LEN, "requester name too long")?;
        check_len(&request.requester_link, MAX_PROFILE_LINK_LEN, "profile link too long")?;

        let _guard = self.writes.lock().await;
        let current = self.fresh_bookings().await?;
        ensure_slot_free(&current, request.date, request.slot)?;
        let limit = self.settings.max_slots_per_day;
        if active_count(&current, request.requester_id, request.date) >= limit {
            return Err(EngineError::QuotaExceeded { limit });
        }

        let new = NewBooking {
            requester_name: request.requester_name,
            requester_link: request.requester_link,
            requester_id: Some(request.requester_id),
            date: request.date,
            slot: request.slot,
            status: BookingStatus::Pending,
            created_at: self.clock.now(),
            add_ons: request.add_ons,
        };
        let booking = self.append(new).await?;
        info!(
            "booking {} created: {} {} for user {}",
            booking.id, booking.date, booking.slot, request.requester_id
        );
        Ok(booking)
    }

    /// Administrative hold on a slot. Not subject to the quota.
    pub async fn block_slot(
        &self,
        date: NaiveDate,
        slot: Slot,
        admin: &str,
    ) -> Result<Booking, EngineError> {
        let result = self.block_slot_inner(date, slot, admin).await;
        record("block", &result);
        result
    }

    async fn block_slot_inner(
        &self,
        date: NaiveDate,
        slot: Slot,
        admin: &str,
    ) -> Result<Booking, EngineError> {
        check_len(admin, MAX_NAME_LEN, "admin name too long")?;

        let _guard = self.writes.lock().await;
        let current = self.fresh_bookings().await?;
        ensure_slot_free(&current, date, slot)?;

        let new = NewBooking {
            requester_name: admin.to_string(),
            requester_link: String::new(),
            requester_id: None,
            date,
            slot,
            status: BookingStatus::Blocked,
            created_at: self.clock.now(),
            add_ons: BTreeSet::new(),
        };
        let booking = self.append(new).await?;
        info!("slot {date} {slot} blocked by {admin} (booking {})", booking.id);
        Ok(booking)
    }

    async fn append(&self, new: NewBooking) -> Result<Booking, EngineError> {
        let appended = self.stores.bookings.append(new).await;
        self.invalidate_bookings();
        Ok(appended?)
    }

    // ── Transitions ──────────────────────────────────────────────

    /// Re-read the store and return the record only if `expected` still holds.
    async fn expect_state(
        &self,
        id: BookingId,
        expected: impl Fn(&Booking) -> bool,
    ) -> Result<Booking, EngineError> {
        let current = self.fresh_bookings().await?;
        match current.iter().find(|b| b.id == id) {
            Some(b) if expected(b) => Ok(b.clone()),
            _ => Err(EngineError::AlreadyHandled(id)),
        }
    }

    async fn apply_patch(&self, id: BookingId, patch: BookingPatch) -> Result<Booking, EngineError> {
        let updated = self.stores.bookings.update(id, &patch).await;
        self.invalidate_bookings();
        updated?.ok_or(EngineError::AlreadyHandled(id))
    }

    async fn remove(&self, id: BookingId) -> Result<(), EngineError> {
        let deleted = self.stores.bookings.delete(id).await;
        self.invalidate_bookings();
        if deleted? {
            Ok(())
        } else {
            Err(EngineError::AlreadyHandled(id))
        }
    }

    /// Pending → Confirmed.
    pub async fn confirm(&self, id: BookingId, admin: &str) -> Result<Booking, EngineError> {
        let result = self.confirm_inner(id, admin).await;
        record("confirm", &result);
        result
    }

    async fn confirm_inner(&self, id: BookingId, admin: &str) -> Result<Booking, EngineError> {
        let _guard = self.writes.lock().await;
        self.expect_state(id, |b| b.status == BookingStatus::Pending)
            .await?;
        let patch = BookingPatch {
            status: Some(BookingStatus::Confirmed),
            confirmed_by: Some(admin.to_string()),
            confirmed_at: Some(self.clock.now()),
            decline_reason: None,
        };
        let booking = self.apply_patch(id, patch).await?;
        info!("booking {id} confirmed by {admin}");
        Ok(booking)
    }

    /// Pending → Rejected. With `keep_record` the record stays, carrying the
    /// reason; otherwise it is deleted and `Ok(None)` returned.
    pub async fn reject(
        &self,
        id: BookingId,
        admin: &str,
        reason: Option<String>,
        keep_record: bool,
    ) -> Result<Option<Booking>, EngineError> {
        let result = self.reject_inner(id, admin, reason, keep_record).await;
        record("reject", &result);
        result
    }

    async fn reject_inner(
        &self,
        id: BookingId,
        admin: &str,
        reason: Option<String>,
        keep_record: bool,
    ) -> Result<Option<Booking>, EngineError> {
        if let Some(ref r) = reason {
            check_len(r, MAX_DECLINE_REASON_LEN, "decline reason too long")?;
        }
        let _guard = self.writes.lock().await;
        self.expect_state(id, |b| b.status == BookingStatus::Pending)
            .await?;
        if !keep_record {
            self.remove(id).await?;
            info!("booking {id} rejected and removed by {admin}");
            return Ok(None);
        }
        let patch = BookingPatch {
            status: Some(BookingStatus::Rejected),
            confirmed_by: Some(admin.to_string()),
            confirmed_at: None,
            decline_reason: Some(reason),
        };
        let booking = self.apply_patch(id, patch).await?;
        info!("booking {id} rejected by {admin}");
        Ok(Some(booking))
    }

    /// Confirmed → removed, by an admin or by the scheduler once the wash is over.
    pub async fn complete(&self, id: BookingId) -> Result<Booking, EngineError> {
        let result = self
            .remove_in_state(id, |b| b.status == BookingStatus::Confirmed)
            .await;
        record("complete", &result);
        if result.is_ok() {
            info!("booking {id} completed");
        }
        result
    }

    /// Blocked → removed.
    pub async fn unblock(&self, id: BookingId) -> Result<Booking, EngineError> {
        let result = self
            .remove_in_state(id, |b| b.status == BookingStatus::Blocked)
            .await;
        record("unblock", &result);
        if result.is_ok() {
            info!("booking {id} unblocked");
        }
        result
    }

    /// A requester withdraws one of their own active bookings. Someone
    /// else's booking reads as not found.
    pub async fn cancel(&self, id: BookingId, requester: UserId) -> Result<Booking, EngineError> {
        let result = self.cancel_inner(id, requester).await;
        record("cancel", &result);
        result
    }

    async fn cancel_inner(&self, id: BookingId, requester: UserId) -> Result<Booking, EngineError> {
        let _guard = self.writes.lock().await;
        let current = self.fresh_bookings().await?;
        let booking = match current.iter().find(|b| b.id == id) {
            Some(b) if b.requester_id != Some(requester) => return Err(EngineError::NotFound(id)),
            Some(b) if b.is_active() => b.clone(),
            _ => return Err(EngineError::AlreadyHandled(id)),
        };
        self.remove(id).await?;
        info!("booking {id} cancelled by user {requester}");
        Ok(booking)
    }

    async fn remove_in_state(
        &self,
        id: BookingId,
        expected: impl Fn(&Booking) -> bool,
    ) -> Result<Booking, EngineError> {
        let _guard = self.writes.lock().await;
        let booking = self.expect_state(id, expected).await?;
        self.remove(id).await?;
        Ok(booking)
    }

    /// Delete a record whatever its state. `Ok(false)` if it was already gone.
    pub async fn discard(&self, id: BookingId) -> Result<bool, EngineError> {
        let _guard = self.writes.lock().await;
        match self.remove(id).await {
            Ok(()) => Ok(true),
            Err(EngineError::AlreadyHandled(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    // ── Blacklist ────────────────────────────────────────────────

    /// Returns `false` if `identity` was already listed.
    pub async fn add_to_blacklist(&self, identity: &str) -> Result<bool, EngineError> {
        check_len(identity, MAX_BLACKLIST_IDENTITY_LEN, "blacklist identity too long")?;
        let _guard = self.writes.lock().await;
        self.cache.invalidate(Some(BLACKLIST_KEY));
        if self.blacklist().await?.iter().any(|e| e == identity) {
            return Ok(false);
        }
        let appended = self.stores.blacklist.append(identity).await;
        self.cache.invalidate(Some(BLACKLIST_KEY));
        appended?;
        info!("{identity} added to blacklist");
        Ok(true)
    }

    pub async fn remove_from_blacklist(&self, identity: &str) -> Result<bool, EngineError> {
        let _guard = self.writes.lock().await;
        let removed = self.stores.blacklist.remove(identity).await;
        self.cache.invalidate(Some(BLACKLIST_KEY));
        let removed = removed?;
        if removed {
            info!("{identity} removed from blacklist");
        }
        Ok(removed)
    }
}

fn ensure_slot_free(bookings: &[Booking], date: NaiveDate, slot: Slot) -> Result<(), EngineError> {
    if bookings
        .iter()
        .any(|b| b.date == date && b.slot == slot && b.is_active())
    {
        return Err(EngineError::SlotTaken { date, slot });
    }
    Ok(())
}
