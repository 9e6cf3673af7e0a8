//! Chat-agnostic dialog steps. A transport adapter turns button presses and
//! text into calls here and renders the returned [`Step`].

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::NaiveDate;
use tracing::{info, warn};

use crate::clock::{format_date_label, parse_date_label};
use crate::engine::{BookingRequest, Engine, EngineError, active_count};
use crate::model::*;
use crate::notify::{Notifier, deliver, notify_admins};
use crate::profile::{ProfileResolver, profile_url, resolve_profile};
use crate::session::{SessionState, SessionStore};

/// The user on the other end of a booking dialog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requester {
    pub id: UserId,
    pub name: String,
    pub link: String,
}

/// Outcome of one dialog step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Blacklisted,
    NothingAvailable,
    PickDate {
        dates: Vec<NaiveDate>,
    },
    PickTime {
        date: NaiveDate,
        slots: Vec<Slot>,
    },
    PickAddOns {
        date: NaiveDate,
        slot: Slot,
        add_ons: BTreeSet<AddOn>,
        price: u32,
    },
    Submitted {
        booking: Booking,
        price: u32,
    },
    /// Input did not parse or fell outside what was offered; the step stays put.
    Retry(InputError),
    /// The chosen date filled up in the meantime.
    DateFull {
        dates: Vec<NaiveDate>,
    },
    /// The chosen slot was taken in the meantime.
    SlotTaken {
        slots: Vec<Slot>,
    },
    QuotaReached {
        limit: usize,
    },
    /// No dialog in progress for this step, or it timed out.
    NoSession,
    NotAdmin,
    AskReason {
        booking: BookingId,
    },
    Confirmed(Booking),
    Rejected {
        booking: BookingId,
    },
    AlreadyHandled(BookingId),
    NotFound(BookingId),
    /// The requester's active bookings, soonest first.
    MyBookings(Vec<Booking>),
    Cancelled(Booking),
    Completed(Booking),
    Blocked(Booking),
    Unblocked(Booking),
    /// The link does not lead to a user.
    UnknownProfile {
        link: String,
    },
    Banned {
        identity: String,
        newly: bool,
    },
    Unbanned {
        identity: String,
        removed: bool,
    },
    Aborted,
}

fn parse_slot(text: &str, interval_min: u16) -> Result<Slot, InputError> {
    let slot: Slot = text.parse()?;
    if !slot.on_grid(interval_min) {
        return Err(InputError::OffGrid(slot));
    }
    Ok(slot)
}

fn booking_line(date: NaiveDate, slot: Slot) -> String {
    format!("{} at {slot}", format_date_label(date))
}

pub struct Flow {
    engine: Arc<Engine>,
    sessions: Arc<SessionStore>,
    notifier: Arc<dyn Notifier>,
    resolver: Arc<dyn ProfileResolver>,
    admins: Vec<UserId>,
}

impl Flow {
    pub fn new(
        engine: Arc<Engine>,
        sessions: Arc<SessionStore>,
        notifier: Arc<dyn Notifier>,
        resolver: Arc<dyn ProfileResolver>,
        admins: Vec<UserId>,
    ) -> Self {
        Self {
            engine,
            sessions,
            notifier,
            resolver,
            admins,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub fn is_admin(&self, user: UserId) -> bool {
        self.admins.contains(&user)
    }

    /// Drop whatever dialog `user` was in.
    pub fn abort(&self, user: UserId) -> Step {
        self.sessions.reset(user);
        Step::Aborted
    }

    // ── Requester dialog ─────────────────────────────────────────

    pub async fn start_booking(&self, requester: &Requester) -> Result<Step, EngineError> {
        self.sessions.reset(requester.id);
        if self.engine.is_blacklisted(&profile_url(requester.id)).await? {
            info!("refused booking dialog for blacklisted user {}", requester.id);
            return Ok(Step::Blacklisted);
        }
        let dates = self.engine.available_dates().await?;
        if dates.is_empty() {
            return Ok(Step::NothingAvailable);
        }
        self.sessions.set(requester.id, SessionState::ChoosingDate);
        Ok(Step::PickDate { dates })
    }

    pub async fn choose_date(&self, user: UserId, text: &str) -> Result<Step, EngineError> {
        if self.sessions.get(user) != SessionState::ChoosingDate {
            return Ok(Step::NoSession);
        }
        let date = match self.date_in_window(text) {
            Ok(date) => date,
            Err(e) => return Ok(Step::Retry(e)),
        };
        let slots = self.engine.free_slots(date).await?;
        if slots.is_empty() {
            let dates = self.engine.available_dates().await?;
            return Ok(Step::DateFull { dates });
        }
        self.sessions.set(user, SessionState::ChoosingTime { date });
        Ok(Step::PickTime { date, slots })
    }

    pub async fn choose_time(&self, requester: &Requester, text: &str) -> Result<Step, EngineError> {
        let SessionState::ChoosingTime { date } = self.sessions.get(requester.id) else {
            return Ok(Step::NoSession);
        };
        let slot = match parse_slot(text, self.engine.settings().slot_interval_min) {
            Ok(slot) => slot,
            Err(e) => return Ok(Step::Retry(e)),
        };
        let slots = self.engine.free_slots(date).await?;
        if !slots.contains(&slot) {
            return Ok(Step::SlotTaken { slots });
        }
        let limit = self.engine.settings().max_slots_per_day;
        let bookings = self.engine.all_bookings().await?;
        if active_count(&bookings, requester.id, date) >= limit {
            self.sessions.reset(requester.id);
            return Ok(Step::QuotaReached { limit });
        }
        let add_ons = BTreeSet::new();
        self.sessions.set(
            requester.id,
            SessionState::ChoosingAddOns {
                date,
                slot,
                add_ons: add_ons.clone(),
            },
        );
        Ok(Step::PickAddOns {
            date,
            slot,
            price: quote(&add_ons),
            add_ons,
        })
    }

    /// Flip one add-on in the pending selection.
    pub fn toggle_add_on(&self, user: UserId, label: &str) -> Step {
        let SessionState::ChoosingAddOns {
            date,
            slot,
            mut add_ons,
        } = self.sessions.get(user)
        else {
            return Step::NoSession;
        };
        let Some(add_on) = AddOn::from_label(label) else {
            return Step::Retry(InputError::UnknownAddOn(label.trim().to_string()));
        };
        if !add_ons.remove(&add_on) {
            add_ons.insert(add_on);
        }
        let price = quote(&add_ons);
        self.sessions.set(
            user,
            SessionState::ChoosingAddOns {
                date,
                slot,
                add_ons: add_ons.clone(),
            },
        );
        Step::PickAddOns {
            date,
            slot,
            add_ons,
            price,
        }
    }

    /// Create the booking and tell the admins. The slot and quota are checked
    /// again against fresh data.
    pub async fn submit_booking(&self, requester: &Requester) -> Result<Step, EngineError> {
        let SessionState::ChoosingAddOns {
            date,
            slot,
            add_ons,
        } = self.sessions.get(requester.id)
        else {
            return Ok(Step::NoSession);
        };
        let price = quote(&add_ons);
        let request = BookingRequest {
            requester_name: requester.name.clone(),
            requester_link: requester.link.clone(),
            requester_id: requester.id,
            date,
            slot,
            add_ons,
        };
        let booking = match self.engine.create_booking(request).await {
            Ok(booking) => booking,
            Err(EngineError::SlotTaken { .. }) => {
                self.sessions
                    .set(requester.id, SessionState::ChoosingTime { date });
                let slots = self.engine.free_slots(date).await?;
                return Ok(Step::SlotTaken { slots });
            }
            Err(EngineError::QuotaExceeded { limit }) => {
                self.sessions.reset(requester.id);
                return Ok(Step::QuotaReached { limit });
            }
            Err(e) => return Err(e),
        };
        self.sessions.reset(requester.id);

        let text = format!(
            "New booking #{}\n{} ({})\n{}\nAdd-ons: {}\nTotal: {price}",
            booking.id,
            booking.requester_name,
            booking.requester_link,
            booking_line(booking.date, booking.slot),
            describe_add_ons(&booking.add_ons),
        );
        notify_admins(self.notifier.as_ref(), &self.admins, &text, "new_booking").await;
        Ok(Step::Submitted { booking, price })
    }

    pub async fn my_bookings(&self, requester: UserId) -> Result<Step, EngineError> {
        let mut bookings = self.engine.active_bookings_for(requester).await?;
        bookings.sort_by_key(|b| (b.date, b.slot));
        Ok(Step::MyBookings(bookings))
    }

    /// Withdraw one of the requester's own bookings and tell the admins.
    pub async fn cancel_booking(
        &self,
        requester: &Requester,
        booking: BookingId,
    ) -> Result<Step, EngineError> {
        let cancelled = match self.engine.cancel(booking, requester.id).await {
            Ok(b) => b,
            Err(EngineError::NotFound(id)) => return Ok(Step::NotFound(id)),
            Err(EngineError::AlreadyHandled(id)) => return Ok(Step::AlreadyHandled(id)),
            Err(e) => return Err(e),
        };
        let text = format!(
            "{} ({}) cancelled booking #{}: {}",
            requester.name,
            profile_url(requester.id),
            cancelled.id,
            booking_line(cancelled.date, cancelled.slot),
        );
        notify_admins(self.notifier.as_ref(), &self.admins, &text, "cancelled").await;
        Ok(Step::Cancelled(cancelled))
    }

    fn date_in_window(&self, text: &str) -> Result<NaiveDate, InputError> {
        let date = parse_date_label(text)?;
        if !self.engine.booking_window().contains(&date) {
            return Err(InputError::OutsideWindow(date));
        }
        Ok(date)
    }

    // ── Admin dialog ─────────────────────────────────────────────

    pub async fn confirm(
        &self,
        admin: UserId,
        admin_name: &str,
        booking: BookingId,
    ) -> Result<Step, EngineError> {
        if !self.is_admin(admin) {
            return Ok(Step::NotAdmin);
        }
        let confirmed = match self.engine.confirm(booking, admin_name).await {
            Ok(b) => b,
            Err(EngineError::AlreadyHandled(id)) => return Ok(Step::AlreadyHandled(id)),
            Err(e) => return Err(e),
        };
        if let Some(requester) = confirmed.requester_id {
            let text = format!(
                "Your booking for {} is confirmed.",
                booking_line(confirmed.date, confirmed.slot)
            );
            deliver(self.notifier.as_ref(), requester, &text, "confirmed").await;
        }
        Ok(Step::Confirmed(confirmed))
    }

    /// Close a confirmed booking by hand and thank the requester.
    pub async fn complete_booking(
        &self,
        admin: UserId,
        booking: BookingId,
    ) -> Result<Step, EngineError> {
        if !self.is_admin(admin) {
            return Ok(Step::NotAdmin);
        }
        let completed = match self.engine.complete(booking).await {
            Ok(b) => b,
            Err(EngineError::AlreadyHandled(id)) => return Ok(Step::AlreadyHandled(id)),
            Err(e) => return Err(e),
        };
        if let Some(requester) = completed.requester_id {
            let text = format!(
                "Your wash on {} is complete. Thank you!",
                booking_line(completed.date, completed.slot)
            );
            deliver(self.notifier.as_ref(), requester, &text, "completed").await;
        }
        Ok(Step::Completed(completed))
    }

    /// First half of a rejection: remember the booking and ask for a reason.
    pub async fn begin_reject(&self, admin: UserId, booking: BookingId) -> Result<Step, EngineError> {
        if !self.is_admin(admin) {
            return Ok(Step::NotAdmin);
        }
        match self.engine.booking(booking).await? {
            Some(b) if b.status == BookingStatus::Pending => {
                self.sessions
                    .set(admin, SessionState::AwaitingRejectReason { booking });
                Ok(Step::AskReason { booking })
            }
            _ => Ok(Step::AlreadyHandled(booking)),
        }
    }

    /// Blank `reason` rejects without one.
    pub async fn finish_reject(
        &self,
        admin: UserId,
        admin_name: &str,
        reason: &str,
    ) -> Result<Step, EngineError> {
        let SessionState::AwaitingRejectReason { booking } = self.sessions.get(admin) else {
            return Ok(Step::NoSession);
        };
        let reason = Some(reason.trim())
            .filter(|r| !r.is_empty())
            .map(str::to_string);
        let pending = self.engine.booking(booking).await?;
        let rejected = self
            .engine
            .reject(booking, admin_name, reason.clone(), true)
            .await;
        match rejected {
            Ok(_) => {}
            Err(EngineError::AlreadyHandled(id)) => {
                self.sessions.reset(admin);
                return Ok(Step::AlreadyHandled(id));
            }
            Err(e) => return Err(e),
        }
        self.sessions.reset(admin);

        if let Some(b) = pending
            && let Some(requester) = b.requester_id
        {
            let mut text = format!(
                "Your booking for {} was declined.",
                booking_line(b.date, b.slot)
            );
            if let Some(r) = reason {
                text.push_str(&format!(" Reason: {r}"));
            }
            deliver(self.notifier.as_ref(), requester, &text, "rejected").await;
        }
        Ok(Step::Rejected { booking })
    }

    pub async fn begin_block(&self, admin: UserId) -> Result<Step, EngineError> {
        if !self.is_admin(admin) {
            return Ok(Step::NotAdmin);
        }
        let dates = self.engine.available_dates().await?;
        if dates.is_empty() {
            return Ok(Step::NothingAvailable);
        }
        self.sessions.set(admin, SessionState::BlockingDate);
        Ok(Step::PickDate { dates })
    }

    pub async fn choose_block_date(&self, admin: UserId, text: &str) -> Result<Step, EngineError> {
        if self.sessions.get(admin) != SessionState::BlockingDate {
            return Ok(Step::NoSession);
        }
        let date = match self.date_in_window(text) {
            Ok(date) => date,
            Err(e) => return Ok(Step::Retry(e)),
        };
        let slots = self.engine.free_slots(date).await?;
        if slots.is_empty() {
            let dates = self.engine.available_dates().await?;
            return Ok(Step::DateFull { dates });
        }
        self.sessions.set(admin, SessionState::BlockingTime { date });
        Ok(Step::PickTime { date, slots })
    }

    pub async fn choose_block_time(
        &self,
        admin: UserId,
        admin_name: &str,
        text: &str,
    ) -> Result<Step, EngineError> {
        let SessionState::BlockingTime { date } = self.sessions.get(admin) else {
            return Ok(Step::NoSession);
        };
        let slot = match parse_slot(text, self.engine.settings().slot_interval_min) {
            Ok(slot) => slot,
            Err(e) => return Ok(Step::Retry(e)),
        };
        match self.engine.block_slot(date, slot, admin_name).await {
            Ok(b) => {
                self.sessions.reset(admin);
                Ok(Step::Blocked(b))
            }
            Err(EngineError::SlotTaken { .. }) => {
                let slots = self.engine.free_slots(date).await?;
                Ok(Step::SlotTaken { slots })
            }
            Err(e) => Err(e),
        }
    }

    pub async fn unblock(&self, admin: UserId, booking: BookingId) -> Result<Step, EngineError> {
        if !self.is_admin(admin) {
            return Ok(Step::NotAdmin);
        }
        match self.engine.unblock(booking).await {
            Ok(b) => Ok(Step::Unblocked(b)),
            Err(EngineError::AlreadyHandled(id)) => Ok(Step::AlreadyHandled(id)),
            Err(e) => Err(e),
        }
    }

    // ── Blacklist ────────────────────────────────────────────────

    /// Canonical `https://vk.com/id<N>` identity behind `link`.
    async fn blacklist_identity(&self, link: &str) -> Option<String> {
        match resolve_profile(self.resolver.as_ref(), link).await {
            Ok(id) => id.map(profile_url),
            Err(e) => {
                warn!("could not resolve {link:?}: {e}");
                None
            }
        }
    }

    pub async fn ban(&self, admin: UserId, link: &str) -> Result<Step, EngineError> {
        if !self.is_admin(admin) {
            return Ok(Step::NotAdmin);
        }
        let Some(identity) = self.blacklist_identity(link).await else {
            return Ok(Step::UnknownProfile { link: link.trim().to_string() });
        };
        let newly = self.engine.add_to_blacklist(&identity).await?;
        Ok(Step::Banned { identity, newly })
    }

    pub async fn unban(&self, admin: UserId, link: &str) -> Result<Step, EngineError> {
        if !self.is_admin(admin) {
            return Ok(Step::NotAdmin);
        }
        let Some(identity) = self.blacklist_identity(link).await else {
            return Ok(Step::UnknownProfile { link: link.trim().to_string() });
        };
        let removed = self.engine.remove_from_blacklist(&identity).await?;
        Ok(Step::Unbanned { identity, removed })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::TtlCache;
    use crate::clock::{ManualClock, ServiceTime};
    use crate::engine::EngineSettings;
    use crate::notify::{Notification, Outbox};
    use crate::profile::Directory;
    use crate::store::{BookingStore, MemoryStore, Stores};
    use chrono::{DateTime, TimeZone, TimeDelta, Utc, Weekday};
    use std::time::Duration;
    use tokio::sync::broadcast;

    const ADMIN: UserId = 100;

    struct Harness {
        clock: Arc<ManualClock>,
        store: Arc<MemoryStore>,
        outbox: Arc<Outbox>,
        flow: Flow,
        inbox: broadcast::Receiver<Notification>,
    }

    /// 08:00 on Monday 2026-10-19, UTC+3.
    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, 5, 0, 0).unwrap()
    }

    fn harness() -> Harness {
        let clock = Arc::new(ManualClock::new(start()));
        let week = [
            Weekday::Mon,
            Weekday::Tue,
            Weekday::Wed,
            Weekday::Thu,
            Weekday::Fri,
            Weekday::Sat,
            Weekday::Sun,
        ];
        let store = Arc::new(MemoryStore::new().with_schedule(
            week.into_iter()
                .map(|weekday| ScheduleEntry {
                    weekday,
                    opens: 9,
                    closes: 12,
                })
                .collect(),
        ));
        let cache = Arc::new(TtlCache::new(Some(Duration::from_secs(300)), clock.clone()));
        let engine = Arc::new(Engine::new(
            Stores::from_backend(store.clone()),
            cache,
            clock.clone(),
            EngineSettings {
                service_time: ServiceTime::from_offset_hours(3).unwrap(),
                ..EngineSettings::default()
            },
        ));
        let sessions = Arc::new(SessionStore::new(Duration::from_secs(900), clock.clone()));
        let outbox = Arc::new(Outbox::new());
        let inbox = outbox.subscribe_all();
        let directory = Arc::new(Directory::new());
        directory.insert("ann.smith", 7);
        let flow = Flow::new(engine, sessions, outbox.clone(), directory, vec![ADMIN]);
        Harness {
            clock,
            store,
            outbox,
            flow,
            inbox,
        }
    }

    fn ann() -> Requester {
        Requester {
            id: 7,
            name: "Ann".into(),
            link: "https://vk.com/id7".into(),
        }
    }

    fn tuesday() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 20).unwrap()
    }

    async fn to_add_ons(h: &Harness, who: &Requester, slot: &str) -> Step {
        h.flow.start_booking(who).await.unwrap();
        h.flow
            .choose_date(who.id, &format_date_label(tuesday()))
            .await
            .unwrap();
        h.flow.choose_time(who, slot).await.unwrap()
    }

    #[tokio::test]
    async fn full_booking_dialog() {
        let mut h = harness();
        let who = ann();

        let Step::PickDate { dates } = h.flow.start_booking(&who).await.unwrap() else {
            panic!("expected dates");
        };
        assert_eq!(dates.first(), Some(&NaiveDate::from_ymd_opt(2026, 10, 19).unwrap()));

        let step = h
            .flow
            .choose_date(who.id, &format_date_label(tuesday()))
            .await
            .unwrap();
        let Step::PickTime { slots, .. } = step else {
            panic!("expected slots, got {step:?}");
        };
        assert_eq!(slots.len(), 6);

        h.flow.choose_time(&who, "10:30").await.unwrap();
        h.flow.toggle_add_on(who.id, "gel");
        h.flow.toggle_add_on(who.id, "powder");
        let step = h.flow.toggle_add_on(who.id, "gel");
        assert!(matches!(step, Step::PickAddOns { price: 105, .. }));

        let Step::Submitted { booking, price } = h.flow.submit_booking(&who).await.unwrap() else {
            panic!("expected submission");
        };
        assert_eq!(price, 105);
        assert_eq!(booking.status, BookingStatus::Pending);
        assert_eq!(booking.slot, Slot::from_hm(10, 30).unwrap());
        assert_eq!(booking.add_ons, BTreeSet::from([AddOn::Powder]));
        assert_eq!(h.flow.sessions().get(who.id), SessionState::Idle);

        let note = h.inbox.recv().await.unwrap();
        assert_eq!(note.recipient, ADMIN);
        assert!(note.text.contains("Tu - 20.10.26 at 10:30"));
        assert!(note.text.contains("Total: 105"));
    }

    #[tokio::test]
    async fn bad_input_keeps_the_step() {
        let h = harness();
        let who = ann();
        h.flow.start_booking(&who).await.unwrap();

        let step = h.flow.choose_date(who.id, "someday").await.unwrap();
        assert!(matches!(step, Step::Retry(InputError::BadDate(_))));
        let step = h.flow.choose_date(who.id, "Mo - 30.11.26").await.unwrap();
        assert!(matches!(step, Step::Retry(InputError::OutsideWindow(_))));
        assert_eq!(h.flow.sessions().get(who.id), SessionState::ChoosingDate);

        h.flow
            .choose_date(who.id, &format_date_label(tuesday()))
            .await
            .unwrap();
        let step = h.flow.choose_time(&who, "10:15").await.unwrap();
        assert!(matches!(step, Step::Retry(InputError::OffGrid(_))));
        let step = h.flow.choose_time(&who, "13:00").await.unwrap();
        assert!(matches!(step, Step::SlotTaken { .. }));

        h.flow.choose_time(&who, "10:00").await.unwrap();
        let step = h.flow.toggle_add_on(who.id, "starch");
        assert!(matches!(step, Step::Retry(InputError::UnknownAddOn(_))));
    }

    #[tokio::test]
    async fn steps_out_of_order_have_no_session() {
        let h = harness();
        let who = ann();
        assert_eq!(h.flow.choose_date(who.id, "Tu - 20.10.26").await.unwrap(), Step::NoSession);
        assert_eq!(h.flow.choose_time(&who, "10:00").await.unwrap(), Step::NoSession);
        assert_eq!(h.flow.toggle_add_on(who.id, "gel"), Step::NoSession);
        assert_eq!(h.flow.submit_booking(&who).await.unwrap(), Step::NoSession);
        assert_eq!(h.flow.finish_reject(ADMIN, "Admin", "x").await.unwrap(), Step::NoSession);
    }

    #[tokio::test]
    async fn session_times_out() {
        let h = harness();
        let who = ann();
        to_add_ons(&h, &who, "10:00").await;
        h.clock.advance(TimeDelta::minutes(20));
        assert_eq!(h.flow.submit_booking(&who).await.unwrap(), Step::NoSession);
    }

    #[tokio::test]
    async fn blacklisted_requester_is_refused() {
        let h = harness();
        assert_eq!(
            h.flow.ban(ADMIN, "https://vk.com/ID7").await.unwrap(),
            Step::Banned {
                identity: "https://vk.com/id7".into(),
                newly: true
            }
        );
        assert!(matches!(
            h.flow.ban(ADMIN, "@id7").await.unwrap(),
            Step::Banned { newly: false, .. }
        ));
        assert_eq!(h.flow.start_booking(&ann()).await.unwrap(), Step::Blacklisted);

        assert!(matches!(
            h.flow.unban(ADMIN, "id7").await.unwrap(),
            Step::Unbanned { removed: true, .. }
        ));
        assert!(matches!(
            h.flow.start_booking(&ann()).await.unwrap(),
            Step::PickDate { .. }
        ));
        assert_eq!(h.flow.ban(7, "id8").await.unwrap(), Step::NotAdmin);
    }

    #[tokio::test]
    async fn ban_by_screen_name_holds_for_any_link_form() {
        let h = harness();
        assert_eq!(
            h.flow.ban(ADMIN, "https://vk.com/Ann.Smith").await.unwrap(),
            Step::Banned {
                identity: "https://vk.com/id7".into(),
                newly: true
            }
        );
        // the requester shows up under a different link than the admin typed
        let renamed = Requester {
            link: "https://vk.com/ann_new_name".into(),
            ..ann()
        };
        assert_eq!(h.flow.start_booking(&renamed).await.unwrap(), Step::Blacklisted);
        assert_eq!(h.flow.start_booking(&ann()).await.unwrap(), Step::Blacklisted);

        assert_eq!(
            h.flow.ban(ADMIN, "@nobody_here").await.unwrap(),
            Step::UnknownProfile {
                link: "@nobody_here".into()
            }
        );
        assert!(matches!(
            h.flow.unban(ADMIN, "@ann.smith").await.unwrap(),
            Step::Unbanned { removed: true, .. }
        ));
    }

    #[tokio::test]
    async fn slot_taken_between_choice_and_submit() {
        let h = harness();
        let who = ann();
        let rival = Requester {
            id: 8,
            name: "Bob".into(),
            link: "https://vk.com/id8".into(),
        };
        to_add_ons(&h, &who, "10:00").await;
        to_add_ons(&h, &rival, "10:00").await;

        assert!(matches!(
            h.flow.submit_booking(&rival).await.unwrap(),
            Step::Submitted { .. }
        ));
        let Step::SlotTaken { slots } = h.flow.submit_booking(&who).await.unwrap() else {
            panic!("expected slot taken");
        };
        assert!(!slots.contains(&Slot::from_hm(10, 0).unwrap()));
        assert_eq!(
            h.flow.sessions().get(who.id),
            SessionState::ChoosingTime { date: tuesday() }
        );
    }

    #[tokio::test]
    async fn quota_stops_the_dialog() {
        let h = harness();
        let who = ann();
        for slot in ["09:00", "09:30", "10:00"] {
            to_add_ons(&h, &who, slot).await;
            h.flow.submit_booking(&who).await.unwrap();
        }
        let step = to_add_ons(&h, &who, "11:00").await;
        assert_eq!(step, Step::QuotaReached { limit: 3 });
        assert_eq!(h.flow.sessions().get(who.id), SessionState::Idle);
    }

    #[tokio::test]
    async fn admin_confirms_and_requester_hears() {
        let mut h = harness();
        let who = ann();
        let mut mine = h.outbox.subscribe(who.id);
        to_add_ons(&h, &who, "10:00").await;
        let Step::Submitted { booking, .. } = h.flow.submit_booking(&who).await.unwrap() else {
            panic!("expected submission");
        };
        let _ = h.inbox.recv().await;

        assert_eq!(h.flow.confirm(7, "Ann", booking.id).await.unwrap(), Step::NotAdmin);
        let Step::Confirmed(b) = h.flow.confirm(ADMIN, "Admin", booking.id).await.unwrap() else {
            panic!("expected confirmation");
        };
        assert_eq!(b.confirmed_by.as_deref(), Some("Admin"));
        assert!(mine.recv().await.unwrap().text.contains("confirmed"));

        assert_eq!(
            h.flow.confirm(ADMIN, "Admin", booking.id).await.unwrap(),
            Step::AlreadyHandled(booking.id)
        );
    }

    #[tokio::test]
    async fn reject_asks_for_a_reason() {
        let h = harness();
        let who = ann();
        let mut mine = h.outbox.subscribe(who.id);
        to_add_ons(&h, &who, "10:00").await;
        let Step::Submitted { booking, .. } = h.flow.submit_booking(&who).await.unwrap() else {
            panic!("expected submission");
        };

        assert_eq!(
            h.flow.begin_reject(ADMIN, booking.id).await.unwrap(),
            Step::AskReason { booking: booking.id }
        );
        assert_eq!(
            h.flow.finish_reject(ADMIN, "Admin", " machine broken ").await.unwrap(),
            Step::Rejected { booking: booking.id }
        );
        let text = mine.recv().await.unwrap().text;
        assert!(text.contains("declined"));
        assert!(text.ends_with("Reason: machine broken"));

        let all = BookingStore::fetch_all(h.store.as_ref()).await.unwrap();
        let stored = all.iter().find(|b| b.id == booking.id).unwrap();
        assert_eq!(stored.status, BookingStatus::Rejected);
        assert_eq!(stored.decline_reason.as_deref(), Some("machine broken"));

        assert_eq!(
            h.flow.begin_reject(ADMIN, booking.id).await.unwrap(),
            Step::AlreadyHandled(booking.id)
        );
    }

    #[tokio::test]
    async fn admin_blocks_a_slot() {
        let h = harness();
        assert_eq!(h.flow.begin_block(7).await.unwrap(), Step::NotAdmin);
        assert!(matches!(
            h.flow.begin_block(ADMIN).await.unwrap(),
            Step::PickDate { .. }
        ));
        let step = h
            .flow
            .choose_block_date(ADMIN, &format_date_label(tuesday()))
            .await
            .unwrap();
        assert!(matches!(step, Step::PickTime { .. }));
        let Step::Blocked(b) = h.flow.choose_block_time(ADMIN, "Admin", "11:30").await.unwrap() else {
            panic!("expected block");
        };
        assert_eq!(b.status, BookingStatus::Blocked);
        assert_eq!(b.requester_id, None);

        let step = to_add_ons(&h, &ann(), "11:30").await;
        assert!(matches!(step, Step::SlotTaken { .. }));
    }

    async fn submitted(h: &Harness, who: &Requester, slot: &str) -> Booking {
        to_add_ons(h, who, slot).await;
        match h.flow.submit_booking(who).await.unwrap() {
            Step::Submitted { booking, .. } => booking,
            other => panic!("expected submission, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn requester_cancels_and_admins_hear() {
        let h = harness();
        let who = ann();
        let booking = submitted(&h, &who, "10:00").await;
        let mut admin_inbox = h.outbox.subscribe(ADMIN);

        let Step::MyBookings(mine) = h.flow.my_bookings(who.id).await.unwrap() else {
            panic!("expected booking list");
        };
        assert_eq!(mine, vec![booking.clone()]);

        let rival = Requester {
            id: 8,
            name: "Bob".into(),
            link: "https://vk.com/id8".into(),
        };
        assert_eq!(
            h.flow.cancel_booking(&rival, booking.id).await.unwrap(),
            Step::NotFound(booking.id)
        );
        assert_eq!(
            h.flow.cancel_booking(&who, booking.id).await.unwrap(),
            Step::Cancelled(booking.clone())
        );
        let note = admin_inbox.recv().await.unwrap().text;
        assert!(note.contains("Ann (https://vk.com/id7) cancelled booking"));
        assert!(note.contains("Tu - 20.10.26 at 10:00"));

        assert_eq!(
            h.flow.cancel_booking(&who, booking.id).await.unwrap(),
            Step::AlreadyHandled(booking.id)
        );
        assert_eq!(h.flow.my_bookings(who.id).await.unwrap(), Step::MyBookings(vec![]));
    }

    #[tokio::test]
    async fn admin_completes_and_requester_hears() {
        let h = harness();
        let who = ann();
        let booking = submitted(&h, &who, "10:00").await;
        let mut mine = h.outbox.subscribe(who.id);

        // only confirmed bookings can be completed
        assert_eq!(
            h.flow.complete_booking(ADMIN, booking.id).await.unwrap(),
            Step::AlreadyHandled(booking.id)
        );
        h.flow.confirm(ADMIN, "Admin", booking.id).await.unwrap();
        let _ = mine.recv().await;

        assert_eq!(h.flow.complete_booking(7, booking.id).await.unwrap(), Step::NotAdmin);
        let Step::Completed(done) = h.flow.complete_booking(ADMIN, booking.id).await.unwrap() else {
            panic!("expected completion");
        };
        assert_eq!(done.id, booking.id);
        assert!(mine.recv().await.unwrap().text.contains("is complete"));
        assert!(BookingStore::fetch_all(h.store.as_ref()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn admin_unblocks_a_slot() {
        let h = harness();
        h.flow.begin_block(ADMIN).await.unwrap();
        h.flow
            .choose_block_date(ADMIN, &format_date_label(tuesday()))
            .await
            .unwrap();
        let Step::Blocked(block) = h.flow.choose_block_time(ADMIN, "Admin", "11:30").await.unwrap() else {
            panic!("expected block");
        };

        assert_eq!(h.flow.unblock(7, block.id).await.unwrap(), Step::NotAdmin);
        assert_eq!(
            h.flow.unblock(ADMIN, block.id).await.unwrap(),
            Step::Unblocked(block.clone())
        );
        assert_eq!(
            h.flow.unblock(ADMIN, block.id).await.unwrap(),
            Step::AlreadyHandled(block.id)
        );
        let step = to_add_ons(&h, &ann(), "11:30").await;
        assert!(matches!(step, Step::PickAddOns { .. }));
    }
}
