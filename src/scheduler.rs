use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeDelta, Utc};
use tracing::{debug, info, warn};

use crate::clock::format_date_label;
use crate::config::Config;
use crate::detector::ChangeDetector;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::notify::{Notifier, deliver, notify_admins};
use crate::observability::{BOOKINGS_COMPLETED_TOTAL, BOOKINGS_SWEPT_TOTAL, TICK_DURATION_SECONDS};

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub tick: Duration,
    /// How long before the start the reminder goes out.
    pub notify_before: TimeDelta,
    pub service_duration: TimeDelta,
    /// Grace period after the wash before the booking counts as done.
    pub notify_after: TimeDelta,
    pub admins: Vec<UserId>,
}

impl From<&Config> for SchedulerSettings {
    fn from(cfg: &Config) -> Self {
        Self {
            tick: cfg.tick,
            notify_before: cfg.notify_before,
            service_duration: cfg.service_duration,
            notify_after: cfg.notify_after,
            admins: cfg.admin_ids.clone(),
        }
    }
}

impl SchedulerSettings {
    fn tick_delta(&self) -> TimeDelta {
        TimeDelta::from_std(self.tick).unwrap_or(TimeDelta::seconds(60))
    }
}

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub reminders: usize,
    pub completed: usize,
    pub swept: usize,
    pub expired_evicted: usize,
    pub change_detected: bool,
    pub errors: usize,
}

/// Timed reminders, completion notices, and cleanup of finished bookings.
pub struct Scheduler {
    engine: Arc<Engine>,
    notifier: Arc<dyn Notifier>,
    detector: Arc<ChangeDetector>,
    settings: SchedulerSettings,
}

impl Scheduler {
    pub fn new(
        engine: Arc<Engine>,
        notifier: Arc<dyn Notifier>,
        detector: Arc<ChangeDetector>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            engine,
            notifier,
            detector,
            settings,
        }
    }

    fn start_of(&self, booking: &Booking) -> DateTime<Utc> {
        self.engine
            .settings()
            .service_time
            .slot_start(booking.date, booking.slot)
    }

    fn end_of(&self, booking: &Booking) -> DateTime<Utc> {
        self.start_of(booking) + self.settings.service_duration + self.settings.notify_after
    }

    /// One pass. Never fails: per-item problems are logged and counted.
    pub async fn tick(&self) -> TickReport {
        let started = Instant::now();
        let mut report = TickReport::default();
        let now = self.engine.clock().now();
        let tick = self.settings.tick_delta();

        match self.engine.confirmed_on(self.engine.today()).await {
            Ok(today) => {
                for booking in &today {
                    self.process_today(booking, now, tick, &mut report).await;
                }
            }
            Err(e) => {
                warn!("scheduler: reading today's bookings failed: {e}");
                report.errors += 1;
            }
        }

        self.sweep(now, &mut report).await;

        report.expired_evicted = self.engine.cache().clear_expired();
        match self.detector.check().await {
            Ok(changed) => report.change_detected = changed,
            Err(e) => {
                warn!("scheduler: change check failed: {e}");
                report.errors += 1;
            }
        }

        metrics::histogram!(TICK_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
        report
    }

    async fn process_today(
        &self,
        booking: &Booking,
        now: DateTime<Utc>,
        tick: TimeDelta,
        report: &mut TickReport,
    ) {
        let lead = self.settings.notify_before;
        let until_start = self.start_of(booking) - now;
        let window_start = (lead - tick).max(TimeDelta::zero());
        if window_start <= until_start && until_start <= lead {
            self.remind(booking).await;
            report.reminders += 1;
        }

        let since_end = now - self.end_of(booking);
        if TimeDelta::zero() <= since_end && since_end < tick {
            self.announce_completion(booking).await;
            match self.engine.complete(booking.id).await {
                Ok(_) => {
                    report.completed += 1;
                    metrics::counter!(BOOKINGS_COMPLETED_TOTAL).increment(1);
                }
                Err(EngineError::AlreadyHandled(id)) => {
                    debug!("scheduler: booking {id} already gone");
                }
                Err(e) => {
                    warn!("scheduler: removing finished booking {} failed: {e}", booking.id);
                    report.errors += 1;
                }
            }
        }
    }

    async fn remind(&self, booking: &Booking) {
        let minutes = self.settings.notify_before.num_minutes();
        let when = format!("{} {}", format_date_label(booking.date), booking.slot);
        if let Some(user) = booking.requester_id {
            let text = format!(
                "Your wash starts in {minutes} minutes.\nDate: {when}\nAdd-ons: {}",
                describe_add_ons(&booking.add_ons)
            );
            deliver(self.notifier.as_ref(), user, &text, "reminder").await;
        }
        let text = format!(
            "Wash for {} starts in {minutes} minutes ({when}).",
            booking.requester_name
        );
        notify_admins(self.notifier.as_ref(), &self.settings.admins, &text, "reminder").await;
    }

    async fn announce_completion(&self, booking: &Booking) {
        let when = format!("{} {}", format_date_label(booking.date), booking.slot);
        if let Some(user) = booking.requester_id {
            let text = format!("Your wash is finished.\nDate: {when}");
            deliver(self.notifier.as_ref(), user, &text, "completion").await;
        }
        let text = format!("Wash for {} finished ({when}).", booking.requester_name);
        notify_admins(self.notifier.as_ref(), &self.settings.admins, &text, "completion").await;
    }

    /// Catch-up for missed ticks: any confirmed booking, any day, whose end
    /// has passed is removed without notice.
    async fn sweep(&self, now: DateTime<Utc>, report: &mut TickReport) {
        let confirmed = match self.engine.confirmed_bookings().await {
            Ok(list) => list,
            Err(e) => {
                warn!("scheduler: reading confirmed bookings failed: {e}");
                report.errors += 1;
                return;
            }
        };
        for booking in confirmed.iter().filter(|b| now > self.end_of(b)) {
            match self.engine.discard(booking.id).await {
                Ok(true) => {
                    info!(
                        "swept overdue booking {} ({} {})",
                        booking.id, booking.date, booking.slot
                    );
                    report.swept += 1;
                    metrics::counter!(BOOKINGS_SWEPT_TOTAL).increment(1);
                }
                Ok(false) => {}
                Err(e) => {
                    warn!("scheduler: sweeping booking {} failed: {e}", booking.id);
                    report.errors += 1;
                }
            }
        }
    }
}

/// Background task: one tick per period, forever.
pub async fn run_scheduler(scheduler: Arc<Scheduler>) {
    let mut interval = tokio::time::interval(scheduler.settings.tick);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let report = scheduler.tick().await;
        if report != TickReport::default() {
            debug!("scheduler tick: {report:?}");
        }
    }
}
