//! Expiration of unconfirmed bookings.
//!
//! A pending booking must be confirmed before its deadline:
//!
//! - play within [`SHORT_WINDOW_HOURS`]: deadline is
//!   [`CONFIRM_BEFORE_PLAY_HOURS`] before play starts;
//! - otherwise: [`STANDARD_WINDOW_HOURS`] after the booking was made.
//!
//! Once the deadline passes the booking expires and its slot is released.
//! Inside the last [`WARNING_WINDOW_HOURS`] before the deadline one warning
//! goes out, claimed through `expiration_warning_sent` before it is sent.

use std::time::Instant;

use chrono::{DateTime, TimeDelta, Utc};
use ulid::Ulid;

use crate::model::*;
use crate::notices::{self, Notice};
use crate::observability::{
    SWEEP_DURATION_SECONDS, SWEEP_ERRORS_TOTAL, SWEEP_EXPIRED_TOTAL, SWEEP_RUNS_TOTAL, SWEEP_WARNINGS_TOTAL,
};
use crate::store::{BookingPatch, StoreError};

use super::{Engine, EngineError};

/// Play this close (or closer) switches to the confirm-before-play rule.
pub const SHORT_WINDOW_HOURS: i64 = 48;
/// Under the short window, confirmation is due this long before play.
pub const CONFIRM_BEFORE_PLAY_HOURS: i64 = 12;
/// Otherwise, confirmation is due this long after creation.
pub const STANDARD_WINDOW_HOURS: i64 = 48;
/// A warning is due once the deadline is this close.
pub const WARNING_WINDOW_HOURS: i64 = 24;

/// When a pending booking for play at `play_starts` lapses.
pub fn deadline(play_starts: DateTime<Utc>, created_at: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
    if play_starts - now <= TimeDelta::hours(SHORT_WINDOW_HOURS) {
        play_starts - TimeDelta::hours(CONFIRM_BEFORE_PLAY_HOURS)
    } else {
        created_at + TimeDelta::hours(STANDARD_WINDOW_HOURS)
    }
}

/// Whole hours left, rounded up, never negative.
fn hours_ceil(remaining: TimeDelta) -> i64 {
    let secs = remaining.num_seconds();
    if secs <= 0 { 0 } else { (secs + 3599) / 3600 }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Expire,
    Warn { deadline: DateTime<Utc>, hours_remaining: i64 },
    Keep,
}

/// What one sweep should do with a pending booking.
pub fn evaluate(booking: &Booking, play_starts: DateTime<Utc>, now: DateTime<Utc>) -> Verdict {
    let due = deadline(play_starts, booking.created_at, now);
    if now >= due {
        return Verdict::Expire;
    }
    if !booking.expiration_warning_sent && due - now <= TimeDelta::hours(WARNING_WINDOW_HOURS) {
        return Verdict::Warn { deadline: due, hours_remaining: hours_ceil(due - now) };
    }
    Verdict::Keep
}

/// Read-only expiry state for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpirationInfo {
    pub expiration_time: DateTime<Utc>,
    pub hours_remaining: i64,
    pub is_expired: bool,
    pub will_expire_soon: bool,
}

pub fn expiration_info(booking: &Booking, play_starts: DateTime<Utc>, now: DateTime<Utc>) -> ExpirationInfo {
    let due = deadline(play_starts, booking.created_at, now);
    let hours_remaining = hours_ceil(due - now);
    ExpirationInfo {
        expiration_time: due,
        hours_remaining,
        is_expired: booking.status == BookingStatus::Expired || booking.expired_at.is_some() || now >= due,
        will_expire_soon: hours_remaining > 0 && hours_remaining <= WARNING_WINDOW_HOURS,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepOptions {
    pub send_emails: bool,
    /// Limit the sweep to these bookings.
    pub booking_ids: Option<Vec<Ulid>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepFailure {
    pub booking_id: Ulid,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: Vec<Ulid>,
    pub warnings: Vec<Ulid>,
    pub errors: Vec<SweepFailure>,
}

impl SweepReport {
    pub fn error_ids(&self) -> Vec<Ulid> {
        self.errors.iter().map(|f| f.booking_id).collect()
    }
}

enum Outcome {
    Expired,
    Warned,
    Untouched,
}

impl Engine {
    /// Run one expiration sweep over pending bookings.
    ///
    /// Each booking is handled on its own; a failure is recorded in the
    /// report and the sweep moves on. Only failing to list the pending
    /// bookings aborts the sweep.
    pub async fn check_and_expire_bookings(&self, options: SweepOptions) -> Result<SweepReport, EngineError> {
        let started = Instant::now();
        let pending = self.store.pending_bookings(options.booking_ids.as_deref()).await?;
        let now = self.clock.now();

        let mut report = SweepReport::default();
        for booking in &pending {
            match self.sweep_one(booking, now, options.send_emails).await {
                Ok(Outcome::Expired) => report.expired.push(booking.id),
                Ok(Outcome::Warned) => report.warnings.push(booking.id),
                Ok(Outcome::Untouched) => {}
                Err(e) => {
                    tracing::warn!(booking = %booking.id, error = %e, "sweep failed for booking");
                    report.errors.push(SweepFailure { booking_id: booking.id, message: e.to_string() });
                }
            }
        }

        metrics::counter!(SWEEP_RUNS_TOTAL).increment(1);
        metrics::counter!(SWEEP_EXPIRED_TOTAL).increment(report.expired.len() as u64);
        metrics::counter!(SWEEP_WARNINGS_TOTAL).increment(report.warnings.len() as u64);
        metrics::counter!(SWEEP_ERRORS_TOTAL).increment(report.errors.len() as u64);
        metrics::histogram!(SWEEP_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
        tracing::info!(
            scanned = pending.len(),
            expired = report.expired.len(),
            warnings = report.warnings.len(),
            errors = report.errors.len(),
            "expiration sweep finished"
        );
        Ok(report)
    }

    async fn sweep_one(&self, booking: &Booking, now: DateTime<Utc>, send_emails: bool) -> Result<Outcome, EngineError> {
        let play_starts = self.tz.instant(booking.booking_date, booking.start_time);
        match evaluate(booking, play_starts, now) {
            Verdict::Keep => Ok(Outcome::Untouched),
            Verdict::Expire => self.expire(booking, now, send_emails).await,
            // Without email the warning waits for a sweep that can send it.
            Verdict::Warn { .. } if !send_emails => Ok(Outcome::Untouched),
            Verdict::Warn { deadline, hours_remaining } => {
                self.warn(booking, deadline, hours_remaining).await
            }
        }
    }

    /// Status first, so a failed email never leaves the slot held.
    async fn expire(&self, booking: &Booking, now: DateTime<Utc>, send_emails: bool) -> Result<Outcome, EngineError> {
        let patch = BookingPatch {
            status: Some(BookingStatus::Expired),
            expired_at: Some(now),
            ..Default::default()
        };
        match self.store.update_booking(booking.id, BookingStatus::Pending, patch).await {
            Ok(_) => {}
            Err(StoreError::StaleRow(_)) => {
                tracing::debug!(booking = %booking.id, "booking changed before expiry, skipping");
                return Ok(Outcome::Untouched);
            }
            Err(e) => return Err(e.into()),
        }
        tracing::info!(booking = %booking.id, court = %booking.court_id, date = %booking.booking_date, "booking expired");

        // The booking will not be swept again, so both notices go out
        // whatever happens to the other.
        let notice = notices::expired(booking);
        let emailed = if send_emails { self.email_contact(booking, &notice).await } else { Ok(()) };
        let notified = self.notify_user(booking, &notice, now).await;
        emailed.and(notified)?;
        Ok(Outcome::Expired)
    }

    /// Claim first so overlapping sweeps warn once. A failed email gives the
    /// claim back for the next sweep to retry.
    async fn warn(&self, booking: &Booking, deadline: DateTime<Utc>, hours_remaining: i64) -> Result<Outcome, EngineError> {
        match self.store.claim_warning(booking.id).await {
            Ok(_) => {}
            Err(StoreError::StaleRow(_)) => {
                tracing::debug!(booking = %booking.id, "warning already claimed, skipping");
                return Ok(Outcome::Untouched);
            }
            Err(e) => return Err(e.into()),
        }

        let notice = notices::warning(booking, hours_remaining, self.tz.local(deadline).naive_local());
        if let Err(e) = self.email_contact(booking, &notice).await {
            self.release_warning(booking.id).await;
            return Err(e);
        }
        self.notify_user(booking, &notice, self.clock.now()).await?;
        tracing::info!(booking = %booking.id, hours_remaining, "expiration warning sent");
        Ok(Outcome::Warned)
    }

    async fn release_warning(&self, id: Ulid) {
        let patch = BookingPatch { expiration_warning_sent: Some(false), ..Default::default() };
        match self.store.update_booking(id, BookingStatus::Pending, patch).await {
            Ok(_) | Err(StoreError::StaleRow(_)) => {}
            Err(e) => tracing::warn!(booking = %id, error = %e, "failed to release warning claim"),
        }
    }

    /// Registered user's email, else the guest's.
    async fn contact_email(&self, identity: &Identity) -> Result<Option<String>, EngineError> {
        match identity {
            Identity::Registered { user_id } => Ok(self.store.user(*user_id).await?.and_then(|u| u.email)),
            Identity::Guest(guest) => Ok(guest.email.clone()),
        }
    }

    async fn email_contact(&self, booking: &Booking, notice: &Notice) -> Result<(), EngineError> {
        match self.contact_email(&booking.identity).await? {
            Some(to) => {
                self.mailer.send(notice.email(&to)).await?;
            }
            None => tracing::debug!(booking = %booking.id, "no contact email, notice not emailed"),
        }
        Ok(())
    }

    /// In-app notification. Guests have no inbox.
    async fn notify_user(&self, booking: &Booking, notice: &Notice, now: DateTime<Utc>) -> Result<(), EngineError> {
        let Some(user_id) = booking.identity.user_id() else {
            return Ok(());
        };
        let notification = Notification {
            id: Ulid::new(),
            user_id,
            kind: notice.kind,
            title: notice.title.clone(),
            message: notice.message.clone(),
            link: Some(notice.link.clone()),
            created_at: now,
        };
        self.store.create_notification(notification).await?;
        Ok(())
    }

    /// Expiry state of one booking, without changing anything.
    pub async fn expiration_info(&self, booking_id: Ulid) -> Result<ExpirationInfo, EngineError> {
        let booking = self
            .store
            .booking(booking_id)
            .await?
            .ok_or_else(|| EngineError::not_found("booking", booking_id))?;
        let play_starts = self.tz.instant(booking.booking_date, booking.start_time);
        Ok(expiration_info(&booking, play_starts, self.clock.now()))
    }
}
