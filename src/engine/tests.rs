use super::*;
use crate::clock::FixedClock;
use crate::mailer::{Delivery, MailError, Mailer, OutgoingEmail};
use crate::notify::NotifyHub;
use crate::store::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeDelta, Utc, Weekday};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

// ── Fixtures ─────────────────────────────────────────────

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("courtside_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn utc(s: &str) -> DateTime<Utc> {
    s.parse().unwrap()
}

fn date(m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, m, d).unwrap()
}

fn t(h: u8, m: u8) -> SlotTime {
    SlotTime::at(h, m)
}

/// Records every email; addresses in `failing` bounce.
#[derive(Default)]
struct RecordingMailer {
    sent: Mutex<Vec<OutgoingEmail>>,
    failing: Mutex<Vec<String>>,
    latency: Mutex<Duration>,
}

impl RecordingMailer {
    fn sent(&self) -> Vec<OutgoingEmail> {
        self.sent.lock().unwrap().clone()
    }

    fn bounce(&self, address: &str) {
        self.failing.lock().unwrap().push(address.to_string());
    }

    fn heal(&self) {
        self.failing.lock().unwrap().clear();
    }

    fn slow_down(&self, latency: Duration) {
        *self.latency.lock().unwrap() = latency;
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, email: OutgoingEmail) -> Result<Delivery, MailError> {
        let latency = *self.latency.lock().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if self.failing.lock().unwrap().contains(&email.to) {
            return Err(MailError::Transport("550 mailbox unavailable".into()));
        }
        self.sent.lock().unwrap().push(email);
        Ok(Delivery::Sent)
    }
}

struct Harness {
    engine: Arc<Engine>,
    clock: Arc<FixedClock>,
    mailer: Arc<RecordingMailer>,
}

/// 2026-02-17T02:00Z is 10:00 on Tuesday 17 Feb at the facility (UTC+8).
const START: &str = "2026-02-17T02:00:00Z";

async fn harness(name: &str) -> Harness {
    let store = Arc::new(MemoryStore::open(test_wal_path(name), Arc::new(NotifyHub::new())).unwrap());
    let clock = Arc::new(FixedClock::new(utc(START)));
    let mailer = Arc::new(RecordingMailer::default());
    let engine = Arc::new(Engine::new(store, clock.clone(), mailer.clone(), EngineSettings::default()));
    for n in 1..=3 {
        engine.add_court(CourtId(n), &format!("Court {n}"), None).await.unwrap();
    }
    Harness { engine, clock, mailer }
}

fn slot(court: u32, day: NaiveDate, start: SlotTime) -> SlotRequest {
    SlotRequest { court: CourtId(court), date: day, start }
}

fn request(slots: Vec<SlotRequest>, identity: Identity) -> SlotsRequest {
    SlotsRequest {
        sport: Sport::Badminton,
        slots,
        identity,
        status: BookingStatus::Pending,
        payment_status: PaymentStatus::Unpaid,
    }
}

fn guest(name: &str, email: Option<&str>) -> Identity {
    Identity::Guest(GuestContact { name: name.into(), phone: None, email: email.map(str::to_string) })
}

async fn member(engine: &Engine, email: &str) -> Identity {
    let user = engine.register_user("Mina Tan", Some(email)).await.unwrap();
    Identity::Registered { user_id: user.id }
}

fn weekly(court: u32, day: Weekday, start: SlotTime, end: SlotTime, from: NaiveDate) -> SeriesRequest {
    SeriesRequest {
        courts: vec![CourtId(court)],
        weekdays: vec![day],
        start,
        end,
        dates: DateRange::open_from(from),
        sport: Sport::Badminton,
        identity: guest("Thursday club", None),
        hourly_rate: None,
        label: Some("club night".into()),
    }
}

// ── Allocation ───────────────────────────────────────────

#[tokio::test]
async fn allocation_prices_each_slot() {
    let h = harness("alloc_prices.wal").await;
    let booked = h
        .engine
        .allocate_bookings(request(
            vec![slot(1, date(2, 20), t(17, 30)), slot(1, date(2, 20), t(18, 0))],
            guest("Ana", None),
        ))
        .await
        .unwrap();
    assert_eq!(booked.len(), 2);
    assert_eq!(booked[0].total_amount, Money::from_cents(750));
    assert_eq!(booked[1].total_amount, Money::from_cents(900));
    assert_eq!(booked[1].end_time, t(18, 30));
    assert!(booked.iter().all(|b| b.status == BookingStatus::Pending));
    assert_eq!(h.engine.booking(booked[0].id).await.unwrap(), booked[0]);
}

#[tokio::test]
async fn allocation_is_all_or_nothing() {
    let h = harness("alloc_atomic.wal").await;
    let day = date(2, 20);
    assert_ok!(h.engine.allocate_bookings(request(vec![slot(1, day, t(10, 0))], guest("First", None))).await);

    let err = h
        .engine
        .allocate_bookings(request(
            vec![slot(1, day, t(9, 0)), slot(1, day, t(10, 0)), slot(1, day, t(10, 30))],
            guest("Second", None),
        ))
        .await
        .unwrap_err();
    let EngineError::SlotConflict(collisions) = err else {
        panic!("expected slot conflict, got {err:?}");
    };
    assert_eq!(collisions.len(), 1);
    assert_eq!(collisions[0].index, 1);
    assert_eq!(collisions[0].start, t(10, 0));

    let held = h.engine.store().active_bookings(CourtId(1), DateRange::day(day)).await.unwrap();
    assert_eq!(held.len(), 1);
}

#[tokio::test]
async fn duplicate_slots_in_one_request_conflict() {
    let h = harness("alloc_dupes.wal").await;
    let err = h
        .engine
        .allocate_bookings(request(
            vec![slot(2, date(2, 21), t(11, 0)), slot(2, date(2, 21), t(11, 0))],
            guest("Ana", None),
        ))
        .await
        .unwrap_err();
    assert!(matches!(&err, EngineError::SlotConflict(c) if c[0].source == ConflictSource::Batch(0)));
}

#[tokio::test]
async fn court_rate_overrides_sport_rate() {
    let h = harness("alloc_court_rate.wal").await;
    h.engine.set_court_rate(CourtId(2), Some(Money::whole(30))).await.unwrap();
    let booked = h
        .engine
        .allocate_bookings(request(vec![slot(2, date(2, 20), t(19, 0))], guest("Ana", None)))
        .await
        .unwrap();
    assert_eq!(booked[0].total_amount, Money::whole(15));
}

#[tokio::test]
async fn allocation_validates_input() {
    let h = harness("alloc_validate.wal").await;
    let day = date(2, 20);

    let err = h.engine.allocate_bookings(request(vec![], guest("Ana", None))).await.unwrap_err();
    assert_eq!(err, EngineError::Validation(ValidationError::EmptyRequest));

    let err = h
        .engine
        .allocate_bookings(request(vec![slot(1, day, t(10, 15))], guest("Ana", None)))
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::Validation(ValidationError::OffGrid(t(10, 15))));

    let err = h
        .engine
        .allocate_bookings(request(vec![slot(1, day, t(8, 30))], guest("Ana", None)))
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::Validation(ValidationError::OutsideOpeningHours(t(8, 30))));

    let err = h
        .engine
        .allocate_bookings(request(vec![slot(9, day, t(10, 0))], guest("Ana", None)))
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::Validation(ValidationError::UnknownCourt(CourtId(9))));

    let err = h
        .engine
        .allocate_bookings(request(vec![slot(1, day, t(10, 0))], guest("", None)))
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::Validation(ValidationError::MissingGuestName));

    h.engine.deactivate_court(CourtId(3)).await.unwrap();
    let err = h
        .engine
        .allocate_bookings(request(vec![slot(3, day, t(10, 0))], guest("Ana", None)))
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::Validation(ValidationError::InactiveCourt(CourtId(3))));
}

#[tokio::test]
async fn last_slot_of_the_day_ends_at_midnight() {
    let h = harness("alloc_last_slot.wal").await;
    let booked = h
        .engine
        .allocate_bookings(request(vec![slot(1, date(2, 20), t(23, 30))], guest("Ana", None)))
        .await
        .unwrap();
    assert_eq!(booked[0].end_time, SlotTime::MIDNIGHT);
    assert_eq!(booked[0].total_amount, Money::whole(9));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_for_one_slot_have_one_winner() {
    let h = harness("alloc_race.wal").await;
    let mut handles = Vec::new();
    for i in 0..16 {
        let engine = h.engine.clone();
        handles.push(tokio::spawn(async move {
            engine
                .allocate_bookings(request(vec![slot(1, date(2, 20), t(20, 0))], guest(&format!("Guest {i}"), None)))
                .await
        }));
    }
    let mut winners = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => winners += 1,
            Err(e) => assert!(e.is_conflict(), "unexpected error: {e}"),
        }
    }
    assert_eq!(winners, 1);
    let held = h.engine.store().active_bookings(CourtId(1), DateRange::day(date(2, 20))).await.unwrap();
    assert_eq!(held.len(), 1);
}

// ── Cross-entity conflicts ───────────────────────────────

#[tokio::test]
async fn recurring_series_blocks_matching_ad_hoc_slots() {
    let h = harness("recurring_blocks.wal").await;
    // 19 Feb 2026 is a Thursday.
    let rows = h
        .engine
        .create_recurring_series(weekly(1, Weekday::Thu, t(19, 0), t(20, 0), date(2, 1)))
        .await
        .unwrap();
    assert_eq!(rows.len(), 2);

    let err = h
        .engine
        .allocate_bookings(request(vec![slot(1, date(2, 26), t(19, 30))], guest("Ana", None)))
        .await
        .unwrap_err();
    assert!(matches!(&err, EngineError::SlotConflict(c) if matches!(c[0].source, ConflictSource::Recurring(_))));

    // Friday is free.
    assert_ok!(h.engine.allocate_bookings(request(vec![slot(1, date(2, 27), t(19, 30))], guest("Ana", None))).await);
}

#[tokio::test]
async fn series_rejected_by_future_booking_on_that_weekday() {
    let h = harness("series_vs_booking.wal").await;
    h.engine
        .allocate_bookings(request(vec![slot(1, date(3, 5), t(9, 30))], guest("Ana", None)))
        .await
        .unwrap();

    let err = h
        .engine
        .create_recurring_series(weekly(1, Weekday::Thu, t(9, 0), t(10, 0), date(2, 19)))
        .await
        .unwrap_err();
    assert!(matches!(&err, EngineError::SlotConflict(c) if c.len() == 1 && c[0].start == t(9, 30)));
    assert!(h.engine.store().recurring_rows(Some(CourtId(1))).await.unwrap().is_empty());
}

#[tokio::test]
async fn past_bookings_do_not_block_a_new_series() {
    let h = harness("series_vs_past.wal").await;
    // Booked for last Thursday, before "today" (17 Feb).
    h.engine
        .allocate_bookings(request(vec![slot(1, date(2, 12), t(9, 0))], guest("Ana", None)))
        .await
        .unwrap();
    assert_ok!(
        h.engine
            .create_recurring_series(weekly(1, Weekday::Thu, t(9, 0), t(10, 0), date(2, 1)))
            .await
    );
}

#[tokio::test]
async fn overlapping_series_conflict() {
    let h = harness("series_vs_series.wal").await;
    h.engine
        .create_recurring_series(weekly(2, Weekday::Mon, t(20, 0), t(21, 0), date(2, 23)))
        .await
        .unwrap();
    let err = h
        .engine
        .create_recurring_series(weekly(2, Weekday::Mon, t(20, 30), t(22, 0), date(3, 2)))
        .await
        .unwrap_err();
    assert!(matches!(&err, EngineError::SlotConflict(c) if matches!(c[0].source, ConflictSource::Recurring(_))));

    // Same times on another weekday are fine.
    assert_ok!(
        h.engine
            .create_recurring_series(weekly(2, Weekday::Tue, t(20, 30), t(22, 0), date(3, 2)))
            .await
    );
}

#[tokio::test]
async fn lessons_block_overlapping_slots_and_vice_versa() {
    let h = harness("lesson_conflicts.wal").await;
    let lesson = h
        .engine
        .schedule_lesson(LessonRequest {
            court: CourtId(1),
            date: date(2, 20),
            start: t(14, 0),
            end: t(15, 30),
            price: Money::whole(60),
            title: Some("Junior squad".into()),
        })
        .await
        .unwrap();
    assert_eq!(lesson.duration_minutes, 90);

    let err = h
        .engine
        .allocate_bookings(request(vec![slot(1, date(2, 20), t(15, 0))], guest("Ana", None)))
        .await
        .unwrap_err();
    assert!(matches!(&err, EngineError::SlotConflict(c) if c[0].source == ConflictSource::Lesson(lesson.id)));
    assert_ok!(h.engine.allocate_bookings(request(vec![slot(1, date(2, 20), t(15, 30))], guest("Ana", None))).await);

    let err = h
        .engine
        .schedule_lesson(LessonRequest {
            court: CourtId(1),
            date: date(2, 20),
            start: t(15, 0),
            end: t(16, 30),
            price: Money::whole(60),
            title: None,
        })
        .await
        .unwrap_err();
    assert!(err.is_conflict());
}

#[tokio::test]
async fn cancelled_lesson_releases_its_slots() {
    let h = harness("lesson_cancel.wal").await;
    let lesson = h
        .engine
        .schedule_lesson(LessonRequest {
            court: CourtId(2),
            date: date(2, 21),
            start: t(9, 0),
            end: t(10, 0),
            price: Money::whole(40),
            title: None,
        })
        .await
        .unwrap();
    assert!(!h.engine.free_slots(CourtId(2), date(2, 21)).await.unwrap().contains(&t(9, 30)));

    let cancelled = h.engine.cancel_lesson(lesson.id).await.unwrap();
    assert_eq!(cancelled.status, LessonStatus::Cancelled);
    assert!(h.engine.free_slots(CourtId(2), date(2, 21)).await.unwrap().contains(&t(9, 30)));

    let err = h.engine.complete_lesson(lesson.id).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidTransition { kind: "lesson", .. }));
}

#[tokio::test]
async fn free_slots_excludes_every_kind_of_hold() {
    let h = harness("free_slots.wal").await;
    let friday = date(2, 20);
    h.engine
        .allocate_bookings(request(vec![slot(1, friday, t(9, 0))], guest("Ana", None)))
        .await
        .unwrap();
    h.engine
        .create_recurring_series(weekly(1, Weekday::Fri, t(12, 0), t(12, 30), date(2, 1)))
        .await
        .unwrap();
    h.engine
        .schedule_lesson(LessonRequest {
            court: CourtId(1),
            date: friday,
            start: t(16, 0),
            end: t(17, 0),
            price: Money::whole(40),
            title: None,
        })
        .await
        .unwrap();

    let free = h.engine.free_slots(CourtId(1), friday).await.unwrap();
    assert_eq!(free.len(), 30 - 4);
    for taken in [t(9, 0), t(12, 0), t(16, 0), t(16, 30)] {
        assert!(!free.contains(&taken), "{taken} should be taken");
    }
    assert!(free.contains(&t(23, 30)));
}

// ── Booking transitions ──────────────────────────────────

#[tokio::test]
async fn confirm_then_cancel() {
    let h = harness("transitions.wal").await;
    let b = h
        .engine
        .allocate_bookings(request(vec![slot(1, date(2, 20), t(10, 0))], guest("Ana", None)))
        .await
        .unwrap()
        .remove(0);

    let confirmed = h.engine.confirm_booking(b.id, PaymentStatus::Paid).await.unwrap();
    assert_eq!(confirmed.status, BookingStatus::Confirmed);
    assert_eq!(confirmed.payment_status, PaymentStatus::Paid);

    let err = h.engine.confirm_booking(b.id, PaymentStatus::Paid).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidTransition { .. }));

    let cancelled = h.engine.cancel_booking(b.id).await.unwrap();
    assert_eq!(cancelled.status, BookingStatus::Cancelled);
    assert_err!(h.engine.cancel_booking(b.id).await);

    // The slot is free again.
    assert_ok!(h.engine.allocate_bookings(request(vec![slot(1, date(2, 20), t(10, 0))], guest("Ben", None))).await);
}

#[tokio::test]
async fn unknown_booking_is_not_found() {
    let h = harness("unknown_booking.wal").await;
    let err = h.engine.confirm_booking(Ulid::new(), PaymentStatus::Paid).await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound { kind: "booking", .. }));
}

// ── Expiration sweep ─────────────────────────────────────

/// A pending booking for 25 Feb 10:00 local, made at START. Deadline is
/// START + 48h = 2026-02-19T02:00Z.
async fn distant_booking(h: &Harness, identity: Identity) -> Booking {
    h.engine
        .allocate_bookings(request(vec![slot(1, date(2, 25), t(10, 0))], identity))
        .await
        .unwrap()
        .remove(0)
}

fn sweep(send_emails: bool) -> SweepOptions {
    SweepOptions { send_emails, booking_ids: None }
}

#[tokio::test]
async fn sweep_expires_after_deadline_and_notifies() {
    let h = harness("sweep_expire.wal").await;
    let identity = member(&h.engine, "mina@example.com").await;
    let b = distant_booking(&h, identity.clone()).await;

    let report = h.engine.check_and_expire_bookings(sweep(true)).await.unwrap();
    assert_eq!(report, SweepReport::default());

    h.clock.advance(TimeDelta::hours(49));
    let report = h.engine.check_and_expire_bookings(sweep(true)).await.unwrap();
    assert_eq!(report.expired, vec![b.id]);
    assert!(report.errors.is_empty());

    let expired = h.engine.booking(b.id).await.unwrap();
    assert_eq!(expired.status, BookingStatus::Expired);
    assert_eq!(expired.expired_at, Some(h.clock.now()));

    let sent = h.mailer.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, "mina@example.com");
    assert_eq!(sent[0].subject, "Your court booking has expired");

    let inbox = h.engine.notifications(identity.user_id().unwrap()).await.unwrap();
    assert_eq!(inbox.len(), 1);
    assert_eq!(inbox[0].kind, NotificationKind::BookingExpired);

    // The slot is released and a second sweep has nothing to do.
    assert!(h.engine.free_slots(CourtId(1), date(2, 25)).await.unwrap().contains(&t(10, 0)));
    let again = h.engine.check_and_expire_bookings(sweep(true)).await.unwrap();
    assert!(again.expired.is_empty());
}

#[tokio::test]
async fn warning_is_sent_exactly_once() {
    let h = harness("sweep_warn_once.wal").await;
    let identity = member(&h.engine, "mina@example.com").await;
    let b = distant_booking(&h, identity.clone()).await;

    h.clock.advance(TimeDelta::hours(30));
    let first = h.engine.check_and_expire_bookings(sweep(true)).await.unwrap();
    assert_eq!(first.warnings, vec![b.id]);
    assert!(h.mailer.sent()[0].subject.contains("18 hours"));
    assert!(h.engine.booking(b.id).await.unwrap().expiration_warning_sent);

    h.clock.advance(TimeDelta::hours(1));
    let second = h.engine.check_and_expire_bookings(sweep(true)).await.unwrap();
    assert!(second.warnings.is_empty());
    assert_eq!(h.mailer.sent().len(), 1);

    let inbox = h.engine.notifications(identity.user_id().unwrap()).await.unwrap();
    assert_eq!(inbox.len(), 1);
    assert_eq!(inbox[0].kind, NotificationKind::ExpirationWarning);
}

#[tokio::test]
async fn warning_waits_for_a_sweep_that_sends_email() {
    let h = harness("sweep_warn_no_email.wal").await;
    let b = distant_booking(&h, guest("Ana", Some("ana@example.com"))).await;

    h.clock.advance(TimeDelta::hours(30));
    let quiet = h.engine.check_and_expire_bookings(sweep(false)).await.unwrap();
    assert!(quiet.warnings.is_empty());
    assert!(!h.engine.booking(b.id).await.unwrap().expiration_warning_sent);

    let loud = h.engine.check_and_expire_bookings(sweep(true)).await.unwrap();
    assert_eq!(loud.warnings, vec![b.id]);
}

#[tokio::test]
async fn expiry_without_email_still_expires() {
    let h = harness("sweep_expire_quiet.wal").await;
    let b = distant_booking(&h, guest("Ana", Some("ana@example.com"))).await;
    h.clock.advance(TimeDelta::hours(49));
    let report = h.engine.check_and_expire_bookings(sweep(false)).await.unwrap();
    assert_eq!(report.expired, vec![b.id]);
    assert!(h.mailer.sent().is_empty());
}

#[tokio::test]
async fn failed_warning_email_is_isolated_and_retried() {
    let h = harness("sweep_isolation.wal").await;
    let bouncing = h
        .engine
        .allocate_bookings(request(vec![slot(2, date(2, 25), t(10, 0))], guest("Bo", Some("bo@example.com"))))
        .await
        .unwrap()
        .remove(0);
    let fine = distant_booking(&h, guest("Ana", Some("ana@example.com"))).await;
    h.mailer.bounce("bo@example.com");

    h.clock.advance(TimeDelta::hours(30));
    let report = h.engine.check_and_expire_bookings(sweep(true)).await.unwrap();
    assert_eq!(report.warnings, vec![fine.id]);
    assert_eq!(report.error_ids(), vec![bouncing.id]);
    assert!(report.errors[0].message.contains("mailbox unavailable"));
    assert!(!h.engine.booking(bouncing.id).await.unwrap().expiration_warning_sent);

    h.mailer.heal();
    let retry = h.engine.check_and_expire_bookings(sweep(true)).await.unwrap();
    assert_eq!(retry.warnings, vec![bouncing.id]);
    assert!(retry.errors.is_empty());
}

#[tokio::test]
async fn failed_expiry_email_still_releases_the_slot() {
    let h = harness("sweep_expiry_bounce.wal").await;
    let b = distant_booking(&h, guest("Bo", Some("bo@example.com"))).await;
    h.mailer.bounce("bo@example.com");

    h.clock.advance(TimeDelta::hours(49));
    let report = h.engine.check_and_expire_bookings(sweep(true)).await.unwrap();
    assert!(report.expired.is_empty());
    assert_eq!(report.error_ids(), vec![b.id]);
    assert_eq!(h.engine.booking(b.id).await.unwrap().status, BookingStatus::Expired);
}

#[tokio::test]
async fn member_is_notified_of_expiry_even_when_email_bounces() {
    let h = harness("sweep_expiry_bounce_member.wal").await;
    let identity = member(&h.engine, "mina@example.com").await;
    let b = distant_booking(&h, identity.clone()).await;
    h.mailer.bounce("mina@example.com");

    h.clock.advance(TimeDelta::hours(49));
    let report = h.engine.check_and_expire_bookings(sweep(true)).await.unwrap();
    assert_eq!(report.error_ids(), vec![b.id]);
    assert_eq!(h.engine.booking(b.id).await.unwrap().status, BookingStatus::Expired);

    let inbox = h.engine.notifications(identity.user_id().unwrap()).await.unwrap();
    assert_eq!(inbox.len(), 1);
    assert_eq!(inbox[0].kind, NotificationKind::BookingExpired);

    h.mailer.heal();
    let again = h.engine.check_and_expire_bookings(sweep(true)).await.unwrap();
    assert!(again.expired.is_empty());
    assert_eq!(h.engine.notifications(identity.user_id().unwrap()).await.unwrap().len(), 1);
}

#[tokio::test]
async fn overlapping_sweeps_warn_once() {
    let h = harness("sweep_warn_overlap.wal").await;
    let identity = member(&h.engine, "mina@example.com").await;
    let b = distant_booking(&h, identity.clone()).await;
    h.mailer.slow_down(Duration::from_millis(50));

    h.clock.advance(TimeDelta::hours(30));
    let scoped = SweepOptions { send_emails: true, booking_ids: Some(vec![b.id]) };
    let (full, single) = tokio::join!(
        h.engine.check_and_expire_bookings(sweep(true)),
        h.engine.check_and_expire_bookings(scoped),
    );
    let (full, single) = (full.unwrap(), single.unwrap());

    assert_eq!(full.warnings.len() + single.warnings.len(), 1);
    assert!(full.errors.is_empty() && single.errors.is_empty());
    assert_eq!(h.mailer.sent().len(), 1);
    assert_eq!(h.engine.notifications(identity.user_id().unwrap()).await.unwrap().len(), 1);
    assert!(h.engine.booking(b.id).await.unwrap().expiration_warning_sent);
}

#[tokio::test]
async fn guests_are_emailed_but_get_no_notification() {
    let h = harness("sweep_guest.wal").await;
    let b = distant_booking(&h, guest("Ana", Some("ana@example.com"))).await;
    h.clock.advance(TimeDelta::hours(49));
    let report = h.engine.check_and_expire_bookings(sweep(true)).await.unwrap();
    assert_eq!(report.expired, vec![b.id]);
    assert_eq!(h.mailer.sent()[0].to, "ana@example.com");
}

#[tokio::test]
async fn sweep_can_be_scoped_to_bookings() {
    let h = harness("sweep_scoped.wal").await;
    let a = distant_booking(&h, guest("Ana", None)).await;
    let other = h
        .engine
        .allocate_bookings(request(vec![slot(3, date(2, 25), t(10, 0))], guest("Bo", None)))
        .await
        .unwrap()
        .remove(0);

    h.clock.advance(TimeDelta::hours(49));
    let report = h
        .engine
        .check_and_expire_bookings(SweepOptions { send_emails: true, booking_ids: Some(vec![a.id]) })
        .await
        .unwrap();
    assert_eq!(report.expired, vec![a.id]);
    assert_eq!(h.engine.booking(other.id).await.unwrap().status, BookingStatus::Pending);
}

#[tokio::test]
async fn confirmed_bookings_are_never_swept() {
    let h = harness("sweep_confirmed.wal").await;
    let b = distant_booking(&h, guest("Ana", None)).await;
    h.engine.confirm_booking(b.id, PaymentStatus::Paid).await.unwrap();
    h.clock.advance(TimeDelta::hours(200));
    let report = h.engine.check_and_expire_bookings(sweep(true)).await.unwrap();
    assert_eq!(report, SweepReport::default());
    assert_eq!(h.engine.booking(b.id).await.unwrap().status, BookingStatus::Confirmed);
}

#[tokio::test]
async fn imminent_booking_uses_short_window() {
    let h = harness("sweep_short.wal").await;
    // 18 Feb 20:00 local = 18 Feb 12:00Z, 34h away: deadline 18 Feb 00:00Z.
    let b = h
        .engine
        .allocate_bookings(request(vec![slot(1, date(2, 18), t(20, 0))], guest("Ana", None)))
        .await
        .unwrap()
        .remove(0);
    let info = h.engine.expiration_info(b.id).await.unwrap();
    assert_eq!(info.expiration_time, utc("2026-02-18T00:00:00Z"));
    assert_eq!(info.hours_remaining, 22);
    assert!(info.will_expire_soon);
    assert!(!info.is_expired);

    h.clock.set(utc("2026-02-18T00:00:00Z"));
    let report = h.engine.check_and_expire_bookings(sweep(false)).await.unwrap();
    assert_eq!(report.expired, vec![b.id]);
    assert!(h.engine.expiration_info(b.id).await.unwrap().is_expired);
}

// ── Recurring groups ─────────────────────────────────────

#[tokio::test]
async fn series_rows_group_back_into_one_reservation() {
    let h = harness("groups.wal").await;
    let mut req = weekly(3, Weekday::Sat, t(17, 0), t(19, 0), date(2, 21));
    req.courts = vec![CourtId(3), CourtId(2)];
    let rows = h.engine.create_recurring_series(req).await.unwrap();
    assert_eq!(rows.len(), 8);

    let groups = h.engine.recurring_groups(None).await.unwrap();
    assert_eq!(groups.len(), 2);
    for g in &groups {
        assert_eq!((g.start_time, g.end_time), (t(17, 0), t(19, 0)));
        assert_eq!(g.duration_minutes, 120);
        assert_eq!(g.amount_per_session, Money::whole(33));
        assert_eq!(g.row_ids.len(), 4);
    }

    let court_3 = h.engine.recurring_groups(Some(CourtId(3))).await.unwrap();
    assert_eq!(court_3.len(), 1);
}

#[tokio::test]
async fn ending_a_series_frees_future_dates() {
    let h = harness("series_end.wal").await;
    let rows = h
        .engine
        .create_recurring_series(weekly(1, Weekday::Sat, t(9, 0), t(10, 0), date(2, 7)))
        .await
        .unwrap();
    let ids: Vec<Ulid> = rows.iter().map(|r| r.id).collect();

    let ended = h.engine.end_recurring_series(&ids).await.unwrap();
    assert!(ended.iter().all(|r| r.status == SeriesStatus::Inactive));
    // Last Saturday on or before Tue 17 Feb is 14 Feb.
    assert!(ended.iter().all(|r| r.dates.end == Some(date(2, 14))));

    let groups = h.engine.recurring_groups(Some(CourtId(1))).await.unwrap();
    assert_eq!(groups.len(), 1);
    assert!(!groups[0].is_active);

    assert_ok!(h.engine.allocate_bookings(request(vec![slot(1, date(2, 21), t(9, 0))], guest("Ana", None))).await);
}

#[tokio::test]
async fn series_with_custom_rate_prices_flat() {
    let h = harness("series_rate.wal").await;
    let mut req = weekly(2, Weekday::Wed, t(17, 0), t(19, 0), date(2, 18));
    req.hourly_rate = Some(Money::whole(20));
    h.engine.create_recurring_series(req).await.unwrap();
    let groups = h.engine.recurring_groups(Some(CourtId(2))).await.unwrap();
    assert_eq!(groups[0].amount_per_session, Money::whole(40));
}

// ── Job codes and admin ──────────────────────────────────

#[tokio::test]
async fn job_codes_follow_facility_month() {
    let h = harness("job_codes.wal").await;
    assert_eq!(h.engine.next_job_code().await.unwrap().to_string(), "FEB-001-2026");
    assert_eq!(h.engine.next_job_code().await.unwrap().to_string(), "FEB-002-2026");

    // 2026-02-28T16:30Z is already 1 March locally.
    h.clock.set(utc("2026-02-28T16:30:00Z"));
    assert_eq!(h.engine.next_job_code().await.unwrap().to_string(), "MAR-001-2026");
}

#[tokio::test]
async fn add_court_is_idempotent() {
    let h = harness("courts.wal").await;
    let again = h.engine.add_court(CourtId(1), "Renamed", None).await.unwrap();
    assert_eq!(again.name, "Court 1");
    assert_eq!(h.engine.courts().await.unwrap().len(), 3);

    let inactive = h.engine.deactivate_court(CourtId(2)).await.unwrap();
    assert!(!inactive.is_active);
    assert!(matches!(
        h.engine.set_court_rate(CourtId(7), None).await,
        Err(EngineError::NotFound { kind: "court", .. })
    ));
}
