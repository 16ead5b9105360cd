use std::collections::BTreeMap;
use std::time::Instant;

use chrono::{Datelike, Days, NaiveDate, Weekday};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::{ALLOCATION_DURATION_SECONDS, ROWS_CREATED_TOTAL, STORAGE_CONFLICTS_TOTAL};
use crate::slots::{slots_between, validate_range, validate_start};
use crate::store::{BookingPatch, SeriesPatch, StoreError, Transaction};

use super::conflict::{find_collisions, load_from_txn, Candidate, Occurrence};
use super::{Engine, EngineError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotRequest {
    pub court: CourtId,
    pub date: NaiveDate,
    pub start: SlotTime,
}

/// Ad-hoc slots reserved together, all or nothing. `status` and
/// `payment_status` are chosen upstream (guest vs. staff, paid vs. not).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotsRequest {
    pub sport: Sport,
    pub slots: Vec<SlotRequest>,
    pub identity: Identity,
    pub status: BookingStatus,
    pub payment_status: PaymentStatus,
}

/// A weekly series: every court × weekday × 30-minute slot in `[start, end)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesRequest {
    pub courts: Vec<CourtId>,
    pub weekdays: Vec<Weekday>,
    pub start: SlotTime,
    pub end: SlotTime,
    pub dates: DateRange,
    pub sport: Sport,
    pub identity: Identity,
    /// Replaces the court's and the sport's rate for the whole series.
    pub hourly_rate: Option<Money>,
    pub label: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LessonRequest {
    pub court: CourtId,
    pub date: NaiveDate,
    pub start: SlotTime,
    pub end: SlotTime,
    pub price: Money,
    pub title: Option<String>,
}

fn validate_identity(identity: &Identity) -> Result<(), ValidationError> {
    if let Identity::Guest(guest) = identity {
        if guest.name.trim().is_empty() {
            return Err(ValidationError::MissingGuestName);
        }
        if guest.name.len() > MAX_NAME_LEN {
            return Err(ValidationError::NameTooLong);
        }
    }
    Ok(())
}

fn validate_label(label: Option<&str>) -> Result<(), ValidationError> {
    match label {
        Some(l) if l.len() > MAX_LABEL_LEN => Err(ValidationError::LabelTooLong),
        _ => Ok(()),
    }
}

/// Most recent date on or before `today` that falls on `weekday`.
fn last_on_or_before(today: NaiveDate, weekday: Weekday) -> NaiveDate {
    let back = (7 + today.weekday().num_days_from_monday() - weekday.num_days_from_monday()) % 7;
    today.checked_sub_days(Days::new(u64::from(back))).unwrap_or(today)
}

impl Engine {
    /// Reserve every requested slot or none.
    ///
    /// The conflict check runs once against committed state to fail fast,
    /// then again under the transaction's court locks. A uniqueness violation
    /// at commit surfaces as [`EngineError::StorageConflict`].
    pub async fn allocate_bookings(&self, request: SlotsRequest) -> Result<Vec<Booking>, EngineError> {
        let started = Instant::now();
        if request.slots.is_empty() {
            return Err(ValidationError::EmptyRequest.into());
        }
        if request.slots.len() > MAX_BATCH_SIZE {
            return Err(ValidationError::BatchTooLarge(request.slots.len()).into());
        }
        if !request.status.is_active() {
            return Err(EngineError::InvalidTransition {
                kind: "booking",
                id: "new".into(),
                from: "new".into(),
                to: request.status.to_string(),
            });
        }
        validate_identity(&request.identity)?;

        let mut courts: BTreeMap<CourtId, Court> = BTreeMap::new();
        for slot in &request.slots {
            validate_start(slot.start)?;
            if !courts.contains_key(&slot.court) {
                courts.insert(slot.court, self.bookable_court(slot.court).await?);
            }
        }

        let candidates: Vec<Candidate> = request
            .slots
            .iter()
            .map(|s| Candidate::slot(s.court, s.date, s.start))
            .collect();
        self.check_candidates(&candidates).await?.into_result()?;

        let court_ids: Vec<CourtId> = courts.keys().copied().collect();
        let mut txn = self.store.begin(&court_ids).await?;
        let occupancy = load_from_txn(txn.as_mut(), &candidates).await?;
        find_collisions(&candidates, &occupancy).into_result()?;

        let now = self.clock.now();
        let mut created = Vec::with_capacity(request.slots.len());
        for slot in &request.slots {
            let end = slot.start.slot_end();
            let rate = courts.get(&slot.court).and_then(|c| c.hourly_rate);
            let booking = Booking {
                id: Ulid::new(),
                court_id: slot.court,
                sport: request.sport,
                booking_date: slot.date,
                start_time: slot.start,
                end_time: end,
                status: request.status,
                payment_status: request.payment_status,
                total_amount: self.rates.amount(request.sport, slot.start, end, rate),
                identity: request.identity.clone(),
                created_at: now,
                expired_at: None,
                expiration_warning_sent: false,
            };
            txn.insert_booking(booking.clone()).await?;
            created.push(booking);
        }
        self.commit(txn).await?;

        metrics::counter!(ROWS_CREATED_TOTAL, "kind" => "single").increment(created.len() as u64);
        metrics::histogram!(ALLOCATION_DURATION_SECONDS, "kind" => "single").record(started.elapsed().as_secs_f64());
        tracing::info!(bookings = created.len(), status = %request.status, "bookings allocated");
        Ok(created)
    }

    async fn commit(&self, txn: Box<dyn Transaction>) -> Result<(), EngineError> {
        match txn.commit().await {
            Ok(()) => Ok(()),
            Err(e @ StoreError::UniqueViolation { .. }) => {
                metrics::counter!(STORAGE_CONFLICTS_TOTAL).increment(1);
                tracing::warn!(error = %e, "reservation lost a race at commit");
                Err(e.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    // ── Booking transitions ──────────────────────────────────

    /// Pending → confirmed.
    pub async fn confirm_booking(&self, id: Ulid, payment_status: PaymentStatus) -> Result<Booking, EngineError> {
        let patch = BookingPatch {
            status: Some(BookingStatus::Confirmed),
            payment_status: Some(payment_status),
            ..Default::default()
        };
        self.transition_booking(id, &[BookingStatus::Pending], patch).await
    }

    /// Pending or confirmed → cancelled. Frees the slot.
    pub async fn cancel_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let patch = BookingPatch { status: Some(BookingStatus::Cancelled), ..Default::default() };
        self.transition_booking(id, &[BookingStatus::Pending, BookingStatus::Confirmed], patch)
            .await
    }

    async fn transition_booking(
        &self,
        id: Ulid,
        allowed_from: &[BookingStatus],
        patch: BookingPatch,
    ) -> Result<Booking, EngineError> {
        let to = patch.status.map(|s| s.to_string()).unwrap_or_default();
        let invalid = |from: BookingStatus| EngineError::InvalidTransition {
            kind: "booking",
            id: id.to_string(),
            from: from.to_string(),
            to: to.clone(),
        };

        let current = self
            .store
            .booking(id)
            .await?
            .ok_or_else(|| EngineError::not_found("booking", id))?;
        if !allowed_from.contains(&current.status) {
            return Err(invalid(current.status));
        }
        match self.store.update_booking(id, current.status, patch).await {
            Ok(updated) => {
                tracing::info!(booking = %id, from = %current.status, to = %updated.status, "booking transition");
                Ok(updated)
            }
            Err(StoreError::StaleRow(_)) => {
                let now = self.store.booking(id).await?.map_or(current.status, |b| b.status);
                Err(invalid(now))
            }
            Err(e) => Err(e.into()),
        }
    }

    // ── Recurring series ─────────────────────────────────────

    /// Create one recurring row per court, weekday and slot, atomically.
    /// Conflicts are checked from today onward; past occurrences are history.
    pub async fn create_recurring_series(&self, request: SeriesRequest) -> Result<Vec<RecurringBooking>, EngineError> {
        let started = Instant::now();
        validate_range(request.start, request.end)?;
        validate_identity(&request.identity)?;
        validate_label(request.label.as_deref())?;

        let mut court_ids = request.courts.clone();
        court_ids.sort();
        court_ids.dedup();
        let mut weekdays: Vec<Weekday> = Vec::new();
        for day in &request.weekdays {
            if !weekdays.contains(day) {
                weekdays.push(*day);
            }
        }
        let slots = slots_between(request.start, request.end);
        let row_count = court_ids.len() * weekdays.len() * slots.len();
        if row_count == 0 {
            return Err(ValidationError::EmptyRequest.into());
        }
        if row_count > MAX_SERIES_ROWS {
            return Err(ValidationError::BatchTooLarge(row_count).into());
        }

        let mut courts: BTreeMap<CourtId, Court> = BTreeMap::new();
        for id in &court_ids {
            courts.insert(*id, self.bookable_court(*id).await?);
        }

        let window = request.dates.clipped_from(self.today());
        let mut candidates = Vec::with_capacity(row_count);
        for court in &court_ids {
            for day in &weekdays {
                for slot in &slots {
                    candidates.push(Candidate::weekly(*court, *day, window, *slot));
                }
            }
        }
        self.check_candidates(&candidates).await?.into_result()?;

        let mut txn = self.store.begin(&court_ids).await?;
        let occupancy = load_from_txn(txn.as_mut(), &candidates).await?;
        find_collisions(&candidates, &occupancy).into_result()?;

        let now = self.clock.now();
        let mut rows = Vec::with_capacity(row_count);
        for candidate in &candidates {
            let Occurrence::Weekly { weekday, .. } = candidate.occurrence else {
                continue;
            };
            let row = RecurringBooking {
                id: Ulid::new(),
                court_id: candidate.court,
                sport: request.sport,
                day_of_week: weekday,
                start_time: candidate.start,
                end_time: candidate.end,
                dates: request.dates,
                status: SeriesStatus::Active,
                hourly_rate: request
                    .hourly_rate
                    .or_else(|| courts.get(&candidate.court).and_then(|c| c.hourly_rate)),
                identity: request.identity.clone(),
                label: request.label.clone(),
                created_at: now,
            };
            txn.insert_recurring(row.clone()).await?;
            rows.push(row);
        }
        self.commit(txn).await?;

        metrics::counter!(ROWS_CREATED_TOTAL, "kind" => "recurring_row").increment(rows.len() as u64);
        metrics::histogram!(ALLOCATION_DURATION_SECONDS, "kind" => "recurring").record(started.elapsed().as_secs_f64());
        tracing::info!(rows = rows.len(), courts = court_ids.len(), "recurring series created");
        Ok(rows)
    }

    /// Deactivate the given rows, ending each on the last date it was played.
    /// Rows already inactive are returned unchanged.
    pub async fn end_recurring_series(&self, row_ids: &[Ulid]) -> Result<Vec<RecurringBooking>, EngineError> {
        let today = self.today();
        let mut out = Vec::with_capacity(row_ids.len());
        for id in row_ids {
            let row = self
                .store
                .recurring_row(*id)
                .await?
                .ok_or_else(|| EngineError::not_found("recurring booking", id))?;
            if !row.is_active() {
                out.push(row);
                continue;
            }
            let last_played = last_on_or_before(today, row.day_of_week);
            let end = row.dates.end.map_or(last_played, |end| end.min(last_played));
            let patch = SeriesPatch { status: Some(SeriesStatus::Inactive), end_date: Some(end) };
            out.push(self.store.update_recurring(*id, patch).await?);
        }
        tracing::info!(rows = out.len(), "recurring series ended");
        Ok(out)
    }

    // ── Lessons ──────────────────────────────────────────────

    pub async fn schedule_lesson(&self, request: LessonRequest) -> Result<LessonSession, EngineError> {
        let started = Instant::now();
        validate_range(request.start, request.end)?;
        validate_label(request.title.as_deref())?;
        self.bookable_court(request.court).await?;

        let candidates = [Candidate::span_on(request.court, request.date, request.start, request.end)];
        self.check_candidates(&candidates).await?.into_result()?;

        let mut txn = self.store.begin(&[request.court]).await?;
        let occupancy = load_from_txn(txn.as_mut(), &candidates).await?;
        find_collisions(&candidates, &occupancy).into_result()?;

        let lesson = LessonSession {
            id: Ulid::new(),
            court_id: request.court,
            lesson_date: request.date,
            start_time: request.start,
            end_time: request.end,
            status: LessonStatus::Scheduled,
            price: request.price,
            duration_minutes: candidates[0].span().duration_minutes(),
            title: request.title,
        };
        txn.insert_lesson(lesson.clone()).await?;
        self.commit(txn).await?;

        metrics::counter!(ROWS_CREATED_TOTAL, "kind" => "lesson").increment(1);
        metrics::histogram!(ALLOCATION_DURATION_SECONDS, "kind" => "lesson").record(started.elapsed().as_secs_f64());
        tracing::info!(lesson = %lesson.id, court = %lesson.court_id, "lesson scheduled");
        Ok(lesson)
    }

    pub async fn complete_lesson(&self, id: Ulid) -> Result<LessonSession, EngineError> {
        self.transition_lesson(id, LessonStatus::Completed).await
    }

    pub async fn cancel_lesson(&self, id: Ulid) -> Result<LessonSession, EngineError> {
        self.transition_lesson(id, LessonStatus::Cancelled).await
    }

    /// Only scheduled lessons move.
    async fn transition_lesson(&self, id: Ulid, to: LessonStatus) -> Result<LessonSession, EngineError> {
        let invalid = |from: LessonStatus| EngineError::InvalidTransition {
            kind: "lesson",
            id: id.to_string(),
            from: from.to_string(),
            to: to.to_string(),
        };
        let current = self
            .store
            .lesson(id)
            .await?
            .ok_or_else(|| EngineError::not_found("lesson", id))?;
        if current.status != LessonStatus::Scheduled {
            return Err(invalid(current.status));
        }
        match self.store.update_lesson(id, LessonStatus::Scheduled, to).await {
            Ok(updated) => Ok(updated),
            Err(StoreError::StaleRow(_)) => {
                let now = self.store.lesson(id).await?.map_or(current.status, |l| l.status);
                Err(invalid(now))
            }
            Err(e) => Err(e.into()),
        }
    }
}
