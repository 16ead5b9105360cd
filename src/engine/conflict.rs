//! Cross-entity conflict detection shared by ad-hoc, recurring and lesson
//! creation.
//!
//! A [`Candidate`] is matched either against one concrete date or weekly
//! against a weekday inside a date window. In both modes it is checked, in
//! order, against active bookings, active recurring rows and scheduled
//! lessons on the same court, using half-open minute intervals.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{Datelike, NaiveDate, Weekday};
use ulid::Ulid;

use crate::model::*;
use crate::store::{Store, StoreError, Transaction};

use super::{Engine, EngineError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Occurrence {
    Date(NaiveDate),
    Weekly { weekday: Weekday, window: DateRange },
}

impl Occurrence {
    /// Whether a concrete date falls under this occurrence.
    fn covers(&self, date: NaiveDate) -> bool {
        match *self {
            Occurrence::Date(d) => d == date,
            Occurrence::Weekly { weekday, window } => date.weekday() == weekday && window.contains(date),
        }
    }

    /// Dates that can hold anything this occurrence collides with.
    fn date_bounds(&self) -> DateRange {
        match *self {
            Occurrence::Date(d) => DateRange::day(d),
            Occurrence::Weekly { window, .. } => window,
        }
    }

    fn is_empty(&self) -> bool {
        match self {
            Occurrence::Date(_) => false,
            Occurrence::Weekly { window, .. } => window.end.is_some_and(|end| end < window.start),
        }
    }
}

impl fmt::Display for Occurrence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Occurrence::Date(d) => write!(f, "{d}"),
            Occurrence::Weekly { weekday, .. } => write!(f, "every {weekday}"),
        }
    }
}

/// A proposed reservation of `[start, end)` on one court.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub court: CourtId,
    pub occurrence: Occurrence,
    pub start: SlotTime,
    pub end: SlotTime,
}

impl Candidate {
    pub fn slot(court: CourtId, date: NaiveDate, start: SlotTime) -> Self {
        Self { court, occurrence: Occurrence::Date(date), start, end: start.slot_end() }
    }

    pub fn weekly(court: CourtId, weekday: Weekday, window: DateRange, start: SlotTime) -> Self {
        Self { court, occurrence: Occurrence::Weekly { weekday, window }, start, end: start.slot_end() }
    }

    pub fn span_on(court: CourtId, date: NaiveDate, start: SlotTime, end: SlotTime) -> Self {
        Self { court, occurrence: Occurrence::Date(date), start, end }
    }

    pub fn span(&self) -> MinuteSpan {
        MinuteSpan::between(self.start, self.end)
    }

    fn collides_with(&self, other: &Candidate) -> bool {
        if self.court != other.court || !self.span().overlaps(&other.span()) {
            return false;
        }
        match (self.occurrence, other.occurrence) {
            (Occurrence::Date(a), Occurrence::Date(b)) => a == b,
            (Occurrence::Date(d), weekly @ Occurrence::Weekly { .. })
            | (weekly @ Occurrence::Weekly { .. }, Occurrence::Date(d)) => weekly.covers(d),
            (
                Occurrence::Weekly { weekday: a, window: wa },
                Occurrence::Weekly { weekday: b, window: wb },
            ) => a == b && wa.overlaps(&wb),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictSource {
    Booking(Ulid),
    Recurring(Ulid),
    Lesson(Ulid),
    /// Another request in the same batch, by index.
    Batch(usize),
}

impl fmt::Display for ConflictSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictSource::Booking(id) => write!(f, "booked ({id})"),
            ConflictSource::Recurring(id) => write!(f, "held by a recurring booking ({id})"),
            ConflictSource::Lesson(id) => write!(f, "held by a lesson ({id})"),
            ConflictSource::Batch(i) => write!(f, "duplicates request #{i}"),
        }
    }
}

/// One colliding request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Collision {
    /// Position of the request in the caller's list.
    pub index: usize,
    pub court: CourtId,
    pub occurrence: Occurrence,
    pub start: SlotTime,
    pub source: ConflictSource,
}

impl fmt::Display for Collision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {} is {}", self.court, self.occurrence, self.start, self.source)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConflictReport {
    pub collisions: Vec<Collision>,
}

impl ConflictReport {
    pub fn is_clear(&self) -> bool {
        self.collisions.is_empty()
    }

    pub fn indices(&self) -> Vec<usize> {
        let mut out: Vec<usize> = self.collisions.iter().map(|c| c.index).collect();
        out.dedup();
        out
    }

    pub fn into_result(self) -> Result<(), EngineError> {
        if self.is_clear() {
            Ok(())
        } else {
            metrics::counter!(crate::observability::SLOT_CONFLICTS_TOTAL).increment(1);
            tracing::warn!(collisions = self.collisions.len(), "reservation rejected: slot conflict");
            Err(EngineError::SlotConflict(self.collisions))
        }
    }
}

/// What already occupies one court over the dates of interest.
#[derive(Debug, Clone, Default)]
pub struct Occupancy {
    pub bookings: Vec<Booking>,
    pub recurring: Vec<RecurringBooking>,
    pub lessons: Vec<LessonSession>,
}

impl Occupancy {
    /// First thing `candidate` collides with: bookings, then recurring rows,
    /// then lessons.
    pub fn collision(&self, candidate: &Candidate) -> Option<ConflictSource> {
        if candidate.occurrence.is_empty() {
            return None;
        }
        let span = candidate.span();

        let booking = self.bookings.iter().find(|b| {
            b.court_id == candidate.court
                && b.status.is_active()
                && candidate.occurrence.covers(b.booking_date)
                && b.span().overlaps(&span)
        });
        if let Some(b) = booking {
            return Some(ConflictSource::Booking(b.id));
        }

        let recurring = self.recurring.iter().find(|r| {
            r.court_id == candidate.court
                && r.is_active()
                && r.span().overlaps(&span)
                && match candidate.occurrence {
                    Occurrence::Date(d) => r.occurs_on(d),
                    Occurrence::Weekly { weekday, window } => {
                        r.day_of_week == weekday && r.dates.overlaps(&window)
                    }
                }
        });
        if let Some(r) = recurring {
            return Some(ConflictSource::Recurring(r.id));
        }

        self.lessons
            .iter()
            .find(|l| {
                l.court_id == candidate.court
                    && l.status == LessonStatus::Scheduled
                    && candidate.occurrence.covers(l.lesson_date)
                    && l.span().overlaps(&span)
            })
            .map(|l| ConflictSource::Lesson(l.id))
    }
}

/// Check every candidate against stored occupancy and against the earlier
/// candidates of the same batch.
pub fn find_collisions(candidates: &[Candidate], occupancy: &BTreeMap<CourtId, Occupancy>) -> ConflictReport {
    let mut collisions = Vec::new();
    for (index, candidate) in candidates.iter().enumerate() {
        let stored = occupancy.get(&candidate.court).and_then(|o| o.collision(candidate));
        let source = stored.or_else(|| {
            candidates[..index]
                .iter()
                .position(|earlier| earlier.collides_with(candidate))
                .map(ConflictSource::Batch)
        });
        if let Some(source) = source {
            collisions.push(Collision {
                index,
                court: candidate.court,
                occurrence: candidate.occurrence,
                start: candidate.start,
                source,
            });
        }
    }
    ConflictReport { collisions }
}

/// Per-court date window that covers every candidate on that court.
fn bounds_by_court(candidates: &[Candidate]) -> BTreeMap<CourtId, DateRange> {
    let mut bounds: BTreeMap<CourtId, DateRange> = BTreeMap::new();
    for c in candidates {
        let b = c.occurrence.date_bounds();
        bounds
            .entry(c.court)
            .and_modify(|acc| {
                acc.start = acc.start.min(b.start);
                acc.end = match (acc.end, b.end) {
                    (Some(x), Some(y)) => Some(x.max(y)),
                    _ => None,
                };
            })
            .or_insert(b);
    }
    bounds
}

pub(crate) async fn load_from_store(
    store: &dyn Store,
    candidates: &[Candidate],
) -> Result<BTreeMap<CourtId, Occupancy>, StoreError> {
    let mut out = BTreeMap::new();
    for (court, dates) in bounds_by_court(candidates) {
        out.insert(court, Occupancy {
            bookings: store.active_bookings(court, dates).await?,
            recurring: store.recurring_rows(Some(court)).await?,
            lessons: store.scheduled_lessons(court, dates).await?,
        });
    }
    Ok(out)
}

/// Same as [`load_from_store`] but read under the transaction's locks, staged
/// rows included.
pub(crate) async fn load_from_txn(
    txn: &mut dyn Transaction,
    candidates: &[Candidate],
) -> Result<BTreeMap<CourtId, Occupancy>, StoreError> {
    let mut out = BTreeMap::new();
    for (court, dates) in bounds_by_court(candidates) {
        out.insert(court, Occupancy {
            bookings: txn.active_bookings(court, dates).await?,
            recurring: txn.recurring_rows(court).await?,
            lessons: txn.scheduled_lessons(court, dates).await?,
        });
    }
    Ok(out)
}

impl Engine {
    /// Advisory check against committed state. Allocation repeats it under
    /// the transaction's locks.
    pub async fn check_candidates(&self, candidates: &[Candidate]) -> Result<ConflictReport, EngineError> {
        let occupancy = load_from_store(self.store.as_ref(), candidates).await?;
        Ok(find_collisions(candidates, &occupancy))
    }
}
