//! Transactional storage the engine is written against.

mod memory;
mod writer;

pub use memory::{CourtState, MemoryStore, SharedCourtState};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;
use ulid::Ulid;

use crate::model::*;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("unique constraint {constraint} violated on {court} {date} {start}")]
    UniqueViolation {
        constraint: &'static str,
        court: CourtId,
        date: NaiveDate,
        start: SlotTime,
    },
    #[error("could not serialize access due to concurrent update: {0}")]
    Serialization(String),
    #[error("deadlock detected: {0}")]
    Deadlock(String),
    /// A compare-and-set transition found the row in a different state.
    #[error("row {0} was modified concurrently")]
    StaleRow(Ulid),
    #[error("no such court: {0}")]
    MissingCourt(CourtId),
    #[error("{0} is not locked by this transaction")]
    OutOfScope(CourtId),
    #[error("no such row: {0}")]
    MissingRow(Ulid),
    #[error("WAL error: {0}")]
    Wal(String),
    #[error("{0}")]
    Backend(String),
}

impl StoreError {
    /// Serialization failures and deadlocks clear up on retry; nothing else does.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Serialization(_) | StoreError::Deadlock(_) => true,
            StoreError::Backend(msg) => {
                let msg = msg.to_ascii_lowercase();
                msg.contains("could not serialize")
                    || msg.contains("serialization failure")
                    || msg.contains("deadlock")
            }
            _ => false,
        }
    }
}

/// Field changes applied by a booking transition. `None` leaves a field alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingPatch {
    pub status: Option<BookingStatus>,
    pub payment_status: Option<PaymentStatus>,
    pub expired_at: Option<DateTime<Utc>>,
    pub expiration_warning_sent: Option<bool>,
}

impl BookingPatch {
    pub fn apply(&self, booking: &mut Booking) {
        if let Some(status) = self.status {
            booking.status = status;
        }
        if let Some(payment) = self.payment_status {
            booking.payment_status = payment;
        }
        if let Some(at) = self.expired_at {
            booking.expired_at = Some(at);
        }
        if let Some(sent) = self.expiration_warning_sent {
            booking.expiration_warning_sent = sent;
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeriesPatch {
    pub status: Option<SeriesStatus>,
    pub end_date: Option<NaiveDate>,
}

impl SeriesPatch {
    pub fn apply(&self, row: &mut RecurringBooking) {
        if let Some(status) = self.status {
            row.status = status;
        }
        if let Some(end) = self.end_date {
            row.dates.end = Some(end.max(row.dates.start));
        }
    }
}

/// Atomic per-scope counter.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Upsert the counter row for `scope`, add one, and return the new value
    /// as a single atomic step. `Ok(None)` means the write went through but
    /// no value came back.
    async fn increment_counter(&self, scope: CounterScope) -> Result<Option<u32>, StoreError>;
}

/// Append-only sink for in-app notifications.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn create_notification(&self, notification: Notification) -> Result<(), StoreError>;
}

/// Unit of work over a set of courts. Dropping it without `commit` discards
/// every staged write.
#[async_trait]
pub trait Transaction: Send {
    /// Pending/confirmed bookings on `court` within `dates`, staged rows included.
    async fn active_bookings(&mut self, court: CourtId, dates: DateRange) -> Result<Vec<Booking>, StoreError>;

    async fn recurring_rows(&mut self, court: CourtId) -> Result<Vec<RecurringBooking>, StoreError>;

    async fn scheduled_lessons(&mut self, court: CourtId, dates: DateRange) -> Result<Vec<LessonSession>, StoreError>;

    async fn insert_booking(&mut self, booking: Booking) -> Result<(), StoreError>;

    async fn insert_recurring(&mut self, row: RecurringBooking) -> Result<(), StoreError>;

    async fn insert_lesson(&mut self, lesson: LessonSession) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}

#[async_trait]
pub trait Store: CounterStore + NotificationSink {
    /// Open a transaction that may read and write the given courts.
    async fn begin(&self, courts: &[CourtId]) -> Result<Box<dyn Transaction>, StoreError>;

    async fn save_court(&self, court: Court) -> Result<(), StoreError>;

    async fn court(&self, id: CourtId) -> Result<Option<Court>, StoreError>;

    async fn courts(&self) -> Result<Vec<Court>, StoreError>;

    async fn save_user(&self, user: User) -> Result<(), StoreError>;

    async fn user(&self, id: Ulid) -> Result<Option<User>, StoreError>;

    async fn booking(&self, id: Ulid) -> Result<Option<Booking>, StoreError>;

    async fn active_bookings(&self, court: CourtId, dates: DateRange) -> Result<Vec<Booking>, StoreError>;

    /// Every recurring row, active or not, optionally for one court.
    async fn recurring_rows(&self, court: Option<CourtId>) -> Result<Vec<RecurringBooking>, StoreError>;

    async fn recurring_row(&self, id: Ulid) -> Result<Option<RecurringBooking>, StoreError>;

    async fn scheduled_lessons(&self, court: CourtId, dates: DateRange) -> Result<Vec<LessonSession>, StoreError>;

    async fn lesson(&self, id: Ulid) -> Result<Option<LessonSession>, StoreError>;

    /// Bookings still `pending` with no `expired_at`, optionally limited to `ids`.
    async fn pending_bookings(&self, ids: Option<&[Ulid]>) -> Result<Vec<Booking>, StoreError>;

    /// Apply `patch` if the booking's status is still `expected`.
    async fn update_booking(
        &self,
        id: Ulid,
        expected: BookingStatus,
        patch: BookingPatch,
    ) -> Result<Booking, StoreError>;

    /// Set `expiration_warning_sent` on a pending booking that does not have
    /// it yet. `StaleRow` if the booking moved on or another caller got there first.
    async fn claim_warning(&self, id: Ulid) -> Result<Booking, StoreError>;

    async fn update_recurring(&self, id: Ulid, patch: SeriesPatch) -> Result<RecurringBooking, StoreError>;

    /// Move a lesson to `status` if it is still `expected`.
    async fn update_lesson(
        &self,
        id: Ulid,
        expected: LessonStatus,
        status: LessonStatus,
    ) -> Result<LessonSession, StoreError>;

    async fn notifications(&self, user_id: Ulid) -> Result<Vec<Notification>, StoreError>;
}
