use std::fmt;
use std::iter::Sum;
use std::ops::Add;
use std::str::FromStr;

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use ulid::Ulid;

/// Minutes in a day.
pub const DAY_MINUTES: u32 = 1440;

/// Length of one slot on the facility grid.
pub const SLOT_MINUTES: u32 = 30;

/// Rejections raised before anything touches the store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("invalid time format: {0:?}")]
    InvalidTimeFormat(String),
    #[error("{0} is not on the 30-minute grid")]
    OffGrid(SlotTime),
    #[error("{0} is outside opening hours")]
    OutsideOpeningHours(SlotTime),
    #[error("time range {start}-{end} is empty")]
    EmptyRange { start: SlotTime, end: SlotTime },
    #[error("unknown sport: {0:?}")]
    UnknownSport(String),
    #[error("invalid day of week: {0}")]
    InvalidWeekday(u8),
    #[error("date range ends ({end}) before it starts ({start})")]
    InvertedDateRange { start: NaiveDate, end: NaiveDate },
    #[error("request contains no slots")]
    EmptyRequest,
    #[error("batch of {0} slots exceeds the limit")]
    BatchTooLarge(usize),
    #[error("label too long")]
    LabelTooLong,
    #[error("name too long")]
    NameTooLong,
    #[error("unknown court: {0}")]
    UnknownCourt(CourtId),
    #[error("{0} is not accepting reservations")]
    InactiveCourt(CourtId),
    #[error("guest reservations need a name")]
    MissingGuestName,
}

// ── Time of day ──────────────────────────────────────────────────

/// Wall-clock time of day in facility-local minutes since midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SlotTime(u16);

impl SlotTime {
    pub const MIDNIGHT: SlotTime = SlotTime(0);

    /// Build from hour and minute. Out-of-range parts wrap.
    pub const fn at(hour: u8, minute: u8) -> Self {
        Self(((hour as u16) % 24) * 60 + (minute as u16) % 60)
    }

    pub fn from_minutes(minutes: u32) -> Option<Self> {
        (minutes < DAY_MINUTES).then_some(Self(minutes as u16))
    }

    /// Parse `HH:MM` (seconds, if present as `HH:MM:SS`, are ignored).
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        let invalid = || ValidationError::InvalidTimeFormat(raw.to_string());
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(invalid());
        }
        let parts: Vec<&str> = trimmed.split(':').collect();
        if parts.len() < 2 || parts.len() > 3 {
            return Err(invalid());
        }
        let digits = |s: &str, max_len: usize| -> Option<u32> {
            if s.is_empty() || s.len() > max_len || !s.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            s.parse().ok()
        };
        let hour = digits(parts[0], 2).filter(|h| *h < 24).ok_or_else(invalid)?;
        let minute = digits(parts[1], 2)
            .filter(|m| *m < 60 && parts[1].len() == 2)
            .ok_or_else(invalid)?;
        if let Some(sec) = parts.get(2) {
            digits(sec, 2).filter(|s| *s < 60).ok_or_else(invalid)?;
        }
        Ok(Self((hour * 60 + minute) as u16))
    }

    pub const fn minutes(self) -> u32 {
        self.0 as u32
    }

    pub const fn hour(self) -> u32 {
        self.0 as u32 / 60
    }

    pub const fn minute(self) -> u32 {
        self.0 as u32 % 60
    }

    pub const fn is_on_grid(self) -> bool {
        self.minutes() % SLOT_MINUTES == 0
    }

    /// Add minutes, wrapping past midnight.
    pub const fn add_minutes(self, minutes: u32) -> Self {
        Self(((self.0 as u32 + minutes) % DAY_MINUTES) as u16)
    }

    /// End of the 30-minute slot starting here.
    pub const fn slot_end(self) -> Self {
        self.add_minutes(SLOT_MINUTES)
    }

    pub fn to_naive_time(self) -> NaiveTime {
        NaiveTime::from_hms_opt(self.hour(), self.minute(), 0).unwrap_or_default()
    }
}

impl fmt::Display for SlotTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour(), self.minute())
    }
}

impl FromStr for SlotTime {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Half-open interval `[start, end)` in minutes from midnight of one day.
/// `end` runs past `DAY_MINUTES` when the range crosses midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinuteSpan {
    pub start: u32,
    pub end: u32,
}

impl MinuteSpan {
    /// `end <= start` is read as ending on the following day.
    pub fn between(start: SlotTime, end: SlotTime) -> Self {
        let s = start.minutes();
        let mut e = end.minutes();
        if e <= s {
            e += DAY_MINUTES;
        }
        Self { start: s, end: e }
    }

    pub fn slot(start: SlotTime) -> Self {
        Self::between(start, start.slot_end())
    }

    pub fn duration_minutes(&self) -> u32 {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &MinuteSpan) -> bool {
        self.start < other.end && other.start < self.end
    }
}

// ── Calendar ─────────────────────────────────────────────────────

/// Inclusive date window; `end = None` is open-ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: Option<NaiveDate>,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: Option<NaiveDate>) -> Result<Self, ValidationError> {
        if let Some(end) = end
            && end < start
        {
            return Err(ValidationError::InvertedDateRange { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn day(date: NaiveDate) -> Self {
        Self { start: date, end: Some(date) }
    }

    pub fn open_from(start: NaiveDate) -> Self {
        Self { start, end: None }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && self.end.is_none_or(|end| date <= end)
    }

    pub fn overlaps(&self, other: &DateRange) -> bool {
        let self_before = self.end.is_some_and(|end| end < other.start);
        let other_before = other.end.is_some_and(|end| end < self.start);
        !self_before && !other_before
    }

    /// Still in force on `today`.
    pub fn is_current(&self, today: NaiveDate) -> bool {
        self.end.is_none_or(|end| end >= today)
    }

    /// Drop the part of the window that lies before `today`.
    pub fn clipped_from(&self, today: NaiveDate) -> Self {
        Self { start: self.start.max(today), end: self.end }
    }
}

/// Map the 0–6 (Sunday = 0) numbering used by booking forms.
pub fn weekday_from_index(index: u8) -> Result<Weekday, ValidationError> {
    Ok(match index {
        0 => Weekday::Sun,
        1 => Weekday::Mon,
        2 => Weekday::Tue,
        3 => Weekday::Wed,
        4 => Weekday::Thu,
        5 => Weekday::Fri,
        6 => Weekday::Sat,
        other => return Err(ValidationError::InvalidWeekday(other)),
    })
}

pub fn weekday_index(day: Weekday) -> u8 {
    day.num_days_from_sunday() as u8
}

// ── Money and sport ──────────────────────────────────────────────

/// Currency amount in cents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Money(i64);

impl Money {
    pub const ZERO: Money = Money(0);

    pub const fn from_cents(cents: i64) -> Self {
        Self(cents)
    }

    pub const fn whole(units: i64) -> Self {
        Self(units * 100)
    }

    pub const fn cents(self) -> i64 {
        self.0
    }

    /// Treat `self` as an hourly rate and charge it for `minutes`, rounding half up.
    pub fn for_minutes(self, minutes: u32) -> Money {
        Money((self.0 * minutes as i64 + 30) / 60)
    }

    /// Parse a decimal amount such as `15`, `17.5` or `18.00`.
    pub fn parse(raw: &str) -> Option<Money> {
        let raw = raw.trim();
        let (units, fraction) = match raw.split_once('.') {
            Some((u, f)) => (u, f),
            None => (raw, ""),
        };
        if units.is_empty() || fraction.len() > 2 {
            return None;
        }
        if !units.bytes().all(|b| b.is_ascii_digit()) || !fraction.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let units: i64 = units.parse().ok()?;
        let cents: i64 = match fraction.len() {
            0 => 0,
            1 => fraction.parse::<i64>().ok()? * 10,
            _ => fraction.parse().ok()?,
        };
        units.checked_mul(100)?.checked_add(cents).map(Money)
    }
}

impl Add for Money {
    type Output = Money;

    fn add(self, rhs: Money) -> Money {
        Money(self.0 + rhs.0)
    }
}

impl Sum for Money {
    fn sum<I: Iterator<Item = Money>>(iter: I) -> Money {
        iter.fold(Money::ZERO, Add::add)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{sign}{}.{:02}", abs / 100, abs % 100)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Sport {
    Badminton,
    Pickleball,
}

impl FromStr for Sport {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "badminton" => Ok(Sport::Badminton),
            "pickleball" => Ok(Sport::Pickleball),
            _ => Err(ValidationError::UnknownSport(s.to_string())),
        }
    }
}

impl fmt::Display for Sport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Sport::Badminton => "badminton",
            Sport::Pickleball => "pickleball",
        })
    }
}

// ── Identity ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CourtId(pub u32);

impl fmt::Display for CourtId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Court {}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestContact {
    pub name: String,
    pub phone: Option<String>,
    pub email: Option<String>,
}

/// Who holds a reservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Identity {
    Registered { user_id: Ulid },
    Guest(GuestContact),
}

/// Sort/merge key for an identity: user id, else guest name, else a sentinel.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IdentityKey {
    User(Ulid),
    Guest(String),
    Anonymous,
}

impl Identity {
    pub fn user_id(&self) -> Option<Ulid> {
        match self {
            Identity::Registered { user_id } => Some(*user_id),
            Identity::Guest(_) => None,
        }
    }

    pub fn key(&self) -> IdentityKey {
        match self {
            Identity::Registered { user_id } => IdentityKey::User(*user_id),
            Identity::Guest(g) if !g.name.trim().is_empty() => IdentityKey::Guest(g.name.clone()),
            Identity::Guest(_) => IdentityKey::Anonymous,
        }
    }
}

// ── Status enums ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Expired,
    Cancelled,
}

impl BookingStatus {
    /// Holds its slot.
    pub fn is_active(self) -> bool {
        matches!(self, BookingStatus::Pending | BookingStatus::Confirmed)
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Expired => "expired",
            BookingStatus::Cancelled => "cancelled",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PaymentStatus {
    Unpaid,
    Paid,
    Refunded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SeriesStatus {
    Active,
    Inactive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LessonStatus {
    Scheduled,
    Completed,
    Cancelled,
}

impl fmt::Display for LessonStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LessonStatus::Scheduled => "scheduled",
            LessonStatus::Completed => "completed",
            LessonStatus::Cancelled => "cancelled",
        })
    }
}

// ── Entities ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Court {
    pub id: CourtId,
    pub name: String,
    /// Replaces the sport's default rate when set.
    pub hourly_rate: Option<Money>,
    pub is_active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Ulid,
    pub name: String,
    pub email: Option<String>,
}

/// Single 30-minute ad-hoc reservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub court_id: CourtId,
    pub sport: Sport,
    pub booking_date: NaiveDate,
    pub start_time: SlotTime,
    pub end_time: SlotTime,
    pub status: BookingStatus,
    pub payment_status: PaymentStatus,
    pub total_amount: Money,
    pub identity: Identity,
    pub created_at: DateTime<Utc>,
    pub expired_at: Option<DateTime<Utc>>,
    pub expiration_warning_sent: bool,
}

impl Booking {
    pub fn span(&self) -> MinuteSpan {
        MinuteSpan::between(self.start_time, self.end_time)
    }
}

/// One 30-minute row of a weekly series.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurringBooking {
    pub id: Ulid,
    pub court_id: CourtId,
    pub sport: Sport,
    pub day_of_week: Weekday,
    pub start_time: SlotTime,
    pub end_time: SlotTime,
    pub dates: DateRange,
    pub status: SeriesStatus,
    pub hourly_rate: Option<Money>,
    pub identity: Identity,
    pub label: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl RecurringBooking {
    pub fn is_active(&self) -> bool {
        self.status == SeriesStatus::Active
    }

    pub fn span(&self) -> MinuteSpan {
        MinuteSpan::between(self.start_time, self.end_time)
    }

    /// Occupies `date`: active, right weekday, window contains it.
    pub fn occurs_on(&self, date: NaiveDate) -> bool {
        self.is_active() && date.weekday() == self.day_of_week && self.dates.contains(date)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LessonSession {
    pub id: Ulid,
    pub court_id: CourtId,
    pub lesson_date: NaiveDate,
    pub start_time: SlotTime,
    pub end_time: SlotTime,
    pub status: LessonStatus,
    pub price: Money,
    pub duration_minutes: u32,
    pub title: Option<String>,
}

impl LessonSession {
    pub fn span(&self) -> MinuteSpan {
        MinuteSpan::between(self.start_time, self.end_time)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NotificationKind {
    BookingExpired,
    ExpirationWarning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Ulid,
    pub user_id: Ulid,
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    pub link: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Scope of one job-code counter: a facility-local calendar month.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CounterScope {
    pub year: i32,
    /// 1–12.
    pub month: u32,
}

impl fmt::Display for CounterScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

/// Store mutations as written to the WAL, one record per event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    CourtSaved(Court),
    UserSaved(User),
    BookingCreated(Booking),
    BookingUpdated(Booking),
    SeriesRowCreated(RecurringBooking),
    SeriesRowUpdated(RecurringBooking),
    LessonCreated(LessonSession),
    LessonUpdated(LessonSession),
    CounterAdvanced { scope: CounterScope, value: u32 },
    NotificationCreated(Notification),
}

impl Event {
    /// Court the event belongs to, if it is court-scoped.
    pub fn court_id(&self) -> Option<CourtId> {
        match self {
            Event::CourtSaved(c) => Some(c.id),
            Event::BookingCreated(b) | Event::BookingUpdated(b) => Some(b.court_id),
            Event::SeriesRowCreated(r) | Event::SeriesRowUpdated(r) => Some(r.court_id),
            Event::LessonCreated(l) | Event::LessonUpdated(l) => Some(l.court_id),
            Event::UserSaved(_) | Event::CounterAdvanced { .. } | Event::NotificationCreated(_) => None,
        }
    }
}
