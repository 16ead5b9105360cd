//! Injected time source and the facility's fixed-offset local time.

use std::sync::Mutex;

use chrono::{DateTime, FixedOffset, NaiveDate, Offset, TimeDelta, TimeZone, Utc};

use crate::model::SlotTime;

/// Facility offset when none is configured (UTC+8).
pub const DEFAULT_UTC_OFFSET_HOURS: i32 = 8;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock for tests and replays.
pub struct FixedClock {
    time: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(time: DateTime<Utc>) -> Self {
        Self { time: Mutex::new(time) }
    }

    pub fn set(&self, time: DateTime<Utc>) {
        if let Ok(mut guard) = self.time.lock() {
            *guard = time;
        }
    }

    pub fn advance(&self, by: TimeDelta) {
        if let Ok(mut guard) = self.time.lock() {
            *guard += by;
        }
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        match self.time.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

/// The facility's wall clock: a fixed UTC offset, no DST.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FacilityTz {
    offset: FixedOffset,
}

impl FacilityTz {
    pub fn from_hours(hours: i32) -> Option<Self> {
        if !(-12..=14).contains(&hours) {
            return None;
        }
        FixedOffset::east_opt(hours * 3600).map(|offset| Self { offset })
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    pub fn local(&self, at: DateTime<Utc>) -> DateTime<FixedOffset> {
        at.with_timezone(&self.offset)
    }

    pub fn today(&self, at: DateTime<Utc>) -> NaiveDate {
        self.local(at).date_naive()
    }

    /// The instant at which `time` on `date` begins locally.
    pub fn instant(&self, date: NaiveDate, time: SlotTime) -> DateTime<Utc> {
        let local = date.and_time(time.to_naive_time());
        let utc = local - TimeDelta::seconds(i64::from(self.offset.local_minus_utc()));
        Utc.from_utc_datetime(&utc)
    }
}

impl Default for FacilityTz {
    fn default() -> Self {
        Self::from_hours(DEFAULT_UTC_OFFSET_HOURS).unwrap_or(Self { offset: Utc.fix() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[test]
    fn local_date_crosses_midnight_before_utc() {
        let tz = FacilityTz::default();
        let at = utc("2026-01-31T23:00:00Z");
        assert_eq!(tz.today(at), NaiveDate::from_ymd_opt(2026, 2, 1).unwrap());
    }

    #[test]
    fn instant_applies_offset() {
        let tz = FacilityTz::default();
        let date = NaiveDate::from_ymd_opt(2026, 2, 20).unwrap();
        assert_eq!(tz.instant(date, SlotTime::at(22, 0)), utc("2026-02-20T14:00:00Z"));
        assert_eq!(tz.instant(date, SlotTime::at(6, 0)), utc("2026-02-19T22:00:00Z"));
    }

    #[test]
    fn offset_bounds() {
        assert!(FacilityTz::from_hours(14).is_some());
        assert!(FacilityTz::from_hours(-12).is_some());
        assert!(FacilityTz::from_hours(15).is_none());
    }

    #[test]
    fn fixed_clock_advances() {
        let clock = FixedClock::new(utc("2026-02-17T10:00:00Z"));
        clock.advance(TimeDelta::hours(2));
        assert_eq!(clock.now(), utc("2026-02-17T12:00:00Z"));
        clock.set(utc("2026-03-01T00:00:00Z"));
        assert_eq!(clock.now(), utc("2026-03-01T00:00:00Z"));
    }
}
