//! Per-sport, time-dependent pricing.
//!
//! Ranges whose end is at or before their start are read as running into the
//! next day, so `23:00`–`01:00` is two hours. Badminton is charged at the
//! off-peak rate before the peak boundary and the peak rate from it onward;
//! pickleball is flat. A custom hourly rate (per court or per recurring series)
//! replaces both and is charged flat.

use crate::model::{MinuteSpan, Money, SlotTime, Sport, ValidationError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateCard {
    pub badminton_off_peak: Money,
    pub badminton_peak: Money,
    pub pickleball: Money,
    /// Badminton peak pricing applies from this local time onward.
    pub peak_starts: SlotTime,
}

impl Default for RateCard {
    fn default() -> Self {
        Self {
            badminton_off_peak: Money::whole(15),
            badminton_peak: Money::whole(18),
            pickleball: Money::whole(25),
            peak_starts: SlotTime::at(18, 0),
        }
    }
}

/// Minutes from `start` to `end`, treating `end <= start` as next-day.
pub fn duration_minutes(start: SlotTime, end: SlotTime) -> u32 {
    MinuteSpan::between(start, end).duration_minutes()
}

impl RateCard {
    pub fn amount(
        &self,
        sport: Sport,
        start: SlotTime,
        end: SlotTime,
        override_rate: Option<Money>,
    ) -> Money {
        let span = MinuteSpan::between(start, end);
        let minutes = span.duration_minutes();

        if let Some(rate) = override_rate {
            return rate.for_minutes(minutes);
        }

        match sport {
            Sport::Pickleball => self.pickleball.for_minutes(minutes),
            Sport::Badminton => {
                let peak = self.peak_starts.minutes();
                if span.end <= peak {
                    self.badminton_off_peak.for_minutes(minutes)
                } else if span.start >= peak {
                    self.badminton_peak.for_minutes(minutes)
                } else {
                    self.badminton_off_peak.for_minutes(peak - span.start)
                        + self.badminton_peak.for_minutes(span.end - peak)
                }
            }
        }
    }

    /// String-facing form: `HH:MM` times and a case-insensitive sport name.
    pub fn quote(
        &self,
        start: &str,
        end: &str,
        sport: &str,
        override_rate: Option<Money>,
    ) -> Result<Money, ValidationError> {
        let start = SlotTime::parse(start)?;
        let end = SlotTime::parse(end)?;
        let sport: Sport = sport.parse()?;
        Ok(self.amount(sport, start, end, override_rate))
    }
}
