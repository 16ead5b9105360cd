//! The facility's fixed 30-minute grid.

use crate::model::{SlotTime, ValidationError};

/// First bookable start.
pub const OPENING: SlotTime = SlotTime::at(9, 0);

/// Last bookable start.
pub const LAST_START: SlotTime = SlotTime::at(23, 30);

/// Closing boundary. Appears in the catalog but is never a start time.
pub const CLOSING: SlotTime = SlotTime::MIDNIGHT;

/// Ordered start times a booking may use: 09:00 through 23:30.
pub fn bookable_starts() -> impl Iterator<Item = SlotTime> {
    (OPENING.minutes()..=LAST_START.minutes())
        .step_by(crate::model::SLOT_MINUTES as usize)
        .filter_map(SlotTime::from_minutes)
}

/// The full catalog: every bookable start followed by the 00:00 boundary.
pub fn catalog() -> Vec<SlotTime> {
    let mut slots: Vec<SlotTime> = bookable_starts().collect();
    slots.push(CLOSING);
    slots
}

pub fn is_bookable_start(time: SlotTime) -> bool {
    time.is_on_grid() && time >= OPENING && time <= LAST_START
}

/// A valid range end: on the grid and inside opening hours, or the closing boundary.
pub fn is_valid_end(time: SlotTime) -> bool {
    time == CLOSING || (time.is_on_grid() && time > OPENING && time <= LAST_START)
}

pub fn validate_start(time: SlotTime) -> Result<SlotTime, ValidationError> {
    if !time.is_on_grid() {
        return Err(ValidationError::OffGrid(time));
    }
    if !is_bookable_start(time) {
        return Err(ValidationError::OutsideOpeningHours(time));
    }
    Ok(time)
}

/// Validate a multi-slot `[start, end)` range such as a lesson.
pub fn validate_range(start: SlotTime, end: SlotTime) -> Result<(), ValidationError> {
    validate_start(start)?;
    if !end.is_on_grid() {
        return Err(ValidationError::OffGrid(end));
    }
    if !is_valid_end(end) {
        return Err(ValidationError::OutsideOpeningHours(end));
    }
    if end != CLOSING && end <= start {
        return Err(ValidationError::EmptyRange { start, end });
    }
    Ok(())
}

/// Split `[start, end)` into its 30-minute slot starts.
pub fn slots_between(start: SlotTime, end: SlotTime) -> Vec<SlotTime> {
    let span = crate::model::MinuteSpan::between(start, end);
    (span.start..span.end)
        .step_by(crate::model::SLOT_MINUTES as usize)
        .map(|m| SlotTime::MIDNIGHT.add_minutes(m))
        .collect()
}
