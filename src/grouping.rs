//! Compacts 30-minute recurring rows into the reservations people actually made.

use chrono::Weekday;
use ulid::Ulid;

use crate::model::*;
use crate::pricing::{duration_minutes, RateCard};

/// A run of contiguous recurring rows sharing identity, court, weekday and state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecurringGroup {
    pub row_ids: Vec<Ulid>,
    pub identity: Identity,
    pub court_id: CourtId,
    pub day_of_week: Weekday,
    pub sport: Sport,
    pub start_time: SlotTime,
    pub end_time: SlotTime,
    pub dates: DateRange,
    pub is_active: bool,
    pub label: Option<String>,
    pub hourly_rate: Option<Money>,
    pub duration_minutes: u32,
    pub amount_per_session: Money,
}

pub fn group_recurring(rows: &[RecurringBooking], rates: &RateCard) -> Vec<RecurringGroup> {
    let mut sorted: Vec<&RecurringBooking> = rows.iter().collect();
    sorted.sort_by_cached_key(|r| {
        (weekday_index(r.day_of_week), r.court_id, r.identity.key(), !r.is_active(), r.start_time)
    });

    let mut groups = Vec::new();
    let mut run: Vec<&RecurringBooking> = Vec::new();
    for row in sorted {
        if let Some(last) = run.last()
            && !continues(last, row)
        {
            groups.push(close_run(&run, rates));
            run.clear();
        }
        run.push(row);
    }
    if !run.is_empty() {
        groups.push(close_run(&run, rates));
    }
    groups
}

fn continues(last: &RecurringBooking, next: &RecurringBooking) -> bool {
    last.identity.key() == next.identity.key()
        && last.day_of_week == next.day_of_week
        && last.court_id == next.court_id
        && last.is_active() == next.is_active()
        && last.end_time == next.start_time
}

fn close_run(run: &[&RecurringBooking], rates: &RateCard) -> RecurringGroup {
    let first = run[0];
    let last = run[run.len() - 1];
    let start_time = first.start_time;
    let end_time = last.end_time;
    RecurringGroup {
        row_ids: run.iter().map(|r| r.id).collect(),
        identity: first.identity.clone(),
        court_id: first.court_id,
        day_of_week: first.day_of_week,
        sport: first.sport,
        start_time,
        end_time,
        dates: first.dates,
        is_active: first.is_active(),
        label: first.label.clone(),
        hourly_rate: first.hourly_rate,
        duration_minutes: duration_minutes(start_time, end_time),
        amount_per_session: rates.amount(first.sport, start_time, end_time, first.hourly_rate),
    }
}
