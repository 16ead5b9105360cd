use chrono::NaiveDate;
use ulid::Ulid;

use crate::grouping::{group_recurring, RecurringGroup};
use crate::jobcode::JobCode;
use crate::model::*;
use crate::slots::bookable_starts;

use super::conflict::{load_from_store, Candidate};
use super::{Engine, EngineError};

impl Engine {
    /// Bookable start times on `date` that nothing holds yet.
    pub async fn free_slots(&self, court: CourtId, date: NaiveDate) -> Result<Vec<SlotTime>, EngineError> {
        self.bookable_court(court).await?;
        let candidates: Vec<Candidate> = bookable_starts()
            .map(|start| Candidate::slot(court, date, start))
            .collect();
        let occupancy = load_from_store(self.store.as_ref(), &candidates).await?;
        let Some(occ) = occupancy.get(&court) else {
            return Ok(candidates.iter().map(|c| c.start).collect());
        };
        Ok(candidates
            .iter()
            .filter(|c| occ.collision(c).is_none())
            .map(|c| c.start)
            .collect())
    }

    /// Recurring rows merged into the reservations they were made as.
    pub async fn recurring_groups(&self, court: Option<CourtId>) -> Result<Vec<RecurringGroup>, EngineError> {
        let rows = self.store.recurring_rows(court).await?;
        Ok(group_recurring(&rows, &self.rates))
    }

    pub async fn next_job_code(&self) -> Result<JobCode, EngineError> {
        Ok(self.job_codes.next().await?)
    }

    pub async fn booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.store
            .booking(id)
            .await?
            .ok_or_else(|| EngineError::not_found("booking", id))
    }

    pub async fn lesson(&self, id: Ulid) -> Result<LessonSession, EngineError> {
        self.store
            .lesson(id)
            .await?
            .ok_or_else(|| EngineError::not_found("lesson", id))
    }

    pub async fn notifications(&self, user_id: Ulid) -> Result<Vec<Notification>, EngineError> {
        Ok(self.store.notifications(user_id).await?)
    }
}
