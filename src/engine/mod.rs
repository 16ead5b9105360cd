mod allocate;
mod conflict;
mod error;
mod expiry;
mod queries;
#[cfg(test)]
mod tests;

pub use allocate::{LessonRequest, SeriesRequest, SlotRequest, SlotsRequest};
pub use conflict::{find_collisions, Candidate, Collision, ConflictReport, ConflictSource, Occupancy, Occurrence};
pub use error::EngineError;
pub use expiry::{
    deadline, evaluate, expiration_info, ExpirationInfo, SweepFailure, SweepOptions, SweepReport, Verdict,
    CONFIRM_BEFORE_PLAY_HOURS, SHORT_WINDOW_HOURS, STANDARD_WINDOW_HOURS, WARNING_WINDOW_HOURS,
};

use std::sync::Arc;

use ulid::Ulid;

use crate::clock::{Clock, FacilityTz};
use crate::jobcode::JobCodeGenerator;
use crate::limits::MAX_NAME_LEN;
use crate::mailer::Mailer;
use crate::model::*;
use crate::pricing::RateCard;
use crate::retry::RetryPolicy;
use crate::store::Store;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineSettings {
    pub tz: FacilityTz,
    pub rates: RateCard,
    pub counter_retry: RetryPolicy,
}

/// The booking core: allocation, conflict detection, expiration, grouping
/// and job codes over a shared [`Store`].
pub struct Engine {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    mailer: Arc<dyn Mailer>,
    tz: FacilityTz,
    rates: RateCard,
    job_codes: JobCodeGenerator<dyn Store>,
}

impl Engine {
    pub fn new(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        mailer: Arc<dyn Mailer>,
        settings: EngineSettings,
    ) -> Self {
        let job_codes = JobCodeGenerator::new(store.clone(), clock.clone(), settings.tz, settings.counter_retry);
        Self {
            store,
            clock,
            mailer,
            tz: settings.tz,
            rates: settings.rates,
            job_codes,
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn rates(&self) -> &RateCard {
        &self.rates
    }

    pub fn tz(&self) -> FacilityTz {
        self.tz
    }

    /// Facility-local date right now.
    pub fn today(&self) -> chrono::NaiveDate {
        self.tz.today(self.clock.now())
    }

    // ── Courts and users ─────────────────────────────────────

    /// Register a court. An existing court with the same id is returned
    /// unchanged.
    pub async fn add_court(&self, id: CourtId, name: &str, hourly_rate: Option<Money>) -> Result<Court, EngineError> {
        if name.len() > MAX_NAME_LEN {
            return Err(ValidationError::NameTooLong.into());
        }
        if let Some(existing) = self.store.court(id).await? {
            return Ok(existing);
        }
        let court = Court { id, name: name.to_string(), hourly_rate, is_active: true };
        self.store.save_court(court.clone()).await?;
        tracing::info!(court = %id, "court added");
        Ok(court)
    }

    /// Set or clear the court's custom hourly rate. Existing bookings keep
    /// their price.
    pub async fn set_court_rate(&self, id: CourtId, hourly_rate: Option<Money>) -> Result<Court, EngineError> {
        let mut court = self.require_court(id).await?;
        court.hourly_rate = hourly_rate;
        self.store.save_court(court.clone()).await?;
        Ok(court)
    }

    /// Stop taking reservations on a court. Existing reservations stand.
    pub async fn deactivate_court(&self, id: CourtId) -> Result<Court, EngineError> {
        let mut court = self.require_court(id).await?;
        if court.is_active {
            court.is_active = false;
            self.store.save_court(court.clone()).await?;
            tracing::info!(court = %id, "court deactivated");
        }
        Ok(court)
    }

    pub async fn courts(&self) -> Result<Vec<Court>, EngineError> {
        Ok(self.store.courts().await?)
    }

    pub async fn register_user(&self, name: &str, email: Option<&str>) -> Result<User, EngineError> {
        if name.len() > MAX_NAME_LEN || email.is_some_and(|e| e.len() > MAX_NAME_LEN) {
            return Err(ValidationError::NameTooLong.into());
        }
        let user = User {
            id: Ulid::new(),
            name: name.to_string(),
            email: email.map(str::to_string),
        };
        self.store.save_user(user.clone()).await?;
        Ok(user)
    }

    async fn require_court(&self, id: CourtId) -> Result<Court, EngineError> {
        self.store
            .court(id)
            .await?
            .ok_or_else(|| EngineError::not_found("court", id.0))
    }

    /// The court, if it exists and takes reservations.
    async fn bookable_court(&self, id: CourtId) -> Result<Court, EngineError> {
        match self.store.court(id).await? {
            None => Err(ValidationError::UnknownCourt(id).into()),
            Some(c) if !c.is_active => Err(ValidationError::InactiveCourt(id).into()),
            Some(c) => Ok(c),
        }
    }
}
