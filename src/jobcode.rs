//! Month-scoped sequential job codes: `JAN-001-2026`.

use std::fmt;
use std::sync::Arc;

use chrono::Datelike;
use thiserror::Error;

use crate::clock::{Clock, FacilityTz};
use crate::model::CounterScope;
use crate::observability::JOB_CODES_TOTAL;
use crate::retry::{retry_if, RetryPolicy};
use crate::store::{CounterStore, StoreError};

const MONTHS: [&str; 12] = [
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobCodeError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("counter not found after upsert for {0}")]
    CounterNotFound(CounterScope),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobCode {
    pub scope: CounterScope,
    pub counter: u32,
}

impl fmt::Display for JobCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let month = self
            .scope
            .month
            .checked_sub(1)
            .and_then(|i| MONTHS.get(i as usize))
            .copied()
            .unwrap_or("???");
        write!(f, "{month}-{:03}-{:04}", self.counter, self.scope.year)
    }
}

pub struct JobCodeGenerator<C: CounterStore + ?Sized> {
    store: Arc<C>,
    clock: Arc<dyn Clock>,
    tz: FacilityTz,
    policy: RetryPolicy,
}

impl<C: CounterStore + ?Sized> JobCodeGenerator<C> {
    pub fn new(store: Arc<C>, clock: Arc<dyn Clock>, tz: FacilityTz, policy: RetryPolicy) -> Self {
        Self { store, clock, tz, policy }
    }

    /// Counter scope for the current facility-local month.
    pub fn current_scope(&self) -> CounterScope {
        let local = self.tz.local(self.clock.now());
        CounterScope { year: local.year(), month: local.month() }
    }

    /// Issue the next code for the current month. Transient store failures
    /// are retried under the policy; anything else fails at once.
    pub async fn next(&self) -> Result<JobCode, JobCodeError> {
        let scope = self.current_scope();
        let value = retry_if(self.policy, StoreError::is_transient, || {
            self.store.increment_counter(scope)
        })
        .await?;
        let counter = value.ok_or(JobCodeError::CounterNotFound(scope))?;

        let code = JobCode { scope, counter };
        metrics::counter!(JOB_CODES_TOTAL).increment(1);
        tracing::info!(%code, "job code issued");
        Ok(code)
    }
}
