use thiserror::Error;

use crate::jobcode::JobCodeError;
use crate::mailer::MailError;
use crate::model::ValidationError;
use crate::store::StoreError;

use super::conflict::Collision;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// Requested slots are already held. Re-query availability and pick again.
    #[error("slot conflict: {}", list_collisions(.0))]
    SlotConflict(Vec<Collision>),
    /// The store's uniqueness constraint fired after the checks passed.
    #[error("slot was taken by a concurrent reservation: {0}")]
    StorageConflict(String),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },
    #[error("{kind} {id} cannot move from {from} to {to}")]
    InvalidTransition {
        kind: &'static str,
        id: String,
        from: String,
        to: String,
    },
    #[error(transparent)]
    JobCode(#[from] JobCodeError),
    #[error(transparent)]
    Mail(#[from] MailError),
    #[error("storage error: {0}")]
    Storage(StoreError),
}

fn list_collisions(collisions: &[Collision]) -> String {
    collisions
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::UniqueViolation { .. } => EngineError::StorageConflict(err.to_string()),
            StoreError::MissingCourt(id) => EngineError::NotFound { kind: "court", id: id.0.to_string() },
            StoreError::MissingRow(id) => EngineError::NotFound { kind: "row", id: id.to_string() },
            other => EngineError::Storage(other),
        }
    }
}

impl EngineError {
    pub(crate) fn not_found(kind: &'static str, id: impl ToString) -> Self {
        EngineError::NotFound { kind, id: id.to_string() }
    }

    /// Conflicts the caller can resolve by choosing other slots.
    pub fn is_conflict(&self) -> bool {
        matches!(self, EngineError::SlotConflict(_) | EngineError::StorageConflict(_))
    }
}
