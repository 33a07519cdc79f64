use thiserror::Error;

use retrier_core::{DomainError, RunId};

use super::store::RunStoreError;
use crate::scheduler::SchedulerError;

/// Errors surfaced by the retry orchestrator.
#[derive(Debug, Error)]
pub enum RetrierError {
    #[error("run not found: {0}")]
    NotFound(RunId),

    #[error("run {0} has not completed")]
    NotCompleted(RunId),

    #[error("invalid retry options: {0}")]
    InvalidOptions(#[from] DomainError),

    #[error(transparent)]
    Store(RunStoreError),

    #[error("scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),
}

impl From<RunStoreError> for RetrierError {
    fn from(err: RunStoreError) -> Self {
        match err {
            RunStoreError::NotFound(id) => RetrierError::NotFound(id),
            other => RetrierError::Store(other),
        }
    }
}

impl RetrierError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, RetrierError::Store(RunStoreError::Conflict { .. }))
    }
}

pub type RetrierResult<T> = Result<T, RetrierError>;
