//! Job scheduler boundary.
//!
//! The orchestrator never runs actions itself. It hands units of work to a
//! scheduler ("run this function with these args after this delay"), keeps the
//! returned `JobRef`, and later asks the scheduler what happened to it.
//!
//! ## Components
//!
//! - `JobStatusProvider`: status queries only (what the retry loop observes)
//! - `JobScheduler`: scheduling and best-effort cancellation
//! - `InMemoryJobScheduler`: clock-driven job table for tests/dev/single node
//! - `SchedulerWorker`: function registry that executes due jobs

pub mod in_memory;
pub mod worker;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use retrier_core::JobRef;

pub use in_memory::{ClaimedJob, InMemoryJobScheduler};
pub use worker::{
    JobHandler, SchedulerWorker, WorkerConfig, WorkerHandle, WorkerStats, WorkerStatsView,
};

/// Name of a function the scheduler knows how to invoke.
///
/// Names are dotted paths (`billing.charge_card`); the worker resolves them
/// against its registry, including `prefix.*` category patterns.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FunctionRef(String);

impl FunctionRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for FunctionRef {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FunctionRef {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Observed state of a scheduled job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobState {
    /// Accepted, not yet started
    Pending,
    /// Currently executing
    InProgress,
    /// Finished and returned a value
    Succeeded { value: JsonValue },
    /// Finished with an error
    Failed { error: String },
    /// Canceled before (or while) running
    Canceled,
    /// The scheduler no longer has a record of the job
    NotFound,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded { .. } | JobState::Failed { .. } | JobState::Canceled
        )
    }
}

/// Scheduler error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SchedulerError {
    #[error("scheduler unavailable: {0}")]
    Unavailable(String),
    #[error("unknown job: {0}")]
    UnknownJob(JobRef),
}

/// Read-only view of job outcomes.
pub trait JobStatusProvider: Send + Sync {
    /// Current state of a job; `JobState::NotFound` when the record is gone.
    fn query_status(&self, job: JobRef) -> Result<JobState, SchedulerError>;
}

/// Accepts work for deferred, exactly-once execution.
pub trait JobScheduler: JobStatusProvider {
    /// Enqueue `function(args)` to run after `delay`.
    fn schedule(
        &self,
        function: &FunctionRef,
        args: JsonValue,
        delay: Duration,
    ) -> Result<JobRef, SchedulerError>;

    /// Ask the scheduler to cancel a job.
    ///
    /// Returns `true` if the request was accepted (the job had not finished yet).
    fn request_cancel(&self, job: JobRef) -> Result<bool, SchedulerError>;
}

impl<T: JobStatusProvider + ?Sized> JobStatusProvider for Arc<T> {
    fn query_status(&self, job: JobRef) -> Result<JobState, SchedulerError> {
        (**self).query_status(job)
    }
}

impl<T: JobScheduler + ?Sized> JobScheduler for Arc<T> {
    fn schedule(
        &self,
        function: &FunctionRef,
        args: JsonValue,
        delay: Duration,
    ) -> Result<JobRef, SchedulerError> {
        (**self).schedule(function, args, delay)
    }

    fn request_cancel(&self, job: JobRef) -> Result<bool, SchedulerError> {
        (**self).request_cancel(job)
    }
}

/// `at + delay`, saturating at the maximum representable instant.
pub(crate) fn instant_after(at: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    let delta = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
    at.checked_add_signed(delta).unwrap_or(DateTime::<Utc>::MAX_UTC)
}
