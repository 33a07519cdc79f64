//! In-memory job scheduler.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use retrier_core::{Clock, JobRef};

use super::{instant_after, FunctionRef, JobScheduler, JobState, JobStatusProvider, SchedulerError};

/// How long finished job records stay queryable by default.
pub const DEFAULT_JOB_RETENTION_HOURS: i64 = 7 * 24;

#[derive(Debug, Clone)]
struct JobRecord {
    function: FunctionRef,
    args: JsonValue,
    run_at: DateTime<Utc>,
    state: JobState,
    cancel_requested: bool,
    finished_at: Option<DateTime<Utc>>,
}

/// A job handed to a worker for execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedJob {
    pub job: JobRef,
    pub function: FunctionRef,
    pub args: JsonValue,
}

/// Clock-driven job table.
///
/// - Jobs become due once `clock.now() >= run_at`
/// - Due jobs are claimed oldest-first (FIFO on `run_at`, then `JobRef`)
/// - Finished records are kept for `retention`, after which
///   `prune_finished` drops them and status queries report `NotFound`
#[derive(Debug)]
pub struct InMemoryJobScheduler {
    clock: Arc<dyn Clock>,
    jobs: RwLock<HashMap<JobRef, JobRecord>>,
    retention: chrono::Duration,
}

impl InMemoryJobScheduler {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            jobs: RwLock::new(HashMap::new()),
            retention: chrono::Duration::hours(DEFAULT_JOB_RETENTION_HOURS),
        }
    }

    /// Keep finished job records for `retention` instead of the default.
    pub fn with_retention(mut self, retention: chrono::Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn arc(clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self::new(clock))
    }

    /// Claim the oldest due job and mark it in progress.
    pub fn claim_due(&self) -> Result<Option<ClaimedJob>, SchedulerError> {
        let now = self.clock.now();
        let mut jobs = self.jobs.write().map_err(|_| poisoned())?;

        let next = jobs
            .iter()
            .filter(|(_, j)| matches!(j.state, JobState::Pending) && j.run_at <= now)
            .min_by_key(|(id, j)| (j.run_at, **id))
            .map(|(id, _)| *id);

        let Some(job) = next else {
            return Ok(None);
        };

        match jobs.get_mut(&job) {
            Some(record) => {
                record.state = JobState::InProgress;
                Ok(Some(ClaimedJob {
                    job,
                    function: record.function.clone(),
                    args: record.args.clone(),
                }))
            }
            None => Ok(None),
        }
    }

    /// Record the outcome of a claimed job.
    ///
    /// A job whose cancellation was requested while it ran is recorded as
    /// `Canceled` and its outcome is discarded.
    pub fn complete(
        &self,
        job: JobRef,
        outcome: Result<JsonValue, String>,
    ) -> Result<(), SchedulerError> {
        let now = self.clock.now();
        let mut jobs = self.jobs.write().map_err(|_| poisoned())?;
        let record = jobs.get_mut(&job).ok_or(SchedulerError::UnknownJob(job))?;

        if record.state.is_terminal() {
            return Ok(());
        }

        record.state = match (record.cancel_requested, outcome) {
            (true, _) => JobState::Canceled,
            (false, Ok(value)) => JobState::Succeeded { value },
            (false, Err(error)) => JobState::Failed { error },
        };
        record.finished_at = Some(now);
        Ok(())
    }

    /// Earliest `run_at` among jobs still waiting to run.
    pub fn next_due_at(&self) -> Option<DateTime<Utc>> {
        let jobs = self.jobs.read().ok()?;
        jobs.values()
            .filter(|j| matches!(j.state, JobState::Pending))
            .map(|j| j.run_at)
            .min()
    }

    /// Number of jobs waiting to run (due or not).
    pub fn pending_count(&self) -> usize {
        self.jobs
            .read()
            .map(|jobs| {
                jobs.values()
                    .filter(|j| matches!(j.state, JobState::Pending))
                    .count()
            })
            .unwrap_or(0)
    }

    /// Drop finished records older than the retention window.
    pub fn prune_finished(&self) -> Result<usize, SchedulerError> {
        let cutoff = self.clock.now() - self.retention;
        let mut jobs = self.jobs.write().map_err(|_| poisoned())?;
        let before = jobs.len();
        jobs.retain(|_, j| j.finished_at.is_none_or(|at| at > cutoff));
        Ok(before - jobs.len())
    }
}

impl JobStatusProvider for InMemoryJobScheduler {
    fn query_status(&self, job: JobRef) -> Result<JobState, SchedulerError> {
        let jobs = self.jobs.read().map_err(|_| poisoned())?;
        Ok(jobs
            .get(&job)
            .map(|j| j.state.clone())
            .unwrap_or(JobState::NotFound))
    }
}

impl JobScheduler for InMemoryJobScheduler {
    fn schedule(
        &self,
        function: &FunctionRef,
        args: JsonValue,
        delay: Duration,
    ) -> Result<JobRef, SchedulerError> {
        let run_at = instant_after(self.clock.now(), delay);
        let job = JobRef::new();
        let mut jobs = self.jobs.write().map_err(|_| poisoned())?;
        jobs.insert(
            job,
            JobRecord {
                function: function.clone(),
                args,
                run_at,
                state: JobState::Pending,
                cancel_requested: false,
                finished_at: None,
            },
        );
        Ok(job)
    }

    fn request_cancel(&self, job: JobRef) -> Result<bool, SchedulerError> {
        let now = self.clock.now();
        let mut jobs = self.jobs.write().map_err(|_| poisoned())?;
        let record = jobs.get_mut(&job).ok_or(SchedulerError::UnknownJob(job))?;

        match record.state {
            JobState::Pending => {
                record.state = JobState::Canceled;
                record.finished_at = Some(now);
                Ok(true)
            }
            JobState::InProgress => {
                record.cancel_requested = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

fn poisoned() -> SchedulerError {
    SchedulerError::Unavailable("job table lock poisoned".to_string())
}
