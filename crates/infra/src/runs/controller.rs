//! Retry loop controller.
//!
//! A run advances one step each time its check job fires. A step never waits:
//! it reads the run, asks the scheduler about the current attempt, and either
//! schedules the next check, schedules a retry, or finalizes the run.
//!
//! ## Step protocol
//!
//! 1. Compute the next record from a snapshot
//! 2. Schedule the jobs that record refers to
//! 3. Commit with `ExpectedVersion::Exact(snapshot.version)`
//!
//! If the commit loses a race (e.g. with `cancel`), the jobs scheduled in (2)
//! are canceled and the step starts over from a fresh read.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{debug, error, warn};

use retrier_core::{Clock, JobRef, RunId};

use super::backoff::{to_duration, with_jitter};
use super::error::{RetrierError, RetrierResult};
use super::log::RunLog;
use super::store::{RunStore, RunStoreError};
use super::types::{Run, RunResult, RunState, DEFAULT_WAIT_BACKOFF_MS};
use crate::scheduler::{FunctionRef, JobScheduler, JobState, SchedulerError};

/// Function name of the self-scheduled status check.
pub const CHECK_FUNCTION: &str = "retrier.check_run";

/// Result recorded when the scheduler lost track of an attempt.
pub const MISSING_JOB_ERROR: &str = "job record missing";

const MAX_STEP_ATTEMPTS: usize = 3;

/// Arguments of a check job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
pub struct CheckArgs {
    pub run_id: RunId,
}

/// What a single step did.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// The run was already terminal; nothing changed.
    AlreadyCompleted,
    /// The attempt is still pending or running; another check was scheduled.
    Waiting { check: JobRef, delay: Duration },
    /// The attempt failed and a new one was scheduled.
    Retrying {
        attempt: JobRef,
        check: JobRef,
        delay: Duration,
    },
    /// The run reached its terminal result in this step.
    Finalized(RunResult),
}

impl StepOutcome {
    pub fn kind(&self) -> &'static str {
        match self {
            StepOutcome::AlreadyCompleted => "already_completed",
            StepOutcome::Waiting { .. } => "waiting",
            StepOutcome::Retrying { .. } => "retrying",
            StepOutcome::Finalized(_) => "finalized",
        }
    }
}

/// A computed step that still has to be committed.
struct Planned {
    next: Run,
    scheduled: Vec<JobRef>,
    outcome: StepOutcome,
}

/// Drives runs through their retry lifecycle.
pub struct RetryController<S, J> {
    store: S,
    scheduler: J,
    clock: Arc<dyn Clock>,
    check_function: FunctionRef,
}

impl<S: core::fmt::Debug, J: core::fmt::Debug> core::fmt::Debug for RetryController<S, J> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RetryController")
            .field("store", &self.store)
            .field("scheduler", &self.scheduler)
            .finish()
    }
}

impl<S, J> RetryController<S, J>
where
    S: RunStore,
    J: JobScheduler,
{
    pub fn new(store: S, scheduler: J, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            scheduler,
            clock,
            check_function: FunctionRef::new(CHECK_FUNCTION),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn scheduler(&self) -> &J {
        &self.scheduler
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Schedule the first attempt and its check, and mark the run in progress.
    ///
    /// `run` must be the freshly inserted (version 1) record.
    pub fn begin(&self, run: Run) -> RetrierResult<Run> {
        let now = self.clock.now();
        let log = RunLog::new(run.id, run.options.log_level);
        let initial = run.options.initial_delay(now);

        let attempt = self
            .scheduler
            .schedule(&run.action, run.args.clone(), initial)?;

        let check_delay = initial.saturating_add(to_duration(with_jitter(run.backoff.wait_backoff_ms)));
        let check = match self.schedule_check(run.id, check_delay) {
            Ok(check) => check,
            Err(e) => {
                self.compensate(&[attempt]);
                return Err(e.into());
            }
        };

        let mut next = run.clone();
        next.mark_in_progress(attempt, check, now);

        match self.store.update(next, run.expected_version()) {
            Ok(saved) => {
                log.info(&format!(
                    "scheduled first attempt of {} as {attempt} in {} ms, checking in {} ms",
                    run.action,
                    initial.as_millis(),
                    check_delay.as_millis()
                ));
                Ok(saved)
            }
            Err(e) => {
                self.compensate(&[attempt, check]);
                Err(e.into())
            }
        }
    }

    /// Advance a run by one step.
    pub fn step(&self, run_id: RunId) -> RetrierResult<StepOutcome> {
        let mut last_conflict = None;

        for _ in 0..MAX_STEP_ATTEMPTS {
            let run = self
                .store
                .get(run_id)?
                .ok_or(RetrierError::NotFound(run_id))?;

            if run.is_completed() {
                return Ok(StepOutcome::AlreadyCompleted);
            }

            // `begin` has not committed yet. Writing here would make it lose
            // its version check, so only re-arm.
            if run.state == RunState::Pending {
                return self.wait_for_begin(&run);
            }

            let planned = self.plan(&run)?;
            match self.store.update(planned.next, run.expected_version()) {
                Ok(saved) => {
                    if let StepOutcome::Finalized(result) = &planned.outcome {
                        self.on_finalized(&saved, result);
                    }
                    return Ok(planned.outcome);
                }
                Err(err @ RunStoreError::Conflict { .. }) => {
                    debug!(run_id = %run_id, error = %err, "step lost a race, retrying from a fresh read");
                    self.compensate(&planned.scheduled);
                    last_conflict = Some(err);
                }
                Err(err) => {
                    self.compensate(&planned.scheduled);
                    return Err(err.into());
                }
            }
        }

        Err(match last_conflict {
            Some(err) => err.into(),
            None => RetrierError::NotFound(run_id),
        })
    }

    /// Set the terminal result of a run.
    ///
    /// Returns `false` without side effects if the run already completed. The
    /// completion callback fires only when this call did the finalizing.
    pub fn finalize(&self, run_id: RunId, result: RunResult) -> RetrierResult<bool> {
        let mut last_conflict = None;

        for _ in 0..MAX_STEP_ATTEMPTS {
            let run = self
                .store
                .get(run_id)?
                .ok_or(RetrierError::NotFound(run_id))?;

            let mut next = run.clone();
            if !next.complete(result.clone(), self.clock.now()) {
                return Ok(false);
            }

            match self.store.update(next, run.expected_version()) {
                Ok(saved) => {
                    self.on_finalized(&saved, &result);
                    return Ok(true);
                }
                Err(err @ RunStoreError::Conflict { .. }) => last_conflict = Some(err),
                Err(err) => return Err(err.into()),
            }
        }

        Err(match last_conflict {
            Some(err) => err.into(),
            None => RetrierError::NotFound(run_id),
        })
    }

    /// Body of the `retrier.check_run` job.
    ///
    /// Errors are not surfaced as job failures: a step that could not complete
    /// re-arms its check so the run keeps moving once the store or scheduler
    /// recovers.
    pub fn handle_check(&self, args: &JsonValue) -> Result<JsonValue, String> {
        let CheckArgs { run_id } = serde_json::from_value(args.clone())
            .map_err(|e| format!("malformed check args: {e}"))?;

        match self.step(run_id) {
            Ok(outcome) => Ok(serde_json::json!({ "outcome": outcome.kind() })),
            Err(RetrierError::NotFound(_)) => {
                // Cleaned up while a check was still queued.
                debug!(run_id = %run_id, "check fired for a run that no longer exists");
                Ok(serde_json::json!({ "outcome": "gone" }))
            }
            Err(e) => {
                let wait_ms = self
                    .store
                    .get(run_id)
                    .ok()
                    .flatten()
                    .map(|r| r.backoff.wait_backoff_ms)
                    .unwrap_or(DEFAULT_WAIT_BACKOFF_MS);
                let delay = to_duration(with_jitter(wait_ms));
                warn!(
                    run_id = %run_id,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "step failed, re-arming check"
                );
                self.schedule_check(run_id, delay)
                    .map(|check| serde_json::json!({ "outcome": "rearmed", "check": check }))
                    .map_err(|se| {
                        error!(run_id = %run_id, error = %se, "failed to re-arm check; run is stalled");
                        format!("step failed ({e}) and check could not be re-armed ({se})")
                    })
            }
        }
    }

    fn plan(&self, run: &Run) -> RetrierResult<Planned> {
        let log = RunLog::new(run.id, run.options.log_level);
        let now = self.clock.now();

        let status = match run.current_job {
            Some(job) => self.scheduler.query_status(job)?,
            None => JobState::NotFound,
        };
        let job = run
            .current_job
            .map(|j| j.to_string())
            .unwrap_or_else(|| "<none>".to_string());

        let mut next = run.clone();
        next.updated_at = now;

        let terminal = |mut next: Run, result: RunResult| {
            next.complete(result.clone(), now);
            Planned {
                next,
                scheduled: Vec::new(),
                outcome: StepOutcome::Finalized(result),
            }
        };

        let planned = match status {
            JobState::Pending | JobState::InProgress => {
                if run.cancel_requested {
                    if let Some(current) = run.current_job {
                        if let Err(e) = self.scheduler.request_cancel(current) {
                            warn!(run_id = %run.id, job = %current, error = %e, "failed to re-request cancellation");
                        }
                    }
                }
                let delay = to_duration(with_jitter(run.backoff.wait_backoff_ms));
                let check = self.schedule_check(run.id, delay)?;
                log.debug(&format!(
                    "job {job} not yet complete, checking again in {} ms",
                    delay.as_millis()
                ));
                next.check_job = Some(check);
                next.backoff = run.backoff.after_wait();
                Planned {
                    next,
                    scheduled: vec![check],
                    outcome: StepOutcome::Waiting { check, delay },
                }
            }
            JobState::Succeeded { value } => {
                log.info(&format!("job {job} succeeded"));
                terminal(next, RunResult::success(value))
            }
            JobState::Canceled => {
                log.info(&format!("job {job} was canceled, not retrying"));
                terminal(next, RunResult::Canceled)
            }
            JobState::Failed { .. } if run.cancel_requested => {
                log.info(&format!("job {job} failed after cancellation, not retrying"));
                terminal(next, RunResult::Canceled)
            }
            JobState::Failed { error } if !run.backoff.has_budget() => {
                log.warn(&format!("job {job} failed too many times, not retrying: {error}"));
                terminal(next, RunResult::failed(error))
            }
            JobState::Failed { error } => {
                let delay = to_duration(with_jitter(run.backoff.retry_backoff_ms));
                let attempt = self
                    .scheduler
                    .schedule(&run.action, run.args.clone(), delay)?;

                let check_delay = to_duration(with_jitter(run.backoff.retry_check_delay_ms()));
                let check = match self.schedule_check(run.id, check_delay) {
                    Ok(check) => check,
                    Err(e) => {
                        self.compensate(&[attempt]);
                        return Err(e.into());
                    }
                };

                log.info(&format!(
                    "job {job} failed ({error}), retrying in {} ms as {attempt}",
                    delay.as_millis()
                ));

                next.current_job = Some(attempt);
                next.check_job = Some(check);
                next.backoff = run.backoff.after_failure(run.options.base);
                next.attempts += 1;
                Planned {
                    next,
                    scheduled: vec![attempt, check],
                    outcome: StepOutcome::Retrying {
                        attempt,
                        check,
                        delay,
                    },
                }
            }
            JobState::NotFound => {
                log.error(&format!("job {job} not found, giving up"));
                terminal(next, RunResult::failed(MISSING_JOB_ERROR))
            }
        };

        Ok(planned)
    }

    /// Queue a check for `run_id` outside the step chain.
    pub fn arm_check(&self, run_id: RunId, delay: Duration) -> RetrierResult<JobRef> {
        Ok(self.schedule_check(run_id, delay)?)
    }

    fn wait_for_begin(&self, run: &Run) -> RetrierResult<StepOutcome> {
        let wait_ms = run.backoff.wait_backoff_ms.max(DEFAULT_WAIT_BACKOFF_MS);
        let delay = to_duration(with_jitter(wait_ms));
        let check = self.schedule_check(run.id, delay)?;
        RunLog::new(run.id, run.options.log_level).debug(&format!(
            "run not started yet, checking again in {} ms",
            delay.as_millis()
        ));
        Ok(StepOutcome::Waiting { check, delay })
    }

    fn schedule_check(&self, run_id: RunId, delay: Duration) -> Result<JobRef, SchedulerError> {
        let args = serde_json::to_value(CheckArgs { run_id }).unwrap_or(JsonValue::Null);
        self.scheduler.schedule(&self.check_function, args, delay)
    }

    /// Best-effort cancellation of jobs whose run write did not commit.
    fn compensate(&self, jobs: &[JobRef]) {
        for job in jobs {
            if let Err(e) = self.scheduler.request_cancel(*job) {
                warn!(job = %job, error = %e, "failed to cancel orphaned job");
            }
        }
    }

    /// Side effects after a terminal result was durably written.
    fn on_finalized(&self, run: &Run, result: &RunResult) {
        let log = RunLog::new(run.id, run.options.log_level);
        log.info(&format!(
            "run completed ({}) after {} attempt(s)",
            result.kind(),
            run.attempts
        ));

        let Some(callback) = &run.options.on_complete else {
            return;
        };

        let args = serde_json::json!({
            "run_id": run.id,
            "result": result,
        });
        match self.scheduler.schedule(callback, args, Duration::ZERO) {
            Ok(job) => log.debug(&format!("scheduled completion callback {callback} as {job}")),
            Err(e) => error!(
                run_id = %run.id,
                callback = %callback,
                error = %e,
                "failed to schedule completion callback"
            ),
        }
    }
}
