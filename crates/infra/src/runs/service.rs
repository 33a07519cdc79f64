//! Caller-facing orchestrator API: start, status, cancel, cleanup.

use std::sync::Arc;

use std::time::Duration;

use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{info, warn};

use retrier_core::{Clock, ExpectedVersion, RunId};

use super::controller::{RetryController, CHECK_FUNCTION};
use super::error::{RetrierError, RetrierResult};
use super::log::RunLog;
use super::store::{RunStats, RunStore, RunStoreError};
use super::types::{RetryOptions, RetryOptionsPatch, Run, RunState, RunStatus};
use crate::scheduler::{FunctionRef, JobScheduler, SchedulerWorker};

const MAX_CANCEL_ATTEMPTS: usize = 3;

/// Page size used when re-attaching open runs at startup.
pub const RESUME_BATCH_SIZE: usize = 500;

/// Outcome of [`Retrier::resume_incomplete`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResumeReport {
    /// Pending runs whose first attempt was scheduled now
    pub started: usize,
    /// In-progress runs that got a fresh check
    pub rearmed: usize,
    /// Runs another writer moved on while we looked
    pub skipped: usize,
}

/// Durable retry orchestrator.
///
/// Cheap to clone; clones share the same controller.
pub struct Retrier<S, J> {
    controller: Arc<RetryController<S, J>>,
    defaults: RetryOptions,
}

impl<S, J> Clone for Retrier<S, J> {
    fn clone(&self) -> Self {
        Self {
            controller: self.controller.clone(),
            defaults: self.defaults.clone(),
        }
    }
}

impl<S: core::fmt::Debug, J: core::fmt::Debug> core::fmt::Debug for Retrier<S, J> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Retrier")
            .field("controller", &self.controller)
            .field("defaults", &self.defaults)
            .finish()
    }
}

impl<S, J> Retrier<S, J>
where
    S: RunStore + 'static,
    J: JobScheduler + 'static,
{
    pub fn new(store: S, scheduler: J, clock: Arc<dyn Clock>) -> Self {
        Self {
            controller: Arc::new(RetryController::new(store, scheduler, clock)),
            defaults: RetryOptions::default(),
        }
    }

    /// Options `start_with_defaults` falls back to.
    pub fn with_defaults(mut self, defaults: RetryOptions) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn defaults(&self) -> &RetryOptions {
        &self.defaults
    }

    pub fn controller(&self) -> &Arc<RetryController<S, J>> {
        &self.controller
    }

    /// Register the check function on a worker so scheduled checks run.
    pub fn register(&self, worker: &mut SchedulerWorker) {
        let controller = self.controller.clone();
        worker.register_handler(CHECK_FUNCTION, move |args| controller.handle_check(args));
    }

    /// Start running `action(args)` with retries.
    pub fn start(
        &self,
        action: FunctionRef,
        args: JsonValue,
        options: RetryOptions,
    ) -> RetrierResult<RunId> {
        options.validate()?;

        let store = self.controller.store();
        let run = Run::new(action, args, options, self.controller.clock().now());
        let run = store.insert(run)?;
        let id = run.id;

        match self.controller.begin(run) {
            Ok(run) => {
                info!(run_id = %id, action = %run.action, "run started");
                Ok(id)
            }
            Err(e) => {
                if let Err(cleanup) = store.delete(id, ExpectedVersion::Any) {
                    warn!(run_id = %id, error = %cleanup, "failed to remove run that could not start");
                }
                Err(e)
            }
        }
    }

    /// `start` with a partial option set merged over the configured defaults.
    pub fn start_with_defaults(
        &self,
        action: FunctionRef,
        args: JsonValue,
        patch: RetryOptionsPatch,
    ) -> RetrierResult<RunId> {
        let options = patch.apply_to(&self.defaults);
        self.start(action, args, options)
    }

    pub fn status(&self, run_id: RunId) -> RetrierResult<RunStatus> {
        Ok(self.run(run_id)?.status())
    }

    /// Full run record.
    pub fn run(&self, run_id: RunId) -> RetrierResult<Run> {
        self.controller
            .store()
            .get(run_id)?
            .ok_or(RetrierError::NotFound(run_id))
    }

    /// Request cancellation.
    ///
    /// Returns `false` if the run had already completed. Otherwise the intent is
    /// recorded durably and the in-flight attempt is asked to stop. The attempt
    /// may still finish first; its result then stands.
    pub fn cancel(&self, run_id: RunId) -> RetrierResult<bool> {
        let store = self.controller.store();
        let mut last_conflict = None;

        for _ in 0..MAX_CANCEL_ATTEMPTS {
            let run = self.run(run_id)?;
            if run.is_completed() {
                return Ok(false);
            }

            let mut next = run.clone();
            next.cancel_requested = true;
            next.updated_at = self.controller.clock().now();

            match store.update(next, run.expected_version()) {
                Ok(saved) => {
                    RunLog::new(run_id, saved.options.log_level).info("cancellation requested");
                    if let Some(job) = saved.current_job {
                        if let Err(e) = self.controller.scheduler().request_cancel(job) {
                            warn!(run_id = %run_id, job = %job, error = %e, "failed to cancel current attempt");
                        }
                    }
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

    /// Delete a completed run.
    pub fn cleanup(&self, run_id: RunId) -> RetrierResult<()> {
        let run = self.run(run_id)?;
        if !run.is_completed() {
            return Err(RetrierError::NotCompleted(run_id));
        }
        self.controller
            .store()
            .delete(run_id, run.expected_version())?;
        info!(run_id = %run_id, "run cleaned up");
        Ok(())
    }

    pub fn stats(&self) -> RetrierResult<RunStats> {
        Ok(self.controller.store().stats()?)
    }

    /// Re-attach every open run to this scheduler.
    ///
    /// Scheduled jobs do not outlive the scheduler that holds them, so after a
    /// restart no check would ever fire for runs that were still open. Pending
    /// runs get their first attempt; in-progress runs get an immediate check,
    /// which finalizes them if their attempt is gone.
    pub fn resume_incomplete(&self) -> RetrierResult<ResumeReport> {
        let store = self.controller.store();
        let mut report = ResumeReport::default();
        let mut after = None;

        loop {
            let batch = store.list_incomplete(after, RESUME_BATCH_SIZE)?;
            let Some(last) = batch.last() else {
                break;
            };
            after = Some(last.id);
            let more = batch.len() == RESUME_BATCH_SIZE;

            for run in batch {
                let id = run.id;
                let resumed = match run.state {
                    RunState::Pending => self.controller.begin(run).map(|_| RunState::Pending),
                    state => self.controller.arm_check(id, Duration::ZERO).map(|_| state),
                };
                match resumed {
                    Ok(RunState::Pending) => report.started += 1,
                    Ok(_) => report.rearmed += 1,
                    Err(e) if e.is_conflict() => report.skipped += 1,
                    Err(e) => return Err(e),
                }
            }

            if !more {
                break;
            }
        }

        info!(
            started = report.started,
            rearmed = report.rearmed,
            skipped = report.skipped,
            "resumed open runs"
        );
        Ok(report)
    }
}
