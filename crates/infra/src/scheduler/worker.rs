//! Scheduler worker: executes due jobs against registered functions.

use std::collections::HashMap;
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::Value as JsonValue;
use tracing::{debug, error, info, warn};

use super::in_memory::{ClaimedJob, InMemoryJobScheduler};
use super::{FunctionRef, SchedulerError};

/// Function body: args in, return value or error message out.
pub type JobHandler = Arc<dyn Fn(&JsonValue) -> Result<JsonValue, String> + Send + Sync>;

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// How often to poll for due jobs when idle
    pub poll_interval: Duration,
    /// How often to drop expired finished job records
    pub prune_interval: Duration,
    /// Name for logging and the worker thread
    pub name: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(50),
            prune_interval: Duration::from_secs(3600),
            name: "retrier-worker".to_string(),
        }
    }
}

impl WorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Handle to control a running worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl WorkerHandle {
    /// Request graceful shutdown and wait for the worker to stop.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }

    /// Get current worker statistics.
    pub fn stats(&self) -> WorkerStats {
        self.stats_view().snapshot()
    }

    /// A cloneable reader of the statistics that outlives borrows of the handle.
    pub fn stats_view(&self) -> WorkerStatsView {
        WorkerStatsView {
            inner: self.stats.clone(),
        }
    }
}

/// Shared read access to a running worker's statistics.
#[derive(Debug, Clone)]
pub struct WorkerStatsView {
    inner: Arc<Mutex<WorkerStats>>,
}

impl WorkerStatsView {
    pub fn snapshot(&self) -> WorkerStats {
        self.inner.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct WorkerStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub uptime_secs: u64,
}

/// Executes due jobs from an `InMemoryJobScheduler`.
///
/// Functions are resolved by exact name first, then by `prefix.*` category
/// patterns, then by the `*` wildcard. A job whose function has no handler is
/// recorded as failed.
pub struct SchedulerWorker {
    scheduler: Arc<InMemoryJobScheduler>,
    handlers: HashMap<String, JobHandler>,
}

impl core::fmt::Debug for SchedulerWorker {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SchedulerWorker")
            .field("functions", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl SchedulerWorker {
    pub fn new(scheduler: Arc<InMemoryJobScheduler>) -> Self {
        Self {
            scheduler,
            handlers: HashMap::new(),
        }
    }

    /// Register a handler for a function name or pattern.
    pub fn register_handler<F>(&mut self, pattern: impl Into<String>, handler: F)
    where
        F: Fn(&JsonValue) -> Result<JsonValue, String> + Send + Sync + 'static,
    {
        self.handlers.insert(pattern.into(), Arc::new(handler));
    }

    pub fn scheduler(&self) -> &Arc<InMemoryJobScheduler> {
        &self.scheduler
    }

    fn get_handler(&self, function: &FunctionRef) -> Option<&JobHandler> {
        let name = function.as_str();
        if let Some(h) = self.handlers.get(name) {
            return Some(h);
        }

        // "billing.*" matches "billing.charge_card"
        for (pattern, handler) in &self.handlers {
            if let Some(prefix) = pattern.strip_suffix(".*") {
                if name.starts_with(prefix) {
                    return Some(handler);
                }
            }
        }

        self.handlers.get("*")
    }

    /// Run every job that is due right now. Returns how many ran.
    ///
    /// Jobs scheduled with zero delay by a handler during this tick also run.
    pub fn tick(&self) -> Result<usize, SchedulerError> {
        let mut ran = 0;
        while let Some(claimed) = self.scheduler.claim_due()? {
            self.execute(claimed)?;
            ran += 1;
        }
        Ok(ran)
    }

    fn execute(&self, claimed: ClaimedJob) -> Result<bool, SchedulerError> {
        let outcome = match self.get_handler(&claimed.function) {
            Some(handler) => handler(&claimed.args),
            None => {
                let error = format!("no handler for function: {}", claimed.function);
                warn!(job = %claimed.job, function = %claimed.function, "no handler for job");
                Err(error)
            }
        };

        let succeeded = outcome.is_ok();
        if let Err(e) = &outcome {
            debug!(job = %claimed.job, function = %claimed.function, error = %e, "job failed");
        }
        self.scheduler.complete(claimed.job, outcome)?;
        Ok(succeeded)
    }

    /// Spawn the worker in a background thread.
    pub fn spawn(self, config: WorkerConfig) -> std::io::Result<WorkerHandle> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = Arc::new(Mutex::new(WorkerStats::default()));
        let stats_clone = stats.clone();

        let join = thread::Builder::new()
            .name(config.name.clone())
            .spawn(move || worker_loop(self, config, shutdown_rx, stats_clone))?;

        Ok(WorkerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        })
    }
}

fn worker_loop(
    worker: SchedulerWorker,
    config: WorkerConfig,
    shutdown_rx: mpsc::Receiver<()>,
    stats: Arc<Mutex<WorkerStats>>,
) {
    info!(worker = %config.name, "scheduler worker started");
    let start_time = Instant::now();
    let mut last_prune = Instant::now();

    loop {
        if let Ok(mut s) = stats.lock() {
            s.uptime_secs = start_time.elapsed().as_secs();
        }

        if last_prune.elapsed() >= config.prune_interval {
            match worker.scheduler.prune_finished() {
                Ok(n) if n > 0 => debug!(worker = %config.name, pruned = n, "pruned finished jobs"),
                Ok(_) => {}
                Err(e) => warn!(worker = %config.name, error = %e, "failed to prune jobs"),
            }
            last_prune = Instant::now();
        }

        match worker.scheduler.claim_due() {
            Ok(Some(claimed)) => {
                let job = claimed.job;
                let result = worker.execute(claimed);
                if let Ok(mut s) = stats.lock() {
                    s.jobs_processed += 1;
                    match result {
                        Ok(true) => s.jobs_succeeded += 1,
                        Ok(false) | Err(_) => s.jobs_failed += 1,
                    }
                }
                if let Err(e) = result {
                    error!(worker = %config.name, job = %job, error = %e, "failed to record job outcome");
                }
                // Drain without waiting while work is due.
                if shutdown_rx.try_recv().is_ok() {
                    break;
                }
                continue;
            }
            Ok(None) => {}
            Err(e) => {
                error!(worker = %config.name, error = %e, "failed to claim job");
            }
        }

        match shutdown_rx.recv_timeout(config.poll_interval) {
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    info!(worker = %config.name, "scheduler worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{JobScheduler, JobState, JobStatusProvider};
    use retrier_core::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn worker() -> SchedulerWorker {
        let clock = ManualClock::default();
        SchedulerWorker::new(InMemoryJobScheduler::arc(Arc::new(clock)))
    }

    #[test]
    fn tick_runs_due_jobs_and_records_outcomes() {
        let mut worker = worker();
        worker.register_handler("math.double", |args| {
            let n = args.as_i64().ok_or("expected a number")?;
            Ok(serde_json::json!(n * 2))
        });

        let scheduler = worker.scheduler().clone();
        let ok = scheduler
            .schedule(&FunctionRef::new("math.double"), serde_json::json!(21), Duration::ZERO)
            .unwrap();
        let bad = scheduler
            .schedule(&FunctionRef::new("math.double"), serde_json::json!("x"), Duration::ZERO)
            .unwrap();

        assert_eq!(worker.tick().unwrap(), 2);
        assert_eq!(
            scheduler.query_status(ok).unwrap(),
            JobState::Succeeded { value: serde_json::json!(42) }
        );
        assert_eq!(
            scheduler.query_status(bad).unwrap(),
            JobState::Failed { error: "expected a number".to_string() }
        );
    }

    #[test]
    fn missing_handler_fails_the_job() {
        let worker = worker();
        let job = worker
            .scheduler()
            .schedule(&FunctionRef::new("nope"), JsonValue::Null, Duration::ZERO)
            .unwrap();

        worker.tick().unwrap();
        assert!(matches!(
            worker.scheduler().query_status(job).unwrap(),
            JobState::Failed { error } if error.contains("no handler")
        ));
    }

    #[test]
    fn category_and_wildcard_handlers() {
        let mut worker = worker();
        let category = Arc::new(AtomicUsize::new(0));
        let wildcard = Arc::new(AtomicUsize::new(0));

        let c = category.clone();
        worker.register_handler("billing.*", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(JsonValue::Null)
        });
        let w = wildcard.clone();
        worker.register_handler("*", move |_| {
            w.fetch_add(1, Ordering::SeqCst);
            Ok(JsonValue::Null)
        });

        let scheduler = worker.scheduler().clone();
        scheduler
            .schedule(&FunctionRef::new("billing.charge"), JsonValue::Null, Duration::ZERO)
            .unwrap();
        scheduler
            .schedule(&FunctionRef::new("email.send"), JsonValue::Null, Duration::ZERO)
            .unwrap();

        worker.tick().unwrap();
        assert_eq!(category.load(Ordering::SeqCst), 1);
        assert_eq!(wildcard.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn spawned_worker_processes_jobs_until_shutdown() {
        let clock = retrier_core::SystemClock;
        let scheduler = InMemoryJobScheduler::arc(Arc::new(clock));
        let mut worker = SchedulerWorker::new(scheduler.clone());
        worker.register_handler("noop", |_| Ok(JsonValue::Null));

        let job = scheduler
            .schedule(&FunctionRef::new("noop"), JsonValue::Null, Duration::ZERO)
            .unwrap();

        let handle = worker
            .spawn(WorkerConfig::default().with_poll_interval(Duration::from_millis(5)))
            .unwrap();

        for _ in 0..200 {
            if handle.stats().jobs_processed == 1 {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }

        assert_eq!(
            scheduler.query_status(job).unwrap(),
            JobState::Succeeded { value: JsonValue::Null }
        );
        assert_eq!(handle.stats().jobs_succeeded, 1);

        let view = handle.stats_view();
        handle.shutdown();
        assert_eq!(view.snapshot().jobs_processed, 1);
    }
}
