//! Expiry sweeper and its daily trigger.

use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, NaiveTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use retrier_core::{Clock, DomainError, DomainResult};

use super::store::{RunStore, RunStoreError};

pub const DEFAULT_RETENTION_HOURS: i64 = 7 * 24;
pub const DEFAULT_SWEEP_BATCH_SIZE: usize = 500;

/// Longest the trigger sleeps before re-reading the clock.
const MAX_TRIGGER_SLEEP: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Expired runs looked at
    pub scanned: usize,
    /// Runs deleted
    pub deleted: usize,
    /// Runs that changed or vanished between listing and deleting
    pub skipped: usize,
}

impl SweepReport {
    fn absorb(&mut self, other: SweepReport) {
        self.scanned += other.scanned;
        self.deleted += other.deleted;
        self.skipped += other.skipped;
    }
}

/// Deletes completed runs once they are older than the retention window.
pub struct ExpirySweeper<S> {
    store: S,
    clock: Arc<dyn Clock>,
    retention: chrono::Duration,
    batch_size: usize,
}

impl<S: RunStore> ExpirySweeper<S> {
    pub fn new(store: S, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            retention: chrono::Duration::hours(DEFAULT_RETENTION_HOURS),
            batch_size: DEFAULT_SWEEP_BATCH_SIZE,
        }
    }

    pub fn with_retention(mut self, retention: chrono::Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn retention(&self) -> chrono::Duration {
        self.retention
    }

    /// Delete one batch of expired runs.
    ///
    /// Each delete is guarded by the version that was listed, so a run touched
    /// in between is left alone for the next sweep.
    pub fn sweep(&self) -> Result<SweepReport, RunStoreError> {
        let cutoff = self.clock.now() - self.retention;
        let expired = self.store.list_expired(cutoff, self.batch_size)?;

        let mut report = SweepReport {
            scanned: expired.len(),
            ..SweepReport::default()
        };

        for run in expired {
            match self.store.delete(run.id, run.expected_version()) {
                Ok(()) => report.deleted += 1,
                Err(RunStoreError::NotFound(_) | RunStoreError::Conflict { .. }) => {
                    report.skipped += 1;
                }
                Err(e) => {
                    warn!(run_id = %run.id, error = %e, "failed to delete expired run");
                    return Err(e);
                }
            }
        }

        debug!(
            cutoff = %cutoff,
            scanned = report.scanned,
            deleted = report.deleted,
            "expiry sweep batch done"
        );
        Ok(report)
    }

    /// Sweep batches until no more expired runs are found.
    pub fn sweep_all(&self) -> Result<SweepReport, RunStoreError> {
        let mut total = SweepReport::default();
        loop {
            let batch = self.sweep()?;
            total.absorb(batch);
            if batch.scanned < self.batch_size || batch.deleted == 0 {
                break;
            }
        }
        info!(deleted = total.deleted, skipped = total.skipped, "expired runs swept");
        Ok(total)
    }
}

/// A fixed UTC time of day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DailySchedule {
    time: NaiveTime,
}

impl Default for DailySchedule {
    /// Midnight UTC.
    fn default() -> Self {
        Self {
            time: NaiveTime::MIN,
        }
    }
}

impl DailySchedule {
    pub fn at(hour: u32, minute: u32) -> DomainResult<Self> {
        NaiveTime::from_hms_opt(hour, minute, 0)
            .map(|time| Self { time })
            .ok_or_else(|| DomainError::validation(format!("invalid time of day {hour:02}:{minute:02}")))
    }

    /// First occurrence strictly after `now`.
    pub fn next_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let today = now.date_naive().and_time(self.time).and_utc();
        if today > now {
            today
        } else {
            today + chrono::Duration::days(1)
        }
    }
}

/// Handle to a running daily trigger.
#[derive(Debug)]
pub struct TriggerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl TriggerHandle {
    /// Stop the trigger and wait for its thread to exit.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

/// Fires a task once per day at a fixed UTC time, on its own thread.
#[derive(Debug)]
pub struct DailyTrigger {
    schedule: DailySchedule,
    clock: Arc<dyn Clock>,
    name: String,
    max_sleep: Duration,
}

impl DailyTrigger {
    pub fn new(schedule: DailySchedule, clock: Arc<dyn Clock>) -> Self {
        Self {
            schedule,
            clock,
            name: "retrier-daily".to_string(),
            max_sleep: MAX_TRIGGER_SLEEP,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Upper bound on how long the thread sleeps before re-reading the clock.
    pub fn with_max_sleep(mut self, max_sleep: Duration) -> Self {
        self.max_sleep = max_sleep;
        self
    }

    pub fn spawn<F>(self, mut task: F) -> std::io::Result<TriggerHandle>
    where
        F: FnMut() + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let join = thread::Builder::new().name(self.name.clone()).spawn(move || {
            let mut next = self.schedule.next_after(self.clock.now());
            info!(trigger = %self.name, next = %next, "daily trigger started");

            loop {
                let now = self.clock.now();
                if now >= next {
                    task();
                    next = self.schedule.next_after(now);
                    debug!(trigger = %self.name, next = %next, "daily trigger fired");
                    continue;
                }

                let wait = (next - now)
                    .to_std()
                    .unwrap_or(Duration::ZERO)
                    .min(self.max_sleep);
                match shutdown_rx.recv_timeout(wait) {
                    Err(mpsc::RecvTimeoutError::Timeout) => continue,
                    Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                }
            }

            info!(trigger = %self.name, "daily trigger stopped");
        })?;

        Ok(TriggerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
        })
    }
}

/// Run `sweeper.sweep_all()` every day at `schedule`.
pub fn spawn_daily_sweep<S>(
    sweeper: ExpirySweeper<S>,
    schedule: DailySchedule,
) -> std::io::Result<TriggerHandle>
where
    S: RunStore + 'static,
{
    let clock = sweeper.clock.clone();
    DailyTrigger::new(schedule, clock)
        .with_name("retrier-expiry-sweeper")
        .spawn(move || {
            if let Err(e) = sweeper.sweep_all() {
                error!(error = %e, "expiry sweep failed");
            }
        })
}
