//! Service wiring: run store, scheduler, worker, and the daily sweeper.

use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use tracing::info;

use retrier_core::{Clock, SystemClock};
use retrier_infra::runs::{
    spawn_daily_sweep, ExpirySweeper, InMemoryRunStore, PostgresRunStore, Retrier, RunStore,
    TriggerHandle,
};
use retrier_infra::scheduler::{
    InMemoryJobScheduler, SchedulerWorker, WorkerConfig, WorkerHandle, WorkerStatsView,
};

use crate::actions;
use crate::config::AppConfig;

pub type ApiRetrier = Retrier<Arc<dyn RunStore>, Arc<InMemoryJobScheduler>>;

/// Shared state handed to every handler.
#[derive(Debug)]
pub struct AppServices {
    pub retrier: ApiRetrier,
    pub scheduler: Arc<InMemoryJobScheduler>,
    pub worker: WorkerStatsView,
    /// `"postgres"` or `"in_memory"`
    pub store_kind: &'static str,
    pub started_at: DateTime<Utc>,
}

/// Services plus the background threads that drive them.
#[derive(Debug)]
pub struct AppRuntime {
    pub services: Arc<AppServices>,
    worker: WorkerHandle,
    sweeper: TriggerHandle,
}

impl AppRuntime {
    /// Build the store, start the worker and the daily sweeper.
    ///
    /// Must be called inside a tokio runtime: the Postgres store blocks on it.
    pub async fn start(config: &AppConfig) -> anyhow::Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let (store, store_kind): (Arc<dyn RunStore>, &'static str) = match &config.database_url {
            Some(url) => {
                let store = PostgresRunStore::connect(url)
                    .await
                    .context("failed to connect to the run database")?;
                (Arc::new(store), "postgres")
            }
            None => (Arc::new(InMemoryRunStore::new()), "in_memory"),
        };

        let scheduler = Arc::new(
            InMemoryJobScheduler::new(clock.clone()).with_retention(config.job_retention),
        );
        let retrier = Retrier::new(store.clone(), scheduler.clone(), clock.clone())
            .with_defaults(config.defaults.clone());

        // Jobs from a previous process are gone; give its open runs new ones.
        let resuming = retrier.clone();
        tokio::task::spawn_blocking(move || resuming.resume_incomplete())
            .await
            .context("resume task panicked")?
            .context("failed to resume open runs")?;

        let mut worker = SchedulerWorker::new(scheduler.clone());
        retrier.register(&mut worker);
        actions::register(&mut worker);
        let worker = worker
            .spawn(WorkerConfig::default().with_poll_interval(config.worker_poll_interval))
            .context("failed to spawn scheduler worker")?;

        let sweeper = ExpirySweeper::new(store, clock.clone())
            .with_retention(config.retention)
            .with_batch_size(config.sweep_batch_size);
        let sweeper = spawn_daily_sweep(sweeper, config.sweep_schedule)
            .context("failed to spawn expiry sweeper")?;

        info!(store = store_kind, "retrier services started");

        Ok(Self {
            services: Arc::new(AppServices {
                retrier,
                scheduler,
                worker: worker.stats_view(),
                store_kind,
                started_at: clock.now(),
            }),
            worker,
            sweeper,
        })
    }

    /// Stop background threads. Blocks until they exit.
    pub fn shutdown(self) {
        self.sweeper.shutdown();
        self.worker.shutdown();
        info!("retrier services stopped");
    }
}
