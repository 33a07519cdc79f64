//! Infrastructure layer: run storage, the retry loop, and the job scheduler.

pub mod runs;
pub mod scheduler;


pub use runs::{
    ExpirySweeper, InMemoryRunStore, PostgresRunStore, Retrier, RetrierError, RetryController,
    RetryOptions, RetryOptionsPatch, Run, RunResult, RunStatus, RunStore, RunStoreError,
};
pub use scheduler::{
    FunctionRef, InMemoryJobScheduler, JobScheduler, JobState, JobStatusProvider,
    SchedulerError, SchedulerWorker, WorkerConfig,
};
