//! Durable retry runs.
//!
//! A run wraps one action and retries it until it succeeds, runs out of
//! failure budget, or is canceled. Progress is driven entirely by scheduled
//! check jobs; nothing blocks while an attempt is in flight.
//!
//! ## Components
//!
//! - `backoff`: jitter and growth of retry / wait delays
//! - `types`: `Run`, `RetryOptions`, results and statuses
//! - `store`: `RunStore` boundary + in-memory store; `postgres` for durability
//! - `controller`: the per-step state machine (`retrier.check_run`)
//! - `service`: `Retrier`, the caller-facing start/status/cancel/cleanup API
//! - `sweeper`: retention-based deletion and its daily trigger

pub mod backoff;
pub mod controller;
pub mod error;
pub mod log;
pub mod postgres;
pub mod service;
pub mod store;
pub mod sweeper;
pub mod types;

pub use backoff::BackoffState;
pub use controller::{CheckArgs, RetryController, StepOutcome, CHECK_FUNCTION, MISSING_JOB_ERROR};
pub use error::{RetrierError, RetrierResult};
pub use postgres::PostgresRunStore;
pub use service::{ResumeReport, Retrier};
pub use store::{InMemoryRunStore, RunStats, RunStore, RunStoreError};
pub use sweeper::{spawn_daily_sweep, DailySchedule, DailyTrigger, ExpirySweeper, SweepReport, TriggerHandle};
pub use types::{LogLevel, RetryOptions, RetryOptionsPatch, Run, RunResult, RunState, RunStatus};
