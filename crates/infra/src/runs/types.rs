//! Run record and retry options.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use retrier_core::{AggregateRoot, DomainError, DomainResult, ExpectedVersion, JobRef, RunId};

use super::backoff::BackoffState;
use crate::scheduler::FunctionRef;

pub const DEFAULT_INITIAL_BACKOFF_MS: f64 = 100.0;
pub const DEFAULT_WAIT_BACKOFF_MS: f64 = 100.0;
pub const DEFAULT_BASE: f64 = 2.0;
pub const DEFAULT_MAX_FAILURES: u32 = 16;

/// Verbosity floor for a run's log output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl core::str::FromStr for LogLevel {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DEBUG" => Ok(Self::Debug),
            "INFO" => Ok(Self::Info),
            "WARN" | "WARNING" => Ok(Self::Warn),
            "ERROR" => Ok(Self::Error),
            other => Err(DomainError::validation(format!("unknown log level: {other}"))),
        }
    }
}

/// Per-run retry configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryOptions {
    /// Delay before the first retry after a failure (ms)
    pub initial_backoff_ms: f64,
    /// Delay before the first status check of a running attempt (ms)
    pub wait_backoff_ms: f64,
    /// Growth factor of the retry delay after each failure
    pub base: f64,
    /// Number of failures tolerated before giving up
    pub max_failures: u32,
    /// Log verbosity floor for this run
    pub log_level: LogLevel,
    /// Function invoked with `{run_id, result}` once the run completes
    pub on_complete: Option<FunctionRef>,
    /// Delay before the first attempt
    pub run_after: Option<Duration>,
    /// Instant of the first attempt
    pub run_at: Option<DateTime<Utc>>,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            initial_backoff_ms: DEFAULT_INITIAL_BACKOFF_MS,
            wait_backoff_ms: DEFAULT_WAIT_BACKOFF_MS,
            base: DEFAULT_BASE,
            max_failures: DEFAULT_MAX_FAILURES,
            log_level: LogLevel::default(),
            on_complete: None,
            run_after: None,
            run_at: None,
        }
    }
}

impl RetryOptions {
    pub fn with_initial_backoff_ms(mut self, ms: f64) -> Self {
        self.initial_backoff_ms = ms;
        self
    }

    pub fn with_wait_backoff_ms(mut self, ms: f64) -> Self {
        self.wait_backoff_ms = ms;
        self
    }

    pub fn with_base(mut self, base: f64) -> Self {
        self.base = base;
        self
    }

    pub fn with_max_failures(mut self, max_failures: u32) -> Self {
        self.max_failures = max_failures;
        self
    }

    pub fn with_log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }

    pub fn on_complete(mut self, function: FunctionRef) -> Self {
        self.on_complete = Some(function);
        self
    }

    pub fn run_after(mut self, delay: Duration) -> Self {
        self.run_after = Some(delay);
        self
    }

    pub fn run_at(mut self, at: DateTime<Utc>) -> Self {
        self.run_at = Some(at);
        self
    }

    /// Reject options that would make the retry loop misbehave.
    ///
    /// `base <= 1` is accepted (constant or shrinking backoff).
    pub fn validate(&self) -> DomainResult<()> {
        let non_negative = [
            ("initial_backoff_ms", self.initial_backoff_ms),
            ("wait_backoff_ms", self.wait_backoff_ms),
            ("base", self.base),
        ];
        for (name, value) in non_negative {
            if !value.is_finite() || value < 0.0 {
                return Err(DomainError::validation(format!(
                    "{name} must be a finite, non-negative number (got {value})"
                )));
            }
        }

        if self.run_after.is_some() && self.run_at.is_some() {
            return Err(DomainError::validation(
                "run_after and run_at are mutually exclusive",
            ));
        }

        Ok(())
    }

    /// Delay before the first attempt, as seen from `now`.
    ///
    /// A `run_at` in the past means "run immediately".
    pub fn initial_delay(&self, now: DateTime<Utc>) -> Duration {
        match (self.run_after, self.run_at) {
            (Some(delay), _) => delay,
            (None, Some(at)) => (at - now).to_std().unwrap_or(Duration::ZERO),
            (None, None) => Duration::ZERO,
        }
    }
}

/// Partial options merged over configured defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryOptionsPatch {
    pub initial_backoff_ms: Option<f64>,
    pub wait_backoff_ms: Option<f64>,
    pub base: Option<f64>,
    pub max_failures: Option<u32>,
    pub log_level: Option<LogLevel>,
    pub on_complete: Option<FunctionRef>,
    pub run_after_ms: Option<u64>,
    pub run_at: Option<DateTime<Utc>>,
}

impl RetryOptionsPatch {
    /// Fill every unset field from `defaults`.
    pub fn apply_to(self, defaults: &RetryOptions) -> RetryOptions {
        RetryOptions {
            initial_backoff_ms: self.initial_backoff_ms.unwrap_or(defaults.initial_backoff_ms),
            wait_backoff_ms: self.wait_backoff_ms.unwrap_or(defaults.wait_backoff_ms),
            base: self.base.unwrap_or(defaults.base),
            max_failures: self.max_failures.unwrap_or(defaults.max_failures),
            log_level: self.log_level.unwrap_or(defaults.log_level),
            on_complete: self.on_complete.or_else(|| defaults.on_complete.clone()),
            run_after: self
                .run_after_ms
                .map(Duration::from_millis)
                .or(defaults.run_after),
            run_at: self.run_at.or(defaults.run_at),
        }
    }
}

/// Lifecycle state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Created, first attempt not yet scheduled
    Pending,
    /// An attempt or a retry is in flight
    InProgress,
    /// Terminal; `result` is set
    Completed,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Pending => "pending",
            RunState::InProgress => "in_progress",
            RunState::Completed => "completed",
        }
    }
}

/// Terminal outcome of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunResult {
    Success { return_value: JsonValue },
    Failed { error: String },
    Canceled,
}

impl RunResult {
    pub fn success(value: JsonValue) -> Self {
        Self::Success { return_value: value }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self::Failed { error: error.into() }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RunResult::Success { .. } => "success",
            RunResult::Failed { .. } => "failed",
            RunResult::Canceled => "canceled",
        }
    }
}

/// Caller-facing view of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunStatus {
    InProgress,
    Completed { result: RunResult },
}

/// Durable state of one retry lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub state: RunState,
    pub result: Option<RunResult>,
    /// The in-flight action attempt
    pub current_job: Option<JobRef>,
    /// The next scheduled status check
    pub check_job: Option<JobRef>,
    pub action: FunctionRef,
    pub args: JsonValue,
    pub options: RetryOptions,
    pub backoff: BackoffState,
    /// Number of action attempts scheduled so far
    pub attempts: u32,
    /// Set by `cancel`; a failed attempt is then finalized instead of retried
    pub cancel_requested: bool,
    /// Bumped by the store on every committed write
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Run {
    /// Create a pending run. The store assigns version 1 on insert.
    pub fn new(
        action: FunctionRef,
        args: JsonValue,
        options: RetryOptions,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: RunId::new(),
            state: RunState::Pending,
            result: None,
            current_job: None,
            check_job: None,
            action,
            args,
            backoff: BackoffState::from_options(&options),
            options,
            attempts: 0,
            cancel_requested: false,
            version: 0,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.state == RunState::Completed
    }

    /// Expectation that guards a write based on this snapshot.
    pub fn expected_version(&self) -> ExpectedVersion {
        ExpectedVersion::Exact(self.version)
    }

    pub fn status(&self) -> RunStatus {
        match (&self.state, &self.result) {
            (RunState::Completed, Some(result)) => RunStatus::Completed {
                result: result.clone(),
            },
            _ => RunStatus::InProgress,
        }
    }

    /// Record the first attempt and its check; the run is now in progress.
    pub fn mark_in_progress(&mut self, attempt: JobRef, check: JobRef, now: DateTime<Utc>) {
        self.state = RunState::InProgress;
        self.current_job = Some(attempt);
        self.check_job = Some(check);
        self.attempts += 1;
        self.updated_at = now;
    }

    /// Set the terminal result.
    ///
    /// Returns `false` (and changes nothing) if the run already completed.
    pub fn complete(&mut self, result: RunResult, now: DateTime<Utc>) -> bool {
        if self.is_completed() {
            return false;
        }
        self.state = RunState::Completed;
        self.result = Some(result);
        self.check_job = None;
        self.completed_at = Some(now);
        self.updated_at = now;
        true
    }
}

impl AggregateRoot for Run {
    type Id = RunId;

    fn id(&self) -> &RunId {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}
