//! Per-run log floor.
//!
//! Each run carries a `LogLevel`; messages below it are dropped before they
//! reach `tracing`. The subscriber's own filter still applies on top.

use retrier_core::RunId;
use tracing::{debug, error, info, warn};

use super::types::LogLevel;

#[derive(Debug, Clone, Copy)]
pub struct RunLog {
    run_id: RunId,
    floor: LogLevel,
}

impl RunLog {
    pub fn new(run_id: RunId, floor: LogLevel) -> Self {
        Self { run_id, floor }
    }

    pub fn enabled(&self, level: LogLevel) -> bool {
        level >= self.floor
    }

    pub fn debug(&self, message: &str) {
        if self.enabled(LogLevel::Debug) {
            debug!(run_id = %self.run_id, "{message}");
        }
    }

    pub fn info(&self, message: &str) {
        if self.enabled(LogLevel::Info) {
            info!(run_id = %self.run_id, "{message}");
        }
    }

    pub fn warn(&self, message: &str) {
        if self.enabled(LogLevel::Warn) {
            warn!(run_id = %self.run_id, "{message}");
        }
    }

    /// Always emitted, whatever the floor.
    pub fn error(&self, message: &str) {
        error!(run_id = %self.run_id, "{message}");
    }
}
