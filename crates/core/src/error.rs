//! Errors raised by pure value checks.

use thiserror::Error;

pub type DomainResult<T> = Result<T, DomainError>;

/// A value was rejected before anything was stored or scheduled.
///
/// Storage and scheduler failures have their own error types in `retrier-infra`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Malformed options, schedules, or other caller input.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}
