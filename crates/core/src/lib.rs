//! `retrier-core`: foundation building blocks for the retry orchestrator.
//!
//! This crate contains **pure** primitives (no storage or scheduling concerns).

pub mod aggregate;
pub mod clock;
pub mod error;
pub mod id;

pub use aggregate::{AggregateRoot, ExpectedVersion};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{DomainError, DomainResult};
pub use id::{JobRef, RunId};
