//! Versioned records and optimistic concurrency.

/// A durable record with identity and a monotonically increasing version.
///
/// Every committed write bumps the version by one. Writers state the version
/// they read (`ExpectedVersion::Exact`) so that two writers racing on the same
/// record cannot both commit.
pub trait AggregateRoot {
    /// Strongly-typed identifier.
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    /// Returns the record identifier.
    fn id(&self) -> &Self::Id;

    /// Version of the last committed state.
    fn version(&self) -> u64;
}

/// Optimistic concurrency expectation for a write.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// Skip version checking.
    Any,
    /// Require the record to be at an exact version.
    Exact(u64),
}

impl ExpectedVersion {
    pub fn matches(self, actual: u64) -> bool {
        match self {
            ExpectedVersion::Any => true,
            ExpectedVersion::Exact(v) => v == actual,
        }
    }
}
