//! Run store boundary and the in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use retrier_core::{AggregateRoot, ExpectedVersion, RunId};

use super::types::{Run, RunResult, RunState};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RunStoreError {
    #[error("run not found: {0}")]
    NotFound(RunId),

    #[error("run already exists: {0}")]
    AlreadyExists(RunId),

    #[error("version conflict: expected {expected:?}, actual {actual}")]
    Conflict {
        expected: ExpectedVersion,
        actual: u64,
    },

    #[error("storage error: {0}")]
    Storage(String),
}

/// Counts by state and outcome.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunStats {
    pub total: u64,
    pub pending: u64,
    pub in_progress: u64,
    pub completed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub canceled: u64,
}

impl RunStats {
    fn record(&mut self, run: &Run) {
        self.total += 1;
        match run.state {
            RunState::Pending => self.pending += 1,
            RunState::InProgress => self.in_progress += 1,
            RunState::Completed => self.completed += 1,
        }
        match run.result {
            Some(RunResult::Success { .. }) => self.succeeded += 1,
            Some(RunResult::Failed { .. }) => self.failed += 1,
            Some(RunResult::Canceled) => self.canceled += 1,
            None => {}
        }
    }

    pub fn from_runs<'a>(runs: impl IntoIterator<Item = &'a Run>) -> Self {
        let mut stats = Self::default();
        for run in runs {
            stats.record(run);
        }
        stats
    }
}

/// Durable storage for run records.
///
/// Every write replaces the whole record and bumps `version` by one; readers
/// only ever observe committed records.
pub trait RunStore: Send + Sync + core::fmt::Debug {
    /// Insert a new run. The stored copy is returned at version 1.
    fn insert(&self, run: Run) -> Result<Run, RunStoreError>;

    fn get(&self, id: RunId) -> Result<Option<Run>, RunStoreError>;

    /// Replace a run if its stored version matches `expected`.
    fn update(&self, run: Run, expected: ExpectedVersion) -> Result<Run, RunStoreError>;

    /// Delete a run if its stored version matches `expected`.
    fn delete(&self, id: RunId, expected: ExpectedVersion) -> Result<(), RunStoreError>;

    /// Completed runs finished strictly before `completed_before`, oldest first.
    fn list_expired(
        &self,
        completed_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Run>, RunStoreError>;

    /// Runs that have not completed, ordered by id, starting strictly after `after`.
    fn list_incomplete(
        &self,
        after: Option<RunId>,
        limit: usize,
    ) -> Result<Vec<Run>, RunStoreError>;

    fn stats(&self) -> Result<RunStats, RunStoreError>;
}

impl<T: RunStore + ?Sized> RunStore for Arc<T> {
    fn insert(&self, run: Run) -> Result<Run, RunStoreError> {
        (**self).insert(run)
    }

    fn get(&self, id: RunId) -> Result<Option<Run>, RunStoreError> {
        (**self).get(id)
    }

    fn update(&self, run: Run, expected: ExpectedVersion) -> Result<Run, RunStoreError> {
        (**self).update(run, expected)
    }

    fn delete(&self, id: RunId, expected: ExpectedVersion) -> Result<(), RunStoreError> {
        (**self).delete(id, expected)
    }

    fn list_expired(
        &self,
        completed_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Run>, RunStoreError> {
        (**self).list_expired(completed_before, limit)
    }

    fn list_incomplete(
        &self,
        after: Option<RunId>,
        limit: usize,
    ) -> Result<Vec<Run>, RunStoreError> {
        (**self).list_incomplete(after, limit)
    }

    fn stats(&self) -> Result<RunStats, RunStoreError> {
        (**self).stats()
    }
}

/// In-memory run store.
///
/// Intended for tests/dev. Not optimized for performance.
#[derive(Debug, Default)]
pub struct InMemoryRunStore {
    runs: RwLock<HashMap<RunId, Run>>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.runs.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn check_version<R: AggregateRoot>(stored: &R, expected: ExpectedVersion) -> Result<(), RunStoreError> {
    if expected.matches(stored.version()) {
        Ok(())
    } else {
        Err(RunStoreError::Conflict {
            expected,
            actual: stored.version(),
        })
    }
}

fn poisoned() -> RunStoreError {
    RunStoreError::Storage("lock poisoned".to_string())
}

impl RunStore for InMemoryRunStore {
    fn insert(&self, mut run: Run) -> Result<Run, RunStoreError> {
        let mut runs = self.runs.write().map_err(|_| poisoned())?;
        if runs.contains_key(&run.id) {
            return Err(RunStoreError::AlreadyExists(run.id));
        }
        run.version = 1;
        runs.insert(run.id, run.clone());
        Ok(run)
    }

    fn get(&self, id: RunId) -> Result<Option<Run>, RunStoreError> {
        let runs = self.runs.read().map_err(|_| poisoned())?;
        Ok(runs.get(&id).cloned())
    }

    fn update(&self, mut run: Run, expected: ExpectedVersion) -> Result<Run, RunStoreError> {
        let mut runs = self.runs.write().map_err(|_| poisoned())?;
        let stored = runs.get_mut(&run.id).ok_or(RunStoreError::NotFound(run.id))?;
        check_version(&*stored, expected)?;

        run.version = stored.version + 1;
        *stored = run.clone();
        Ok(run)
    }

    fn delete(&self, id: RunId, expected: ExpectedVersion) -> Result<(), RunStoreError> {
        let mut runs = self.runs.write().map_err(|_| poisoned())?;
        let stored = runs.get(&id).ok_or(RunStoreError::NotFound(id))?;
        check_version(stored, expected)?;

        runs.remove(&id);
        Ok(())
    }

    fn list_expired(
        &self,
        completed_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Run>, RunStoreError> {
        let runs = self.runs.read().map_err(|_| poisoned())?;
        let mut expired: Vec<Run> = runs
            .values()
            .filter(|r| r.is_completed())
            .filter(|r| r.completed_at.is_some_and(|at| at < completed_before))
            .cloned()
            .collect();
        expired.sort_by_key(|r| (r.completed_at, r.id));
        expired.truncate(limit);
        Ok(expired)
    }

    fn list_incomplete(
        &self,
        after: Option<RunId>,
        limit: usize,
    ) -> Result<Vec<Run>, RunStoreError> {
        let runs = self.runs.read().map_err(|_| poisoned())?;
        let mut open: Vec<Run> = runs
            .values()
            .filter(|r| !r.is_completed())
            .filter(|r| after.is_none_or(|a| r.id > a))
            .cloned()
            .collect();
        open.sort_by_key(|r| r.id);
        open.truncate(limit);
        Ok(open)
    }

    fn stats(&self) -> Result<RunStats, RunStoreError> {
        let runs = self.runs.read().map_err(|_| poisoned())?;
        Ok(RunStats::from_runs(runs.values()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runs::types::{RetryOptions, RunResult};
    use crate::scheduler::FunctionRef;

    fn run_at(now: DateTime<Utc>) -> Run {
        Run::new(
            FunctionRef::new("test.action"),
            serde_json::json!({}),
            RetryOptions::default(),
            now,
        )
    }

    #[test]
    fn insert_assigns_version_one_and_rejects_duplicates() {
        let store = InMemoryRunStore::new();
        let run = run_at(Utc::now());
        let stored = store.insert(run.clone()).unwrap();
        assert_eq!(stored.version, 1);
        assert_eq!(store.get(run.id).unwrap().unwrap().version, 1);
        assert_eq!(
            store.insert(run.clone()),
            Err(RunStoreError::AlreadyExists(run.id))
        );
    }

    #[test]
    fn update_enforces_expected_version() {
        let store = InMemoryRunStore::new();
        let stored = store.insert(run_at(Utc::now())).unwrap();

        let mut first = stored.clone();
        first.attempts = 1;
        let first = store.update(first, stored.expected_version()).unwrap();
        assert_eq!(first.version, 2);

        // A writer holding the stale snapshot loses.
        let mut stale = stored.clone();
        stale.attempts = 7;
        assert_eq!(
            store.update(stale, stored.expected_version()),
            Err(RunStoreError::Conflict {
                expected: ExpectedVersion::Exact(1),
                actual: 2
            })
        );
        assert_eq!(store.get(stored.id).unwrap().unwrap().attempts, 1);
    }

    #[test]
    fn delete_unknown_run_is_not_found() {
        let store = InMemoryRunStore::new();
        let id = RunId::new();
        assert_eq!(
            store.delete(id, ExpectedVersion::Any),
            Err(RunStoreError::NotFound(id))
        );
    }

    #[test]
    fn list_expired_returns_oldest_completed_first() {
        let store = InMemoryRunStore::new();
        let base = Utc::now();

        let mut ids = Vec::new();
        for minutes in [30, 10, 20] {
            let mut run = run_at(base);
            run.complete(RunResult::Canceled, base + chrono::Duration::minutes(minutes));
            ids.push((minutes, store.insert(run).unwrap().id));
        }
        store.insert(run_at(base)).unwrap();

        let cutoff = base + chrono::Duration::minutes(25);
        let expired = store.list_expired(cutoff, 10).unwrap();
        let expired_ids: Vec<RunId> = expired.iter().map(|r| r.id).collect();
        assert_eq!(expired_ids, vec![ids[1].1, ids[2].1]);

        assert_eq!(store.list_expired(cutoff, 1).unwrap().len(), 1);
    }

    #[test]
    fn list_incomplete_pages_by_id() {
        let store = InMemoryRunStore::new();
        let now = Utc::now();

        let mut open = Vec::new();
        for _ in 0..3 {
            open.push(store.insert(run_at(now)).unwrap().id);
        }
        let mut done = run_at(now);
        done.complete(RunResult::Canceled, now);
        store.insert(done).unwrap();
        open.sort();

        let first = store.list_incomplete(None, 2).unwrap();
        assert_eq!(first.iter().map(|r| r.id).collect::<Vec<_>>(), open[..2]);

        let rest = store.list_incomplete(Some(first[1].id), 2).unwrap();
        assert_eq!(rest.iter().map(|r| r.id).collect::<Vec<_>>(), open[2..]);
    }

    #[test]
    fn stats_count_states_and_outcomes() {
        let store = InMemoryRunStore::new();
        let now = Utc::now();
        store.insert(run_at(now)).unwrap();

        let mut done = run_at(now);
        done.complete(RunResult::failed("boom"), now);
        store.insert(done).unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 1);
    }
}
