//! Postgres-backed run store.
//!
//! Each run is one row in `retrier_runs`: the full record as JSONB plus the
//! columns the store filters on (`state`, `completed_at`) and the optimistic
//! concurrency `version`. Writes are single `UPDATE ... WHERE version = $n`
//! statements, so a stale writer matches zero rows and gets `Conflict`.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | RunStoreError |
//! |------------|----------------------|---------------|
//! | (insert hits an existing `run_id`) | N/A | `AlreadyExists` |
//! | (guarded write matches no row) | N/A | `Conflict` or `NotFound` |
//! | Database | Any | `Storage` |
//! | PoolClosed | N/A | `Storage` |
//! | Other | N/A | `Storage` |
//!
//! ## Runtime
//!
//! `RunStore` is synchronous. The store keeps a `tokio::runtime::Handle` and
//! blocks on it, so it must be called from a thread that is not driving that
//! runtime (the scheduler worker thread, or `spawn_blocking` from handlers).

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tokio::runtime::Handle;
use tracing::instrument;

use retrier_core::{ExpectedVersion, RunId};

use super::store::{RunStats, RunStore, RunStoreError};
use super::types::Run;

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS retrier_runs (
    run_id       UUID PRIMARY KEY,
    state        TEXT NOT NULL,
    version      BIGINT NOT NULL,
    record       JSONB NOT NULL,
    created_at   TIMESTAMPTZ NOT NULL,
    updated_at   TIMESTAMPTZ NOT NULL,
    completed_at TIMESTAMPTZ NULL
)
"#;

const CREATE_EXPIRY_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS retrier_runs_expiry_idx
    ON retrier_runs (completed_at)
    WHERE state = 'completed'
"#;

#[derive(Debug, Clone)]
pub struct PostgresRunStore {
    pool: PgPool,
    handle: Handle,
}

impl PostgresRunStore {
    pub fn new(pool: PgPool, handle: Handle) -> Self {
        Self { pool, handle }
    }

    /// Connect and create the schema if it does not exist yet.
    pub async fn connect(database_url: &str) -> Result<Self, RunStoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        let store = Self::new(pool, Handle::current());
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<(), RunStoreError> {
        for statement in [CREATE_TABLE, CREATE_EXPIRY_INDEX] {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("migrate", e))?;
        }
        Ok(())
    }

    #[instrument(skip(self, run), fields(run_id = %run.id), err)]
    pub async fn insert_run(&self, mut run: Run) -> Result<Run, RunStoreError> {
        run.version = 1;
        let record = encode(&run)?;

        let result = sqlx::query(
            r#"
            INSERT INTO retrier_runs
                (run_id, state, version, record, created_at, updated_at, completed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (run_id) DO NOTHING
            "#,
        )
        .bind(run.id.as_uuid())
        .bind(run.state.as_str())
        .bind(run.version as i64)
        .bind(record)
        .bind(run.created_at)
        .bind(run.updated_at)
        .bind(run.completed_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert", e))?;

        if result.rows_affected() == 0 {
            return Err(RunStoreError::AlreadyExists(run.id));
        }
        Ok(run)
    }

    pub async fn get_run(&self, id: RunId) -> Result<Option<Run>, RunStoreError> {
        let row = sqlx::query("SELECT record, version FROM retrier_runs WHERE run_id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.map(|r| decode_row(&r)).transpose()
    }

    #[instrument(skip(self, run), fields(run_id = %run.id, expected = ?expected), err)]
    pub async fn update_run(
        &self,
        mut run: Run,
        expected: ExpectedVersion,
    ) -> Result<Run, RunStoreError> {
        let expected_version = expected_param(expected);
        // The `version` column is authoritative; the copy inside `record` is ignored on read.
        let record = encode(&run)?;

        let row = sqlx::query(
            r#"
            UPDATE retrier_runs
            SET record = $2,
                state = $3,
                version = version + 1,
                updated_at = $4,
                completed_at = $5
            WHERE run_id = $1
              AND ($6::BIGINT IS NULL OR version = $6)
            RETURNING version
            "#,
        )
        .bind(run.id.as_uuid())
        .bind(record)
        .bind(run.state.as_str())
        .bind(run.updated_at)
        .bind(run.completed_at)
        .bind(expected_version)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("update", e))?;

        match row {
            Some(row) => {
                let version: i64 = row
                    .try_get("version")
                    .map_err(|e| map_sqlx_error("update", e))?;
                run.version = version as u64;
                Ok(run)
            }
            None => Err(self.write_rejected(run.id, expected).await),
        }
    }

    #[instrument(skip(self), fields(run_id = %id, expected = ?expected), err)]
    pub async fn delete_run(&self, id: RunId, expected: ExpectedVersion) -> Result<(), RunStoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM retrier_runs
            WHERE run_id = $1
              AND ($2::BIGINT IS NULL OR version = $2)
            "#,
        )
        .bind(id.as_uuid())
        .bind(expected_param(expected))
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("delete", e))?;

        if result.rows_affected() == 0 {
            return Err(self.write_rejected(id, expected).await);
        }
        Ok(())
    }

    pub async fn list_expired_runs(
        &self,
        completed_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Run>, RunStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT record, version
            FROM retrier_runs
            WHERE state = 'completed' AND completed_at < $1
            ORDER BY completed_at ASC, run_id ASC
            LIMIT $2
            "#,
        )
        .bind(completed_before)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_expired", e))?;

        rows.iter().map(decode_row).collect()
    }

    pub async fn list_incomplete_runs(
        &self,
        after: Option<RunId>,
        limit: usize,
    ) -> Result<Vec<Run>, RunStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT record, version
            FROM retrier_runs
            WHERE state <> 'completed' AND ($1::UUID IS NULL OR run_id > $1)
            ORDER BY run_id ASC
            LIMIT $2
            "#,
        )
        .bind(after.map(|id| *id.as_uuid()))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_incomplete", e))?;

        rows.iter().map(decode_row).collect()
    }

    pub async fn run_stats(&self) -> Result<RunStats, RunStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT state, record->'result'->>'type' AS outcome, COUNT(*) AS n
            FROM retrier_runs
            GROUP BY 1, 2
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = RunStats::default();
        for row in rows {
            let state: String = row.try_get("state").map_err(|e| map_sqlx_error("stats", e))?;
            let outcome: Option<String> =
                row.try_get("outcome").map_err(|e| map_sqlx_error("stats", e))?;
            let n: i64 = row.try_get("n").map_err(|e| map_sqlx_error("stats", e))?;
            let n = n as u64;

            stats.total += n;
            match state.as_str() {
                "pending" => stats.pending += n,
                "in_progress" => stats.in_progress += n,
                "completed" => stats.completed += n,
                _ => {}
            }
            match outcome.as_deref() {
                Some("success") => stats.succeeded += n,
                Some("failed") => stats.failed += n,
                Some("canceled") => stats.canceled += n,
                _ => {}
            }
        }
        Ok(stats)
    }

    /// Explain why a guarded write touched no rows.
    async fn write_rejected(&self, id: RunId, expected: ExpectedVersion) -> RunStoreError {
        let current = sqlx::query("SELECT version FROM retrier_runs WHERE run_id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await;

        match current {
            Ok(Some(row)) => match row.try_get::<i64, _>("version") {
                Ok(actual) => RunStoreError::Conflict {
                    expected,
                    actual: actual as u64,
                },
                Err(e) => map_sqlx_error("version", e),
            },
            Ok(None) => RunStoreError::NotFound(id),
            Err(e) => map_sqlx_error("version", e),
        }
    }
}

impl RunStore for PostgresRunStore {
    fn insert(&self, run: Run) -> Result<Run, RunStoreError> {
        self.handle.block_on(self.insert_run(run))
    }

    fn get(&self, id: RunId) -> Result<Option<Run>, RunStoreError> {
        self.handle.block_on(self.get_run(id))
    }

    fn update(&self, run: Run, expected: ExpectedVersion) -> Result<Run, RunStoreError> {
        self.handle.block_on(self.update_run(run, expected))
    }

    fn delete(&self, id: RunId, expected: ExpectedVersion) -> Result<(), RunStoreError> {
        self.handle.block_on(self.delete_run(id, expected))
    }

    fn list_expired(
        &self,
        completed_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Run>, RunStoreError> {
        self.handle
            .block_on(self.list_expired_runs(completed_before, limit))
    }

    fn list_incomplete(
        &self,
        after: Option<RunId>,
        limit: usize,
    ) -> Result<Vec<Run>, RunStoreError> {
        self.handle
            .block_on(self.list_incomplete_runs(after, limit))
    }

    fn stats(&self) -> Result<RunStats, RunStoreError> {
        self.handle.block_on(self.run_stats())
    }
}

fn expected_param(expected: ExpectedVersion) -> Option<i64> {
    match expected {
        ExpectedVersion::Any => None,
        ExpectedVersion::Exact(v) => Some(v as i64),
    }
}

fn encode(run: &Run) -> Result<serde_json::Value, RunStoreError> {
    serde_json::to_value(run)
        .map_err(|e| RunStoreError::Storage(format!("failed to serialize run {}: {e}", run.id)))
}

fn decode_row(row: &sqlx::postgres::PgRow) -> Result<Run, RunStoreError> {
    let record: serde_json::Value = row
        .try_get("record")
        .map_err(|e| map_sqlx_error("decode", e))?;
    let version: i64 = row
        .try_get("version")
        .map_err(|e| map_sqlx_error("decode", e))?;

    let mut run: Run = serde_json::from_value(record)
        .map_err(|e| RunStoreError::Storage(format!("failed to deserialize run record: {e}")))?;
    run.version = version as u64;
    Ok(run)
}

/// Map SQLx errors to RunStoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> RunStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            RunStoreError::Storage(format!("database error in {operation}: {}", db_err.message()))
        }
        sqlx::Error::PoolClosed => {
            RunStoreError::Storage(format!("connection pool closed in {operation}"))
        }
        other => RunStoreError::Storage(format!("sqlx error in {operation}: {other}")),
    }
}
