//! Postgres-backed run store.
//!
//! Persists one row per run and enforces the compare-and-swap contract at the
//! database level: `apply_transition` issues a single conditional `UPDATE`
//! whose `WHERE` clause matches every snapshot field the engine validated
//! against (`IS NOT DISTINCT FROM` for the nullable timestamps). Zero rows
//! affected means the transition was lost to a concurrent actor.
//!
//! ## Error Mapping
//!
//! | sqlx error | RunStoreError | Scenario |
//! |---|---|---|
//! | Database (unique violation, `23505`) | `AlreadyExists` | Duplicate insert |
//! | Any other | `Storage` | Network, pool, constraint, decode failures |

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::instrument;

use runway_core::{ProjectId, RunId, UserId};
use runway_runs::{FieldUpdate, RunRecord, RunSnapshot, RunStatus, Transition};

use super::{RunFilter, RunStats, RunStore, RunStoreError};

/// Table definition for the run store.
///
/// Applied by [`PostgresRunStore::ensure_schema`]; kept here so embedders
/// running their own migration tooling can lift it verbatim.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS background_runs (
    id                uuid PRIMARY KEY,
    project_id        uuid NOT NULL,
    user_id           uuid NOT NULL,
    idempotency_key   text,
    input             jsonb NOT NULL,
    output            jsonb,
    error_message     text,
    created_at        timestamptz NOT NULL,
    updated_at        timestamptz NOT NULL,
    status            text NOT NULL,
    progress          integer NOT NULL,
    attempt_count     integer NOT NULL,
    max_attempts      integer NOT NULL,
    retryable         boolean NOT NULL,
    cancel_requested  boolean NOT NULL,
    started_at        timestamptz,
    finished_at       timestamptz,
    next_retry_at     timestamptz,
    last_heartbeat_at timestamptz
);
CREATE INDEX IF NOT EXISTS background_runs_status_created_at
    ON background_runs (status, created_at);
"#;

const SELECT_COLUMNS: &str = "id, project_id, user_id, idempotency_key, input, output, \
     error_message, created_at, updated_at, status, progress, attempt_count, max_attempts, \
     retryable, cancel_requested, started_at, finished_at, next_retry_at, last_heartbeat_at";

/// Postgres run store.
///
/// Thread-safe: all operations go through the sqlx connection pool. The
/// async methods are the primary API; the sync [`RunStore`] impl bridges via
/// the ambient tokio runtime so the dispatcher and watchdog can stay
/// runtime-agnostic.
#[derive(Debug, Clone)]
pub struct PostgresRunStore {
    pool: Arc<PgPool>,
}

impl PostgresRunStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create the table and indexes if they do not exist.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), RunStoreError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("acquire", e))?;
        for statement in SCHEMA.split(';').filter(|s| !s.trim().is_empty()) {
            sqlx::query(statement)
                .execute(&mut *conn)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        Ok(())
    }

    /// Insert a newly created run row.
    #[instrument(skip(self, run), fields(run_id = %run.id), err)]
    pub async fn insert_run(&self, run: &RunRecord) -> Result<RunId, RunStoreError> {
        sqlx::query(
            r#"
            INSERT INTO background_runs (
                id, project_id, user_id, idempotency_key, input, output, error_message,
                created_at, updated_at, status, progress, attempt_count, max_attempts,
                retryable, cancel_requested, started_at, finished_at, next_retry_at,
                last_heartbeat_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15,
                    $16, $17, $18, $19)
            "#,
        )
        .bind(run.id.as_uuid())
        .bind(run.project_id.as_uuid())
        .bind(run.user_id.as_uuid())
        .bind(run.idempotency_key.as_deref())
        .bind(&run.input)
        .bind(&run.output)
        .bind(run.error_message.as_deref())
        .bind(run.created_at)
        .bind(run.updated_at)
        .bind(run.snapshot.status.as_str())
        .bind(run.snapshot.progress as i32)
        .bind(run.snapshot.attempt_count as i32)
        .bind(run.snapshot.max_attempts as i32)
        .bind(run.snapshot.retryable)
        .bind(run.snapshot.cancel_requested)
        .bind(run.snapshot.started_at)
        .bind(run.snapshot.finished_at)
        .bind(run.snapshot.next_retry_at)
        .bind(run.snapshot.last_heartbeat_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                RunStoreError::AlreadyExists(run.id)
            } else {
                map_sqlx_error("insert_run", e)
            }
        })?;
        Ok(run.id)
    }

    /// Fetch a run by id.
    #[instrument(skip(self), fields(run_id = %run_id), err)]
    pub async fn get_run(&self, run_id: RunId) -> Result<Option<RunRecord>, RunStoreError> {
        let row = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM background_runs WHERE id = $1"
        ))
        .bind(run_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_run", e))?;
        row.map(|r| run_from_row(&r)).transpose()
    }

    /// List runs matching the filter, oldest `created_at` first.
    ///
    /// Optional filters use the `$n IS NULL OR column = $n` shape so a single
    /// parameterized query covers every combination.
    #[instrument(skip(self, filter), err)]
    pub async fn list_runs(
        &self,
        filter: &RunFilter,
        limit: usize,
    ) -> Result<Vec<RunRecord>, RunStoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {SELECT_COLUMNS} FROM background_runs
            WHERE ($1::uuid IS NULL OR id = $1)
              AND ($2::uuid IS NULL OR project_id = $2)
              AND ($3::uuid IS NULL OR user_id = $3)
              AND ($4::text IS NULL OR status = $4)
            ORDER BY created_at ASC
            LIMIT $5
            "#
        ))
        .bind(filter.run_id.map(|id| *id.as_uuid()))
        .bind(filter.project_id.map(|id| *id.as_uuid()))
        .bind(filter.user_id.map(|id| *id.as_uuid()))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_runs", e))?;
        rows.iter().map(run_from_row).collect()
    }

    /// Conditionally apply a transition; `None` means the row no longer holds
    /// the expected snapshot and the transition is lost.
    #[instrument(skip(self, expected, transition), fields(run_id = %run_id, operation = %transition.operation), err)]
    pub async fn apply_transition_cas(
        &self,
        run_id: RunId,
        expected: &RunSnapshot,
        transition: &Transition,
    ) -> Result<Option<RunRecord>, RunStoreError> {
        let after = &transition.after;
        let (output_mode, output_value) = field_update_params(&transition.output);
        let (error_mode, error_value) = field_update_params(&transition.error_message);

        let row = sqlx::query(&format!(
            r#"
            UPDATE background_runs SET
                status = $2, progress = $3, attempt_count = $4, max_attempts = $5,
                retryable = $6, cancel_requested = $7, started_at = $8, finished_at = $9,
                next_retry_at = $10, last_heartbeat_at = $11,
                output = CASE $12 WHEN 'keep' THEN output WHEN 'clear' THEN NULL ELSE $13 END,
                error_message = CASE $14 WHEN 'keep' THEN error_message WHEN 'clear' THEN NULL ELSE $15 END,
                updated_at = $16
            WHERE id = $1
              AND status = $17 AND progress = $18 AND attempt_count = $19
              AND max_attempts = $20 AND retryable = $21 AND cancel_requested = $22
              AND started_at IS NOT DISTINCT FROM $23
              AND finished_at IS NOT DISTINCT FROM $24
              AND next_retry_at IS NOT DISTINCT FROM $25
              AND last_heartbeat_at IS NOT DISTINCT FROM $26
            RETURNING {SELECT_COLUMNS}
            "#
        ))
        .bind(run_id.as_uuid())
        .bind(after.status.as_str())
        .bind(after.progress as i32)
        .bind(after.attempt_count as i32)
        .bind(after.max_attempts as i32)
        .bind(after.retryable)
        .bind(after.cancel_requested)
        .bind(after.started_at)
        .bind(after.finished_at)
        .bind(after.next_retry_at)
        .bind(after.last_heartbeat_at)
        .bind(output_mode)
        .bind(output_value)
        .bind(error_mode)
        .bind(error_value)
        .bind(Utc::now())
        .bind(expected.status.as_str())
        .bind(expected.progress as i32)
        .bind(expected.attempt_count as i32)
        .bind(expected.max_attempts as i32)
        .bind(expected.retryable)
        .bind(expected.cancel_requested)
        .bind(expected.started_at)
        .bind(expected.finished_at)
        .bind(expected.next_retry_at)
        .bind(expected.last_heartbeat_at)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("apply_transition", e))?;
        row.map(|r| run_from_row(&r)).transpose()
    }

    /// Per-status row counts.
    #[instrument(skip(self), err)]
    pub async fn run_stats(&self) -> Result<RunStats, RunStoreError> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS total FROM background_runs GROUP BY status",
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("run_stats", e))?;

        let mut stats = RunStats::default();
        for row in rows {
            let status: String = row
                .try_get("status")
                .map_err(|e| decode_error("status", e))?;
            let total: i64 = row.try_get("total").map_err(|e| decode_error("total", e))?;
            let total = total.max(0) as usize;
            match status.parse::<RunStatus>() {
                Ok(RunStatus::Queued) => stats.queued = total,
                Ok(RunStatus::Running) => stats.running = total,
                Ok(RunStatus::Succeeded) => stats.succeeded = total,
                Ok(RunStatus::Failed) => stats.failed = total,
                Ok(RunStatus::Cancelled) => stats.cancelled = total,
                Err(_) => {
                    return Err(RunStoreError::Storage(format!(
                        "unknown status in background_runs: {status}"
                    )));
                }
            }
        }
        Ok(stats)
    }
}

/// Bridge to the sync [`RunStore`] trait via the ambient tokio runtime.
///
/// Requires being called from within a tokio runtime context, mirroring how
/// the pool itself is used.
impl RunStore for PostgresRunStore {
    fn insert(&self, run: RunRecord) -> Result<RunId, RunStoreError> {
        runtime_handle()?.block_on(self.insert_run(&run))
    }

    fn get(&self, run_id: RunId) -> Result<Option<RunRecord>, RunStoreError> {
        runtime_handle()?.block_on(self.get_run(run_id))
    }

    fn list(&self, filter: &RunFilter, limit: usize) -> Result<Vec<RunRecord>, RunStoreError> {
        runtime_handle()?.block_on(self.list_runs(filter, limit))
    }

    fn apply_transition(
        &self,
        run_id: RunId,
        expected: &RunSnapshot,
        transition: &Transition,
    ) -> Result<Option<RunRecord>, RunStoreError> {
        runtime_handle()?.block_on(self.apply_transition_cas(run_id, expected, transition))
    }

    fn stats(&self) -> Result<RunStats, RunStoreError> {
        runtime_handle()?.block_on(self.run_stats())
    }
}

fn runtime_handle() -> Result<tokio::runtime::Handle, RunStoreError> {
    tokio::runtime::Handle::try_current().map_err(|_| {
        RunStoreError::Storage(
            "PostgresRunStore requires a tokio runtime; call from within a runtime context"
                .to_string(),
        )
    })
}

fn field_update_params<T: Clone>(update: &FieldUpdate<T>) -> (&'static str, Option<T>) {
    match update {
        FieldUpdate::Keep => ("keep", None),
        FieldUpdate::Clear => ("clear", None),
        FieldUpdate::Set(value) => ("set", Some(value.clone())),
    }
}

fn run_from_row(row: &PgRow) -> Result<RunRecord, RunStoreError> {
    let status: String = row.try_get("status").map_err(|e| decode_error("status", e))?;
    let status = status
        .parse::<RunStatus>()
        .map_err(|e| RunStoreError::Storage(e.to_string()))?;

    let progress: i32 = row
        .try_get("progress")
        .map_err(|e| decode_error("progress", e))?;
    let attempt_count: i32 = row
        .try_get("attempt_count")
        .map_err(|e| decode_error("attempt_count", e))?;
    let max_attempts: i32 = row
        .try_get("max_attempts")
        .map_err(|e| decode_error("max_attempts", e))?;

    Ok(RunRecord {
        id: RunId::from_uuid(row.try_get("id").map_err(|e| decode_error("id", e))?),
        project_id: ProjectId::from_uuid(
            row.try_get("project_id")
                .map_err(|e| decode_error("project_id", e))?,
        ),
        user_id: UserId::from_uuid(
            row.try_get("user_id")
                .map_err(|e| decode_error("user_id", e))?,
        ),
        idempotency_key: row
            .try_get("idempotency_key")
            .map_err(|e| decode_error("idempotency_key", e))?,
        input: row.try_get("input").map_err(|e| decode_error("input", e))?,
        output: row.try_get("output").map_err(|e| decode_error("output", e))?,
        error_message: row
            .try_get("error_message")
            .map_err(|e| decode_error("error_message", e))?,
        created_at: row
            .try_get::<DateTime<Utc>, _>("created_at")
            .map_err(|e| decode_error("created_at", e))?,
        updated_at: row
            .try_get::<DateTime<Utc>, _>("updated_at")
            .map_err(|e| decode_error("updated_at", e))?,
        snapshot: RunSnapshot {
            status,
            progress: progress.clamp(0, 100) as u8,
            attempt_count: attempt_count.max(0) as u32,
            max_attempts: max_attempts.max(1) as u32,
            retryable: row
                .try_get("retryable")
                .map_err(|e| decode_error("retryable", e))?,
            cancel_requested: row
                .try_get("cancel_requested")
                .map_err(|e| decode_error("cancel_requested", e))?,
            started_at: row
                .try_get("started_at")
                .map_err(|e| decode_error("started_at", e))?,
            finished_at: row
                .try_get("finished_at")
                .map_err(|e| decode_error("finished_at", e))?,
            next_retry_at: row
                .try_get("next_retry_at")
                .map_err(|e| decode_error("next_retry_at", e))?,
            last_heartbeat_at: row
                .try_get("last_heartbeat_at")
                .map_err(|e| decode_error("last_heartbeat_at", e))?,
        },
    })
}

fn decode_error(column: &str, e: sqlx::Error) -> RunStoreError {
    RunStoreError::Storage(format!("failed to decode column {column}: {e}"))
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(
        e,
        sqlx::Error::Database(db) if db.code().as_deref() == Some("23505")
    )
}

fn map_sqlx_error(operation: &str, e: sqlx::Error) -> RunStoreError {
    RunStoreError::Storage(format!("{operation}: {e}"))
}
