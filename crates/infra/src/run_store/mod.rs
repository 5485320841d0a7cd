//! Durable run storage boundary.
//!
//! The store's one correctness-critical operation is [`RunStore::apply_transition`]:
//! an update conditioned on the row still holding the exact snapshot the
//! Transition Engine validated against (full-snapshot compare-and-swap, not
//! just `status`). That conditional update is the sole mechanism that keeps
//! concurrent dispatcher and watchdog invocations from double-driving a run.

pub mod in_memory;
pub mod postgres;

pub use in_memory::InMemoryRunStore;
pub use postgres::PostgresRunStore;

use std::sync::Arc;

use runway_core::{ProjectId, RunId, UserId};
use runway_runs::{RunRecord, RunSnapshot, RunStatus, Transition};

/// Run store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RunStoreError {
    #[error("run not found: {0}")]
    NotFound(RunId),
    #[error("run already exists: {0}")]
    AlreadyExists(RunId),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Selection predicate for [`RunStore::list`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunFilter {
    pub status: Option<RunStatus>,
    pub run_id: Option<RunId>,
    pub project_id: Option<ProjectId>,
    pub user_id: Option<UserId>,
}

impl RunFilter {
    pub fn with_status(mut self, status: RunStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_run_id(mut self, run_id: Option<RunId>) -> Self {
        self.run_id = run_id;
        self
    }

    pub fn with_project_id(mut self, project_id: Option<ProjectId>) -> Self {
        self.project_id = project_id;
        self
    }

    pub fn with_user_id(mut self, user_id: Option<UserId>) -> Self {
        self.user_id = user_id;
        self
    }

    pub fn matches(&self, run: &RunRecord) -> bool {
        self.status.is_none_or(|s| run.snapshot.status == s)
            && self.run_id.is_none_or(|id| run.id == id)
            && self.project_id.is_none_or(|id| run.project_id == id)
            && self.user_id.is_none_or(|id| run.user_id == id)
    }
}

/// Per-status row counts, for operational visibility.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct RunStats {
    pub queued: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
}

/// Durable storage of run rows.
pub trait RunStore: Send + Sync {
    /// Insert a newly created run row.
    fn insert(&self, run: RunRecord) -> Result<RunId, RunStoreError>;

    /// Fetch a run by id.
    fn get(&self, run_id: RunId) -> Result<Option<RunRecord>, RunStoreError>;

    /// List runs matching the filter, ordered oldest `created_at` first,
    /// truncated to `limit`.
    fn list(&self, filter: &RunFilter, limit: usize) -> Result<Vec<RunRecord>, RunStoreError>;

    /// Apply an engine-computed transition iff the row still holds `expected`.
    ///
    /// Returns the updated row, or `None` when the conditional update matched
    /// nothing: the transition was lost to a concurrent actor (or the row is
    /// gone). Callers must discard a lost transition, never retry it blindly:
    /// re-applying a stale `start` could double-run an executor.
    fn apply_transition(
        &self,
        run_id: RunId,
        expected: &RunSnapshot,
        transition: &Transition,
    ) -> Result<Option<RunRecord>, RunStoreError>;

    /// Per-status row counts.
    fn stats(&self) -> Result<RunStats, RunStoreError>;
}

impl<S> RunStore for Arc<S>
where
    S: RunStore + ?Sized,
{
    fn insert(&self, run: RunRecord) -> Result<RunId, RunStoreError> {
        (**self).insert(run)
    }

    fn get(&self, run_id: RunId) -> Result<Option<RunRecord>, RunStoreError> {
        (**self).get(run_id)
    }

    fn list(&self, filter: &RunFilter, limit: usize) -> Result<Vec<RunRecord>, RunStoreError> {
        (**self).list(filter, limit)
    }

    fn apply_transition(
        &self,
        run_id: RunId,
        expected: &RunSnapshot,
        transition: &Transition,
    ) -> Result<Option<RunRecord>, RunStoreError> {
        (**self).apply_transition(run_id, expected, transition)
    }

    fn stats(&self) -> Result<RunStats, RunStoreError> {
        (**self).stats()
    }
}
