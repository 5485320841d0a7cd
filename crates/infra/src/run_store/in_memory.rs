//! In-memory run store for tests and single-process use.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::Utc;

use runway_core::RunId;
use runway_runs::{RunRecord, RunSnapshot, RunStatus, Transition};

use super::{RunFilter, RunStats, RunStore, RunStoreError};

/// RwLock-backed run store.
///
/// `apply_transition` holds the write lock across the compare and the swap,
/// which gives the same atomicity a relational store provides with a
/// conditional `UPDATE`.
#[derive(Debug, Default)]
pub struct InMemoryRunStore {
    runs: RwLock<HashMap<RunId, RunRecord>>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Overwrite a row unconditionally.
    ///
    /// Test/seeding escape hatch only; production mutation goes through
    /// `apply_transition`.
    pub fn replace(&self, run: RunRecord) {
        self.runs.write().unwrap().insert(run.id, run);
    }
}

impl RunStore for InMemoryRunStore {
    fn insert(&self, run: RunRecord) -> Result<RunId, RunStoreError> {
        let mut runs = self.runs.write().unwrap();
        if runs.contains_key(&run.id) {
            return Err(RunStoreError::AlreadyExists(run.id));
        }
        let id = run.id;
        runs.insert(id, run);
        Ok(id)
    }

    fn get(&self, run_id: RunId) -> Result<Option<RunRecord>, RunStoreError> {
        Ok(self.runs.read().unwrap().get(&run_id).cloned())
    }

    fn list(&self, filter: &RunFilter, limit: usize) -> Result<Vec<RunRecord>, RunStoreError> {
        let runs = self.runs.read().unwrap();
        let mut result: Vec<_> = runs.values().filter(|r| filter.matches(r)).cloned().collect();
        result.sort_by_key(|r| r.created_at);
        result.truncate(limit);
        Ok(result)
    }

    fn apply_transition(
        &self,
        run_id: RunId,
        expected: &RunSnapshot,
        transition: &Transition,
    ) -> Result<Option<RunRecord>, RunStoreError> {
        let mut runs = self.runs.write().unwrap();
        match runs.get_mut(&run_id) {
            Some(run) if run.snapshot == *expected => {
                run.apply(transition, Utc::now());
                Ok(Some(run.clone()))
            }
            // Row changed under us (or is gone): the transition is lost.
            _ => Ok(None),
        }
    }

    fn stats(&self) -> Result<RunStats, RunStoreError> {
        let runs = self.runs.read().unwrap();
        let mut stats = RunStats::default();
        for run in runs.values() {
            match run.snapshot.status {
                RunStatus::Queued => stats.queued += 1,
                RunStatus::Running => stats.running += 1,
                RunStatus::Succeeded => stats.succeeded += 1,
                RunStatus::Failed => stats.failed += 1,
                RunStatus::Cancelled => stats.cancelled += 1,
            }
        }
        Ok(stats)
    }
}
