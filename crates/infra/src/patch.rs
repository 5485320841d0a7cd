//! Direct patch application: the synchronous single-run update path.
//!
//! Status-update endpoints (progress reports, heartbeats, cancellation
//! requests, manual completion) apply a `PatchRequest` straight to one run
//! through the Transition Engine, with the same conditional-update discipline
//! the dispatcher uses.

use chrono::Utc;
use thiserror::Error;

use runway_core::RunId;
use runway_runs::{compute_patch_transition, PatchRequest, RunRecord, TransitionError};

use crate::run_store::{RunStore, RunStoreError};

#[derive(Debug, Error)]
pub enum PatchError {
    #[error("run not found: {0}")]
    NotFound(RunId),

    /// The engine rejected the operation; the row is unmodified.
    #[error(transparent)]
    Transition(#[from] TransitionError),

    /// The row changed between load and update; reload and retry.
    #[error("run {0} was modified concurrently")]
    Conflict(RunId),

    #[error(transparent)]
    Store(#[from] RunStoreError),
}

/// Apply a patch to a single run and return the updated row.
pub fn apply_patch<S: RunStore>(
    store: &S,
    run_id: RunId,
    patch: &PatchRequest,
) -> Result<RunRecord, PatchError> {
    let run = store.get(run_id)?.ok_or(PatchError::NotFound(run_id))?;
    let transition = compute_patch_transition(&run.snapshot, patch, Utc::now())?;
    store
        .apply_transition(run_id, &run.snapshot, &transition)?
        .ok_or(PatchError::Conflict(run_id))
}
