//! `runway-runs`: the run lifecycle domain.
//!
//! This crate models one durable unit of asynchronous work (a **run**) and the
//! pure Transition Engine that moves it through its lifecycle:
//!
//! ```text
//! queued → running → succeeded
//!               ↘ failed → (retry) → queued
//!        ↘ cancelled
//! ```
//!
//! Everything here is **pure domain**: the engine receives the current
//! snapshot, a requested operation, and `now`, and returns either a legal
//! mutation or a typed rejection. It performs no I/O; callers (dispatcher,
//! watchdog, patch endpoints) apply the mutation as an atomic conditional
//! update against the durable store.

pub mod backoff;
pub mod patch;
pub mod run;
pub mod staleness;
pub mod transition;

pub use backoff::retry_delay_seconds;
pub use patch::{resolve_operation, PatchRequest, RunOperation};
pub use run::{RunRecord, RunSnapshot, RunStatus};
pub use staleness::{is_heartbeat_stale, StalenessPolicy};
pub use transition::{
    compute_patch_transition, compute_transition, FieldUpdate, Transition, TransitionError,
};
