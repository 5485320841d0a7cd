//! Infrastructure layer: run storage, dispatch, and stale-run recovery.
//!
//! The domain crate (`runway-runs`) decides *what* may happen to a run; this
//! crate makes it happen: it selects due runs, invokes the executor, applies
//! engine-computed transitions as conditional store updates, and reports
//! telemetry along the way.

pub mod dispatcher;
pub mod executor;
pub mod patch;
pub mod run_store;
pub mod watchdog;

#[cfg(test)]
mod integration_tests;

pub use dispatcher::{DispatchError, DispatchReport, DispatchRequest, Dispatcher, RunOutcome};
pub use executor::{ExecutionError, FnRunExecutor, RunExecutor};
pub use patch::{apply_patch, PatchError};
pub use run_store::{InMemoryRunStore, PostgresRunStore, RunFilter, RunStats, RunStore, RunStoreError};
pub use watchdog::{Watchdog, WatchdogReport, WatchdogRequest};
