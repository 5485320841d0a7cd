//! Run executor boundary: the injected domain payload handler.

use std::sync::Arc;

use serde_json::Value as JsonValue;
use thiserror::Error;

use runway_runs::RunRecord;

/// Why an execution attempt failed.
///
/// Permanence is an explicit tag, not an error-type hierarchy: the
/// dispatcher's retry decision is a plain match. Executors signal `Permanent`
/// for inputs that can never succeed (malformed payload, unsupported run
/// type, a 4xx-class downstream rejection); everything else is `Transient`
/// and subject to the retry policy.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("permanent execution failure: {0}")]
    Permanent(String),

    #[error("transient execution failure: {0}")]
    Transient(String),
}

impl ExecutionError {
    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, ExecutionError::Permanent(_))
    }
}

/// The opaque domain payload handler (e.g. a mobile release pipeline).
///
/// Implementations validate their own input shape, may run arbitrarily long,
/// and should observe `run.snapshot.cancel_requested` to exit early on
/// cooperative cancellation. This core never preempts an executor; the
/// watchdog's staleness detection is the only backstop for executors that
/// never return.
pub trait RunExecutor: Send + Sync {
    fn execute(&self, run: &RunRecord) -> Result<JsonValue, ExecutionError>;
}

impl<E> RunExecutor for Arc<E>
where
    E: RunExecutor + ?Sized,
{
    fn execute(&self, run: &RunRecord) -> Result<JsonValue, ExecutionError> {
        (**self).execute(run)
    }
}

/// Closure adapter for tests and simple embedders.
pub struct FnRunExecutor<F>(F);

impl<F> FnRunExecutor<F>
where
    F: Fn(&RunRecord) -> Result<JsonValue, ExecutionError> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> RunExecutor for FnRunExecutor<F>
where
    F: Fn(&RunRecord) -> Result<JsonValue, ExecutionError> + Send + Sync,
{
    fn execute(&self, run: &RunRecord) -> Result<JsonValue, ExecutionError> {
        (self.0)(run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runway_core::{ProjectId, UserId};
    use serde_json::json;

    #[test]
    fn permanence_is_a_simple_match() {
        assert!(ExecutionError::permanent("bad payload").is_permanent());
        assert!(!ExecutionError::transient("downstream 503").is_permanent());
    }

    #[test]
    fn closure_executor_sees_the_run_input() {
        let executor = FnRunExecutor::new(|run: &RunRecord| Ok(run.input.clone()));
        let run = RunRecord::queued(ProjectId::new(), UserId::new(), json!({"echo": true}));
        assert_eq!(executor.execute(&run).unwrap(), json!({"echo": true}));
    }
}
