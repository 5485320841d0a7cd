//! The Transition Engine: pure lifecycle decision logic.
//!
//! `compute_transition` takes a run's persisted snapshot, a requested
//! operation, and the current time, and returns either the mutation to apply
//! or a typed rejection. It never touches storage; callers apply the result as
//! an atomic conditional update keyed on the exact snapshot that was validated
//! (full-snapshot compare-and-swap, not just `status`). Rejections are values,
//! never panics, and always leave the row unmodified.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::patch::{resolve_operation, PatchRequest, RunOperation};
use crate::run::{RunSnapshot, RunStatus};

/// Error message recorded when a failure carries no explicit reason.
pub const DEFAULT_FAILURE_MESSAGE: &str = "run failed";

/// Why a requested operation was rejected. No mutation occurs on rejection.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransitionError {
    /// The request itself was malformed (e.g. progress update without a value).
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// The operation is not legal from the run's current state.
    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    /// Starting or retrying would exceed the attempt ceiling.
    #[error("max attempts reached ({attempt_count}/{max_attempts})")]
    MaxAttemptsReached {
        attempt_count: u32,
        max_attempts: u32,
    },

    /// The run is flagged non-retryable.
    #[error("run is not retryable")]
    NotRetryable,
}

impl TransitionError {
    /// Stable machine-readable code for API layers.
    pub fn code(&self) -> &'static str {
        match self {
            TransitionError::InvalidPayload(_) => "invalid_payload",
            TransitionError::InvalidTransition(_) => "invalid_transition",
            TransitionError::MaxAttemptsReached { .. } => "max_attempts_reached",
            TransitionError::NotRetryable => "not_retryable",
        }
    }
}

/// A deferred write to a nullable column: keep it, clear it, or set it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldUpdate<T> {
    Keep,
    Clear,
    Set(T),
}

impl<T: Clone> FieldUpdate<T> {
    pub fn apply_to(&self, slot: &mut Option<T>) {
        match self {
            FieldUpdate::Keep => {}
            FieldUpdate::Clear => *slot = None,
            FieldUpdate::Set(value) => *slot = Some(value.clone()),
        }
    }
}

/// A validated, ready-to-apply mutation.
///
/// `after` is the complete snapshot the row should hold once applied; the
/// snapshot the engine was given is the compare-and-swap predicate.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub operation: RunOperation,
    pub after: RunSnapshot,
    pub output: FieldUpdate<JsonValue>,
    pub error_message: FieldUpdate<String>,
}

/// Convenience wrapper for boundary callers: derive the operation from the
/// patch (legacy compatibility), then compute the transition.
pub fn compute_patch_transition(
    current: &RunSnapshot,
    patch: &PatchRequest,
    now: DateTime<Utc>,
) -> Result<Transition, TransitionError> {
    let operation = resolve_operation(patch)?;
    compute_transition(current, operation, patch, now)
}

/// Compute the mutation for `operation` against `current`, or reject.
///
/// Pure: identical inputs always yield identical results.
pub fn compute_transition(
    current: &RunSnapshot,
    operation: RunOperation,
    patch: &PatchRequest,
    now: DateTime<Utc>,
) -> Result<Transition, TransitionError> {
    // Terminal guard. `succeeded` and `cancelled` accept nothing; `failed`
    // uniquely admits `retry` (back to queued) and the administrative `cancel`.
    match current.status {
        RunStatus::Succeeded | RunStatus::Cancelled => {
            return Err(TransitionError::InvalidTransition(format!(
                "run is {} and accepts no further operations",
                current.status
            )));
        }
        RunStatus::Failed
            if !matches!(operation, RunOperation::Retry | RunOperation::Cancel) =>
        {
            return Err(TransitionError::InvalidTransition(format!(
                "operation {operation} is not allowed on a failed run"
            )));
        }
        _ => {}
    }

    let mut after = current.clone();
    let mut output = FieldUpdate::Keep;
    let mut error_message = FieldUpdate::Keep;

    match operation {
        RunOperation::Start => {
            require_status(current, operation, &[RunStatus::Queued])?;
            if current.cancel_requested {
                return Err(TransitionError::InvalidTransition(
                    "cancel was requested before the run started".to_string(),
                ));
            }
            if current.attempt_count >= current.max_attempts {
                return Err(TransitionError::MaxAttemptsReached {
                    attempt_count: current.attempt_count,
                    max_attempts: current.max_attempts,
                });
            }
            after.status = RunStatus::Running;
            after.started_at = Some(now);
            after.finished_at = None;
            after.next_retry_at = None;
            after.attempt_count = current.attempt_count + 1;
            after.progress = clamp_progress(patch.progress.unwrap_or(current.progress.max(1)));
        }
        RunOperation::Progress => {
            require_status(current, operation, &[RunStatus::Running])?;
            let progress = patch.progress.ok_or_else(|| {
                TransitionError::InvalidPayload("progress update requires a progress value".to_string())
            })?;
            after.progress = clamp_progress(progress);
        }
        RunOperation::Complete => {
            require_status(current, operation, &[RunStatus::Running])?;
            after.status = RunStatus::Succeeded;
            after.progress = 100;
            after.finished_at = Some(now);
            after.next_retry_at = None;
            error_message = FieldUpdate::Clear;
            output = match &patch.output {
                Some(value) => FieldUpdate::Set(value.clone()),
                None => FieldUpdate::Clear,
            };
        }
        RunOperation::Fail => {
            require_status(current, operation, &[RunStatus::Running, RunStatus::Queued])?;
            after.status = RunStatus::Failed;
            after.finished_at = Some(now);
            after.next_retry_at = None;
            error_message = FieldUpdate::Set(
                patch
                    .error_message
                    .clone()
                    .unwrap_or_else(|| DEFAULT_FAILURE_MESSAGE.to_string()),
            );
            output = match &patch.output {
                Some(value) => FieldUpdate::Set(value.clone()),
                None => FieldUpdate::Clear,
            };
        }
        RunOperation::RequestCancel => {
            require_status(current, operation, &[RunStatus::Queued, RunStatus::Running])?;
            after.cancel_requested = true;
            if current.status == RunStatus::Queued {
                // No executor ever ran; finalize immediately.
                after.status = RunStatus::Cancelled;
                after.finished_at = Some(now);
                after.next_retry_at = None;
            }
            // From `running`, status is unchanged: the executor must observe
            // the flag and exit cooperatively.
        }
        RunOperation::Cancel => {
            require_status(
                current,
                operation,
                &[RunStatus::Queued, RunStatus::Running, RunStatus::Failed],
            )?;
            after.status = RunStatus::Cancelled;
            after.cancel_requested = true;
            after.finished_at = Some(now);
            after.next_retry_at = None;
        }
        RunOperation::Retry => {
            require_status(current, operation, &[RunStatus::Failed])?;
            if !current.retryable {
                return Err(TransitionError::NotRetryable);
            }
            if current.attempt_count >= current.max_attempts {
                return Err(TransitionError::MaxAttemptsReached {
                    attempt_count: current.attempt_count,
                    max_attempts: current.max_attempts,
                });
            }
            let delay_seconds = patch.retry_after_seconds.unwrap_or(0);
            // Delays are caller-supplied; anything chrono cannot represent is
            // a payload error, not a panic.
            let eligible_at = i64::try_from(delay_seconds)
                .ok()
                .and_then(Duration::try_seconds)
                .and_then(|delay| now.checked_add_signed(delay))
                .ok_or_else(|| {
                    TransitionError::InvalidPayload(format!(
                        "retry_after_seconds {delay_seconds} is out of range"
                    ))
                })?;
            after.status = RunStatus::Queued;
            after.progress = 0;
            after.started_at = None;
            after.finished_at = None;
            after.cancel_requested = false;
            after.next_retry_at = Some(eligible_at);
            error_message = FieldUpdate::Clear;
        }
        RunOperation::Heartbeat => {
            require_status(current, operation, &[RunStatus::Running])?;
            after.last_heartbeat_at = Some(now);
        }
    }

    Ok(Transition {
        operation,
        after,
        output,
        error_message,
    })
}

fn clamp_progress(progress: u8) -> u8 {
    progress.min(100)
}

fn require_status(
    current: &RunSnapshot,
    operation: RunOperation,
    allowed: &[RunStatus],
) -> Result<(), TransitionError> {
    if allowed.contains(&current.status) {
        Ok(())
    } else {
        Err(TransitionError::InvalidTransition(format!(
            "operation {} requires status {}, found {}",
            operation,
            allowed
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(" or "),
            current.status
        )))
    }
}
