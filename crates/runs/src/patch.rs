//! Patch requests: the write shape accepted at the run-update boundary.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::run::RunStatus;
use crate::transition::TransitionError;

/// An explicit lifecycle operation on a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunOperation {
    Start,
    Progress,
    Complete,
    Fail,
    /// Cooperative cancellation: sets the `cancel_requested` flag on a running
    /// run; finalizes a queued run immediately.
    RequestCancel,
    /// Unconditional/administrative cancel.
    Cancel,
    Retry,
    Heartbeat,
}

impl RunOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOperation::Start => "start",
            RunOperation::Progress => "progress",
            RunOperation::Complete => "complete",
            RunOperation::Fail => "fail",
            RunOperation::RequestCancel => "request-cancel",
            RunOperation::Cancel => "cancel",
            RunOperation::Retry => "retry",
            RunOperation::Heartbeat => "heartbeat",
        }
    }
}

impl std::fmt::Display for RunOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A requested mutation, as supplied by a caller.
///
/// New callers pass an explicit `operation`; the remaining fields carry the
/// operation's arguments. Legacy callers may omit `operation` and have one
/// derived via [`resolve_operation`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatchRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<RunOperation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<RunStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<u64>,
}

impl PatchRequest {
    pub fn operation(operation: RunOperation) -> Self {
        Self {
            operation: Some(operation),
            ..Self::default()
        }
    }

    pub fn with_progress(mut self, progress: u8) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_output(mut self, output: JsonValue) -> Self {
        self.output = Some(output);
        self
    }

    pub fn with_error_message(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    pub fn with_retry_after_seconds(mut self, seconds: u64) -> Self {
        self.retry_after_seconds = Some(seconds);
        self
    }
}

/// Backward-compatibility mapping: derive an operation for patches that carry
/// none.
///
/// Kept at the boundary rather than inside the engine so new callers always
/// pass an explicit operation. The derivation mirrors the historical
/// status-write API: the status a legacy caller wrote maps to the operation
/// that produces it (`running`→start, `succeeded`→complete, `failed`→fail,
/// `cancelled`→cancel, `queued`→retry); a bare `progress` value maps to a
/// progress update.
pub fn resolve_operation(patch: &PatchRequest) -> Result<RunOperation, TransitionError> {
    if let Some(operation) = patch.operation {
        return Ok(operation);
    }
    if let Some(status) = patch.status {
        return Ok(match status {
            RunStatus::Running => RunOperation::Start,
            RunStatus::Succeeded => RunOperation::Complete,
            RunStatus::Failed => RunOperation::Fail,
            RunStatus::Cancelled => RunOperation::Cancel,
            RunStatus::Queued => RunOperation::Retry,
        });
    }
    if patch.progress.is_some() {
        return Ok(RunOperation::Progress);
    }
    Err(TransitionError::InvalidPayload(
        "no operation supplied and none derivable from status or progress".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_operation_wins_over_status() {
        let patch = PatchRequest::operation(RunOperation::Heartbeat);
        assert_eq!(resolve_operation(&patch).unwrap(), RunOperation::Heartbeat);

        let patch = PatchRequest {
            operation: Some(RunOperation::Progress),
            status: Some(RunStatus::Succeeded),
            progress: Some(40),
            ..PatchRequest::default()
        };
        assert_eq!(resolve_operation(&patch).unwrap(), RunOperation::Progress);
    }

    #[test]
    fn derives_operation_from_legacy_status_writes() {
        let cases = [
            (RunStatus::Running, RunOperation::Start),
            (RunStatus::Succeeded, RunOperation::Complete),
            (RunStatus::Failed, RunOperation::Fail),
            (RunStatus::Cancelled, RunOperation::Cancel),
            (RunStatus::Queued, RunOperation::Retry),
        ];
        for (status, expected) in cases {
            let patch = PatchRequest {
                status: Some(status),
                ..PatchRequest::default()
            };
            assert_eq!(resolve_operation(&patch).unwrap(), expected);
        }
    }

    #[test]
    fn bare_progress_derives_progress_operation() {
        let patch = PatchRequest {
            progress: Some(55),
            ..PatchRequest::default()
        };
        assert_eq!(resolve_operation(&patch).unwrap(), RunOperation::Progress);
    }

    #[test]
    fn empty_patch_is_invalid_payload() {
        let err = resolve_operation(&PatchRequest::default()).unwrap_err();
        assert!(matches!(err, TransitionError::InvalidPayload(_)));
    }

    #[test]
    fn operation_serializes_kebab_case() {
        let json = serde_json::to_string(&RunOperation::RequestCancel).unwrap();
        assert_eq!(json, "\"request-cancel\"");
    }
}
