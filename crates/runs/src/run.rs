//! Core run types: status, persisted snapshot, and the full run row.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use runway_core::{ProjectId, RunId, UserId};

use crate::transition::Transition;

/// Default attempt ceiling for newly created runs.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Lifecycle state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Waiting to be picked up by the dispatcher.
    Queued,
    /// An executor is (believed to be) working on it.
    Running,
    /// Finished successfully. Terminal.
    Succeeded,
    /// Last attempt failed. May be retried or cancelled; otherwise final.
    Failed,
    /// Cancelled. Terminal.
    Cancelled,
}

impl RunStatus {
    /// Terminal states accept no further operations at all.
    ///
    /// `Failed` is deliberately not terminal: it uniquely admits `retry`
    /// (back to `Queued`) and the administrative `cancel`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Succeeded | RunStatus::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = runway_core::DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(RunStatus::Queued),
            "running" => Ok(RunStatus::Running),
            "succeeded" => Ok(RunStatus::Succeeded),
            "failed" => Ok(RunStatus::Failed),
            "cancelled" => Ok(RunStatus::Cancelled),
            other => Err(runway_core::DomainError::validation(format!(
                "unknown run status: {other}"
            ))),
        }
    }
}

/// The Transition Engine's view of a run: exactly the persisted lifecycle
/// fields, without identity or payloads.
///
/// The whole snapshot doubles as the compare-and-swap predicate when a
/// transition is applied to the store, so it must stay `PartialEq` over every
/// field the engine validated against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub status: RunStatus,
    /// Caller-reported completion percentage, 0 to 100.
    pub progress: u8,
    /// Number of times execution has been started. Only ever increases.
    pub attempt_count: u32,
    /// Attempt ceiling (≥ 1).
    pub max_attempts: u32,
    /// Whether failures may be retried at all.
    pub retryable: bool,
    /// Sticky flag once any cancel is requested (false → true only).
    pub cancel_requested: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// When a queued run becomes eligible again after backoff.
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Most recent liveness signal while running.
    pub last_heartbeat_at: Option<DateTime<Utc>>,
}

impl RunSnapshot {
    /// Snapshot for a freshly created run.
    pub fn queued(max_attempts: u32, retryable: bool) -> Self {
        Self {
            status: RunStatus::Queued,
            progress: 0,
            attempt_count: 0,
            max_attempts: max_attempts.max(1),
            retryable,
            cancel_requested: false,
            started_at: None,
            finished_at: None,
            next_retry_at: None,
            last_heartbeat_at: None,
        }
    }
}

/// One durable row per unit of work.
///
/// Created `queued` by the (out-of-scope) client-facing layer and mutated
/// exclusively through [`Transition`]s applied by the dispatcher, watchdog, or
/// patch endpoints. Never deleted by this core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: RunId,
    pub project_id: ProjectId,
    pub user_id: UserId,
    /// Caller-supplied duplicate-creation guard; pass-through for this core.
    pub idempotency_key: Option<String>,
    /// Opaque payload handed to the run executor.
    pub input: JsonValue,
    /// Result of successful execution.
    pub output: Option<JsonValue>,
    /// Last failure reason.
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(flatten)]
    pub snapshot: RunSnapshot,
}

impl RunRecord {
    /// Create a queued run row.
    pub fn queued(project_id: ProjectId, user_id: UserId, input: JsonValue) -> Self {
        let now = Utc::now();
        Self {
            id: RunId::new(),
            project_id,
            user_id,
            idempotency_key: None,
            input,
            output: None,
            error_message: None,
            created_at: now,
            updated_at: now,
            snapshot: RunSnapshot::queued(DEFAULT_MAX_ATTEMPTS, true),
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.snapshot.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.snapshot.retryable = retryable;
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn status(&self) -> RunStatus {
        self.snapshot.status
    }

    /// A queued run is due once any retry backoff has elapsed.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.snapshot.status == RunStatus::Queued
            && self.snapshot.next_retry_at.is_none_or(|at| at <= now)
    }

    /// Apply an engine-computed transition to this row.
    ///
    /// Stores call this only after the compare-and-swap predicate (the
    /// snapshot the engine validated against) has been checked.
    pub fn apply(&mut self, transition: &Transition, now: DateTime<Utc>) {
        self.snapshot = transition.after.clone();
        transition.output.apply_to(&mut self.output);
        transition.error_message.apply_to(&mut self.error_message);
        self.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn new_run_is_queued_with_zero_attempts() {
        let run = RunRecord::queued(ProjectId::new(), UserId::new(), json!({"platform": "ios"}));
        assert_eq!(run.status(), RunStatus::Queued);
        assert_eq!(run.snapshot.attempt_count, 0);
        assert!(run.snapshot.retryable);
        assert!(run.is_due(Utc::now()));
    }

    #[test]
    fn max_attempts_floor_is_one() {
        let run = RunRecord::queued(ProjectId::new(), UserId::new(), json!({})).with_max_attempts(0);
        assert_eq!(run.snapshot.max_attempts, 1);
    }

    #[test]
    fn run_with_future_backoff_is_not_due() {
        let mut run = RunRecord::queued(ProjectId::new(), UserId::new(), json!({}));
        let now = Utc::now();
        run.snapshot.next_retry_at = Some(now + chrono::Duration::seconds(30));
        assert!(!run.is_due(now));
        assert!(run.is_due(now + chrono::Duration::seconds(31)));
    }

    #[test]
    fn snapshot_serializes_flattened_into_record() {
        let run = RunRecord::queued(ProjectId::new(), UserId::new(), json!({}));
        let value = serde_json::to_value(&run).unwrap();
        assert_eq!(value["status"], json!("queued"));
        assert_eq!(value["attempt_count"], json!(0));
    }
}
