//! Telemetry event model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use runway_core::RunId;

/// The lifecycle moments the dispatcher and watchdog report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TelemetryEventKind {
    Started,
    Succeeded,
    Failed,
    RetryScheduled,
    WatchdogMarkedFailed,
    WatchdogRetried,
    WatchdogTerminalFailure,
}

impl TelemetryEventKind {
    /// Stable dotted event name for downstream sinks.
    pub fn event_name(&self) -> &'static str {
        match self {
            TelemetryEventKind::Started => "run.started",
            TelemetryEventKind::Succeeded => "run.succeeded",
            TelemetryEventKind::Failed => "run.failed",
            TelemetryEventKind::RetryScheduled => "run.retry_scheduled",
            TelemetryEventKind::WatchdogMarkedFailed => "run.watchdog_marked_failed",
            TelemetryEventKind::WatchdogRetried => "run.watchdog_retried",
            TelemetryEventKind::WatchdogTerminalFailure => "run.watchdog_terminal_failure",
        }
    }
}

/// One recorded lifecycle moment for a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub run_id: RunId,
    /// Caller-supplied correlation id for a dispatch/recovery batch.
    pub session_id: Option<String>,
    pub kind: TelemetryEventKind,
    /// Free-form context (attempt number, error, backoff, ...).
    pub metadata: JsonValue,
    pub occurred_at: DateTime<Utc>,
}

impl TelemetryEvent {
    pub fn new(run_id: RunId, kind: TelemetryEventKind) -> Self {
        Self {
            run_id,
            session_id: None,
            kind,
            metadata: JsonValue::Null,
            occurred_at: Utc::now(),
        }
    }

    pub fn with_session_id(mut self, session_id: Option<String>) -> Self {
        self.session_id = session_id;
        self
    }

    pub fn with_metadata(mut self, metadata: JsonValue) -> Self {
        self.metadata = metadata;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_names_are_stable() {
        assert_eq!(TelemetryEventKind::Started.event_name(), "run.started");
        assert_eq!(
            TelemetryEventKind::WatchdogTerminalFailure.event_name(),
            "run.watchdog_terminal_failure"
        );
    }

    #[test]
    fn kind_serializes_snake_case() {
        let json = serde_json::to_string(&TelemetryEventKind::RetryScheduled).unwrap();
        assert_eq!(json, "\"retry_scheduled\"");
    }
}
