//! Stale-run watchdog: recovers runs abandoned mid-execution.
//!
//! The watchdog is the only backstop against executors that never return:
//! there is no hard timeout or kill in this core. It scans `running` rows
//! whose last liveness signal is older than the threshold and forces them
//! through the same fail/retry path the dispatcher uses for execution
//! failures. A run the dispatcher concurrently finished simply loses the
//! conditional update and is skipped.

use serde::Serialize;
use serde_json::json;
use tracing::debug;

use runway_core::{ProjectId, RunId, UserId};
use runway_runs::{is_heartbeat_stale, RunStatus, StalenessPolicy};
use runway_telemetry::{TelemetryEventKind, TelemetrySink};

use crate::dispatcher::{
    fail_and_maybe_retry, normalize_limit, overfetch, DispatchError, FailureTelemetry, RunOutcome,
};
use crate::run_store::{RunFilter, RunStore};

/// Failure reason recorded on runs the watchdog reclaims.
pub const WATCHDOG_FAILURE_MESSAGE: &str =
    "run abandoned: no heartbeat within the staleness threshold";

/// Parameters for one recovery pass.
#[derive(Debug, Clone, Default)]
pub struct WatchdogRequest {
    pub run_id: Option<RunId>,
    pub project_id: Option<ProjectId>,
    pub user_id: Option<UserId>,
    /// Clamped to [60, 86400] seconds; defaults to 10 minutes.
    pub stale_after_seconds: Option<u64>,
    pub limit: Option<usize>,
    pub telemetry_session_id: Option<String>,
}

impl WatchdogRequest {
    pub fn with_stale_after_seconds(mut self, seconds: u64) -> Self {
        self.stale_after_seconds = Some(seconds);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_telemetry_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.telemetry_session_id = Some(session_id.into());
        self
    }
}

/// Result of one recovery pass.
///
/// `scanned` counts running rows examined, `stale` how many of those were past
/// the threshold, `recovered` how many this pass actually moved to `failed`;
/// `retried`/`failed` split the recovered runs by whether they were re-queued.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WatchdogReport {
    pub scanned: usize,
    pub stale: usize,
    pub recovered: usize,
    pub retried: usize,
    pub failed: usize,
    pub outcomes: Vec<RunOutcome>,
}

/// Scans for abandoned `running` rows and reclaims them.
pub struct Watchdog<S, T> {
    store: S,
    sink: T,
}

impl<S, T> Watchdog<S, T>
where
    S: RunStore,
    T: TelemetrySink,
{
    pub fn new(store: S, sink: T) -> Self {
        Self { store, sink }
    }

    /// Recover up to `limit` stale running runs.
    pub fn recover_stale_running(
        &self,
        request: &WatchdogRequest,
    ) -> Result<WatchdogReport, DispatchError> {
        let limit = normalize_limit(request.limit);
        let policy = StalenessPolicy::new(chrono::Utc::now(), request.stale_after_seconds);
        let session_id = request.telemetry_session_id.as_deref();

        let filter = RunFilter::default()
            .with_status(RunStatus::Running)
            .with_run_id(request.run_id)
            .with_project_id(request.project_id)
            .with_user_id(request.user_id);
        let candidates = self.store.list(&filter, overfetch(limit))?;

        let mut report = WatchdogReport {
            scanned: candidates.len(),
            ..WatchdogReport::default()
        };

        let stale: Vec<_> = candidates
            .into_iter()
            .filter(|run| is_heartbeat_stale(run, &policy))
            .collect();
        report.stale = stale.len();

        debug!(
            scanned = report.scanned,
            stale = report.stale,
            stale_after_seconds = policy.stale_after_seconds,
            "watchdog pass"
        );

        for run in stale.into_iter().take(limit) {
            let telemetry = FailureTelemetry {
                failed: TelemetryEventKind::WatchdogMarkedFailed,
                retried: TelemetryEventKind::WatchdogRetried,
                terminal: Some(TelemetryEventKind::WatchdogTerminalFailure),
            };
            let outcome = fail_and_maybe_retry(
                &self.store,
                &self.sink,
                run,
                WATCHDOG_FAILURE_MESSAGE,
                Some(json!({ "watchdog": true })),
                false,
                session_id,
                telemetry,
            )?;
            match outcome {
                Some(outcome) => {
                    report.recovered += 1;
                    if outcome.retried {
                        report.retried += 1;
                    } else {
                        report.failed += 1;
                    }
                    report.outcomes.push(outcome);
                }
                // Lost to a concurrent actor (e.g. the dispatcher finished
                // it); not an error for the batch.
                None => {}
            }
        }

        Ok(report)
    }
}
