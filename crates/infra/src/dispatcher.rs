//! Run dispatcher: claims due queued runs and drives them to completion.
//!
//! The dispatcher is a stateless, on-demand invocation (cron, queue consumer,
//! or manual request): it reads a batch, acts, and returns. All state lives in
//! the durable store. Runs within one batch are processed strictly
//! sequentially, oldest first; ordering integrity matters more here than raw
//! throughput. Across concurrent invocations, the store's full-snapshot
//! conditional update is the sole correctness mechanism: a transition that
//! matches zero rows was lost to a concurrent actor and is discarded, never
//! retried blindly.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, warn};

use runway_core::{ProjectId, RunId, UserId};
use runway_runs::{
    compute_transition, retry_delay_seconds, PatchRequest, RunOperation, RunRecord, RunStatus,
};
use runway_telemetry::{TelemetryEvent, TelemetryEventKind, TelemetrySink};

use crate::executor::RunExecutor;
use crate::run_store::{RunFilter, RunStore, RunStoreError};

/// Batch size default and bounds: `limit` is normalized into [1, 20].
pub const DEFAULT_LIMIT: usize = 1;
pub const MAX_LIMIT: usize = 20;

/// Over-fetch factor for client-side due-time filtering, capped at 100 rows.
pub const OVERFETCH_FACTOR: usize = 5;
pub const MAX_OVERFETCH: usize = 100;

/// Progress seeded when the dispatcher starts a run.
const START_PROGRESS: u8 = 10;

pub(crate) fn normalize_limit(limit: Option<usize>) -> usize {
    limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
}

pub(crate) fn overfetch(limit: usize) -> usize {
    (limit * OVERFETCH_FACTOR).min(MAX_OVERFETCH)
}

/// Parameters for one dispatch batch.
#[derive(Debug, Clone, Default)]
pub struct DispatchRequest {
    pub run_id: Option<RunId>,
    pub project_id: Option<ProjectId>,
    pub user_id: Option<UserId>,
    pub limit: Option<usize>,
    pub telemetry_session_id: Option<String>,
}

impl DispatchRequest {
    pub fn with_run_id(mut self, run_id: RunId) -> Self {
        self.run_id = Some(run_id);
        self
    }

    pub fn with_project_id(mut self, project_id: ProjectId) -> Self {
        self.project_id = Some(project_id);
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

/// How one run ended up after a dispatch or recovery pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunOutcome {
    pub run_id: RunId,
    pub status: RunStatus,
    /// Whether the run was re-queued for another attempt.
    pub retried: bool,
    pub attempt_count: u32,
    pub progress: u8,
    pub output: Option<JsonValue>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunOutcome {
    pub(crate) fn from_record(run: &RunRecord, retried: bool) -> Self {
        Self {
            run_id: run.id,
            status: run.snapshot.status,
            retried,
            attempt_count: run.snapshot.attempt_count,
            progress: run.snapshot.progress,
            output: run.output.clone(),
            next_retry_at: run.snapshot.next_retry_at,
            started_at: run.snapshot.started_at,
            finished_at: run.snapshot.finished_at,
            error: run.error_message.clone(),
        }
    }
}

/// Result of one dispatch batch.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatchReport {
    pub processed: usize,
    pub outcomes: Vec<RunOutcome>,
}

/// Batch-level failure. Per-run problems (rejected transitions, lost races,
/// execution failures) never abort the batch; only store I/O does.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("run store error: {0}")]
    Store(#[from] RunStoreError),
}

/// Claims queued, due runs and drives each through
/// `start → execute → complete | fail → (retry)`.
pub struct Dispatcher<S, E, T> {
    store: S,
    executor: E,
    sink: T,
}

impl<S, E, T> Dispatcher<S, E, T>
where
    S: RunStore,
    E: RunExecutor,
    T: TelemetrySink,
{
    pub fn new(store: S, executor: E, sink: T) -> Self {
        Self {
            store,
            executor,
            sink,
        }
    }

    /// Dispatch up to `limit` due queued runs, oldest first.
    pub fn dispatch_queued(&self, request: &DispatchRequest) -> Result<DispatchReport, DispatchError> {
        let limit = normalize_limit(request.limit);
        let now = Utc::now();

        let filter = RunFilter::default()
            .with_status(RunStatus::Queued)
            .with_run_id(request.run_id)
            .with_project_id(request.project_id)
            .with_user_id(request.user_id);
        // Over-fetch so rows still backing off can be filtered out client-side.
        let candidates = self.store.list(&filter, overfetch(limit))?;

        let due: Vec<_> = candidates
            .into_iter()
            .filter(|run| run.is_due(now))
            .take(limit)
            .collect();

        debug!(due = due.len(), limit, "dispatching queued runs");

        let mut outcomes = Vec::with_capacity(due.len());
        for run in due {
            if let Some(outcome) = self.process_run(run, request)? {
                outcomes.push(outcome);
            }
        }

        Ok(DispatchReport {
            processed: outcomes.len(),
            outcomes,
        })
    }

    /// Drive a single claimed run through its full attempt.
    ///
    /// Returns `None` when the run could not be started (stale snapshot or a
    /// lost race); such runs are skipped, not errors.
    fn process_run(
        &self,
        run: RunRecord,
        request: &DispatchRequest,
    ) -> Result<Option<RunOutcome>, DispatchError> {
        let session_id = request.telemetry_session_id.as_deref();
        let expected = run.snapshot.clone();
        let start_patch = PatchRequest::default().with_progress(START_PROGRESS);

        let transition =
            match compute_transition(&expected, RunOperation::Start, &start_patch, Utc::now()) {
                Ok(t) => t,
                Err(e) => {
                    debug!(run_id = %run.id, error = %e, "run not startable, skipping");
                    return Ok(None);
                }
            };
        let Some(started) = self.store.apply_transition(run.id, &expected, &transition)? else {
            warn!(run_id = %run.id, "start lost to a concurrent actor, skipping");
            return Ok(None);
        };

        emit(
            &self.sink,
            started.id,
            TelemetryEventKind::Started,
            session_id,
            json!({ "attempt": started.snapshot.attempt_count }),
        );

        match self.executor.execute(&started) {
            Ok(output) => self.complete_run(started, output, session_id),
            Err(error) => {
                let telemetry = FailureTelemetry {
                    failed: TelemetryEventKind::Failed,
                    retried: TelemetryEventKind::RetryScheduled,
                    terminal: None,
                };
                fail_and_maybe_retry(
                    &self.store,
                    &self.sink,
                    started,
                    &error.to_string(),
                    None,
                    error.is_permanent(),
                    session_id,
                    telemetry,
                )
            }
        }
    }

    fn complete_run(
        &self,
        run: RunRecord,
        output: JsonValue,
        session_id: Option<&str>,
    ) -> Result<Option<RunOutcome>, DispatchError> {
        let expected = run.snapshot.clone();
        let patch = PatchRequest::default().with_output(output);
        let transition =
            match compute_transition(&expected, RunOperation::Complete, &patch, Utc::now()) {
                Ok(t) => t,
                Err(e) => {
                    debug!(run_id = %run.id, error = %e, "completion rejected, skipping");
                    return Ok(None);
                }
            };
        let Some(completed) = self.store.apply_transition(run.id, &expected, &transition)? else {
            warn!(run_id = %run.id, "completion lost to a concurrent actor, skipping");
            return Ok(None);
        };

        emit(
            &self.sink,
            completed.id,
            TelemetryEventKind::Succeeded,
            session_id,
            json!({ "attempt": completed.snapshot.attempt_count }),
        );

        Ok(Some(RunOutcome::from_record(&completed, false)))
    }
}

/// Which telemetry events the shared failure path reports.
///
/// The dispatcher has no distinct terminal event (the failed event carries
/// it); the watchdog reports terminal failures explicitly.
pub(crate) struct FailureTelemetry {
    pub failed: TelemetryEventKind,
    pub retried: TelemetryEventKind,
    pub terminal: Option<TelemetryEventKind>,
}

/// Move a running (or queued) run to `failed`, then decide retry eligibility:
/// retry iff the failure was not permanent, the run is retryable, and the
/// attempt ceiling is not exhausted. Shared by the dispatcher's execution
/// failure path and the watchdog's stale-run recovery.
pub(crate) fn fail_and_maybe_retry<S: RunStore, T: TelemetrySink>(
    store: &S,
    sink: &T,
    run: RunRecord,
    error_message: &str,
    output_marker: Option<JsonValue>,
    permanent: bool,
    session_id: Option<&str>,
    telemetry: FailureTelemetry,
) -> Result<Option<RunOutcome>, DispatchError> {
    let expected = run.snapshot.clone();
    let mut patch = PatchRequest::default().with_error_message(error_message);
    if let Some(marker) = output_marker {
        patch = patch.with_output(marker);
    }
    let transition = match compute_transition(&expected, RunOperation::Fail, &patch, Utc::now()) {
        Ok(t) => t,
        Err(e) => {
            debug!(run_id = %run.id, error = %e, "fail transition rejected, skipping");
            return Ok(None);
        }
    };
    let Some(failed) = store.apply_transition(run.id, &expected, &transition)? else {
        warn!(run_id = %run.id, "fail lost to a concurrent actor, skipping");
        return Ok(None);
    };

    emit(
        sink,
        failed.id,
        telemetry.failed,
        session_id,
        json!({
            "attempt": failed.snapshot.attempt_count,
            "error": error_message,
            "permanent": permanent,
        }),
    );

    let snapshot = &failed.snapshot;
    let eligible =
        !permanent && snapshot.retryable && snapshot.attempt_count < snapshot.max_attempts;

    if eligible {
        let delay = retry_delay_seconds(snapshot.attempt_count);
        let expected = failed.snapshot.clone();
        let retry_patch = PatchRequest::default().with_retry_after_seconds(delay);
        match compute_transition(&expected, RunOperation::Retry, &retry_patch, Utc::now()) {
            Ok(transition) => {
                if let Some(requeued) = store.apply_transition(failed.id, &expected, &transition)? {
                    emit(
                        sink,
                        requeued.id,
                        telemetry.retried,
                        session_id,
                        json!({
                            "attempt": requeued.snapshot.attempt_count,
                            "retry_after_seconds": delay,
                            "next_retry_at": requeued.snapshot.next_retry_at,
                        }),
                    );
                    return Ok(Some(RunOutcome::from_record(&requeued, true)));
                }
                warn!(run_id = %failed.id, "retry lost to a concurrent actor");
            }
            Err(e) => {
                debug!(run_id = %failed.id, error = %e, "retry rejected");
            }
        }
    }

    if let Some(kind) = telemetry.terminal {
        emit(
            sink,
            failed.id,
            kind,
            session_id,
            json!({
                "attempt": failed.snapshot.attempt_count,
                "error": error_message,
            }),
        );
    }

    Ok(Some(RunOutcome::from_record(&failed, false)))
}

/// Record a telemetry event, swallowing any sink failure: telemetry never
/// blocks or fails the transition path.
pub(crate) fn emit<T: TelemetrySink>(
    sink: &T,
    run_id: RunId,
    kind: TelemetryEventKind,
    session_id: Option<&str>,
    metadata: JsonValue,
) {
    let event = TelemetryEvent::new(run_id, kind)
        .with_session_id(session_id.map(str::to_string))
        .with_metadata(metadata);
    if let Err(error) = sink.record(event) {
        debug!(?error, %run_id, "telemetry record failed, ignoring");
    }
}
