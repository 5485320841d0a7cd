//! Integration tests for the full run pipeline.
//!
//! Tests: RunStore → Dispatcher → RunExecutor → TelemetrySink, plus the
//! watchdog recovery path and the patch entry point.
//!
//! Verifies:
//! - Queued runs are claimed, executed, and finalized with telemetry
//! - Transient failures re-queue with exponential backoff up to the ceiling
//! - Permanent and non-retryable failures never re-queue
//! - The watchdog reclaims abandoned running rows through the same path

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{Duration, Utc};
    use serde_json::json;

    use runway_core::{ProjectId, UserId};
    use runway_runs::{PatchRequest, RunOperation, RunRecord, RunStatus};
    use runway_telemetry::{InMemoryTelemetrySink, TelemetryEventKind};

    use crate::dispatcher::{DispatchRequest, Dispatcher};
    use crate::executor::{ExecutionError, FnRunExecutor};
    use crate::patch::apply_patch;
    use crate::run_store::{InMemoryRunStore, RunStore};
    use crate::watchdog::{Watchdog, WatchdogRequest, WATCHDOG_FAILURE_MESSAGE};

    fn setup() -> (Arc<InMemoryRunStore>, Arc<InMemoryTelemetrySink>) {
        runway_observability::init();
        (InMemoryRunStore::arc(), InMemoryTelemetrySink::arc())
    }

    fn seed_queued(store: &Arc<InMemoryRunStore>) -> RunRecord {
        let run = RunRecord::queued(ProjectId::new(), UserId::new(), json!({"platform": "ios"}));
        store.insert(run.clone()).unwrap();
        run
    }

    /// Force a queued run to be due now by clearing its backoff.
    fn clear_backoff(store: &Arc<InMemoryRunStore>, run_id: runway_core::RunId) {
        let mut run = store.get(run_id).unwrap().unwrap();
        run.snapshot.next_retry_at = None;
        store.replace(run);
    }

    fn event_kinds(sink: &InMemoryTelemetrySink) -> Vec<TelemetryEventKind> {
        sink.events().iter().map(|e| e.kind).collect()
    }

    #[test]
    fn successful_run_flows_from_queued_to_succeeded() {
        let (store, sink) = setup();
        let run = seed_queued(&store);

        let dispatcher = Dispatcher::new(
            store.clone(),
            FnRunExecutor::new(|run: &RunRecord| Ok(json!({ "echo": run.input.clone() }))),
            sink.clone(),
        );
        let report = dispatcher.dispatch_queued(&DispatchRequest::default()).unwrap();

        assert_eq!(report.processed, 1);
        let outcome = &report.outcomes[0];
        assert_eq!(outcome.status, RunStatus::Succeeded);
        assert_eq!(outcome.attempt_count, 1);
        assert_eq!(outcome.progress, 100);
        assert!(!outcome.retried);
        assert!(outcome.started_at.is_some());
        assert!(outcome.finished_at.is_some());

        let stored = store.get(run.id).unwrap().unwrap();
        assert_eq!(stored.snapshot.status, RunStatus::Succeeded);
        assert_eq!(stored.output, Some(json!({ "echo": json!({"platform": "ios"}) })));
        assert_eq!(stored.error_message, None);

        assert_eq!(
            event_kinds(&sink),
            vec![TelemetryEventKind::Started, TelemetryEventKind::Succeeded]
        );
    }

    #[test]
    fn transient_failures_retry_with_exponential_backoff_until_exhausted() {
        let (store, sink) = setup();
        let run = seed_queued(&store);

        let dispatcher = Dispatcher::new(
            store.clone(),
            FnRunExecutor::new(|_: &RunRecord| {
                Err::<serde_json::Value, _>(ExecutionError::transient("upstream timed out"))
            }),
            sink.clone(),
        );

        // Attempt 1: fails, re-queued with a 30s backoff.
        let report = dispatcher.dispatch_queued(&DispatchRequest::default()).unwrap();
        let outcome = &report.outcomes[0];
        assert_eq!(outcome.status, RunStatus::Queued);
        assert!(outcome.retried);
        assert_eq!(outcome.attempt_count, 1);
        let first_delay = outcome.next_retry_at.unwrap() - Utc::now();
        assert!((29..=31).contains(&first_delay.num_seconds()));

        // Still backing off, so the next pass finds nothing due.
        let idle = dispatcher.dispatch_queued(&DispatchRequest::default()).unwrap();
        assert_eq!(idle.processed, 0);

        // Attempt 2: 60s backoff.
        clear_backoff(&store, run.id);
        let report = dispatcher.dispatch_queued(&DispatchRequest::default()).unwrap();
        let outcome = &report.outcomes[0];
        assert_eq!(outcome.status, RunStatus::Queued);
        assert_eq!(outcome.attempt_count, 2);
        let second_delay = outcome.next_retry_at.unwrap() - Utc::now();
        assert!((59..=61).contains(&second_delay.num_seconds()));

        // Attempt 3 hits the ceiling: terminally failed, no further backoff.
        clear_backoff(&store, run.id);
        let report = dispatcher.dispatch_queued(&DispatchRequest::default()).unwrap();
        let outcome = &report.outcomes[0];
        assert_eq!(outcome.status, RunStatus::Failed);
        assert!(!outcome.retried);
        assert_eq!(outcome.attempt_count, 3);
        assert_eq!(outcome.next_retry_at, None);

        let stored = store.get(run.id).unwrap().unwrap();
        assert_eq!(stored.snapshot.status, RunStatus::Failed);
        assert_eq!(stored.error_message.as_deref(), Some("upstream timed out"));

        assert_eq!(
            event_kinds(&sink),
            vec![
                TelemetryEventKind::Started,
                TelemetryEventKind::Failed,
                TelemetryEventKind::RetryScheduled,
                TelemetryEventKind::Started,
                TelemetryEventKind::Failed,
                TelemetryEventKind::RetryScheduled,
                TelemetryEventKind::Started,
                TelemetryEventKind::Failed,
            ]
        );
    }

    #[test]
    fn permanent_failure_is_never_retried() {
        let (store, sink) = setup();
        let run = seed_queued(&store);

        let dispatcher = Dispatcher::new(
            store.clone(),
            FnRunExecutor::new(|_: &RunRecord| {
                Err::<serde_json::Value, _>(ExecutionError::permanent("invalid manifest"))
            }),
            sink.clone(),
        );
        let report = dispatcher.dispatch_queued(&DispatchRequest::default()).unwrap();

        let outcome = &report.outcomes[0];
        assert_eq!(outcome.status, RunStatus::Failed);
        assert!(!outcome.retried);
        assert_eq!(outcome.attempt_count, 1);

        let stored = store.get(run.id).unwrap().unwrap();
        assert_eq!(stored.error_message.as_deref(), Some("invalid manifest"));
        assert!(!event_kinds(&sink).contains(&TelemetryEventKind::RetryScheduled));
    }

    #[test]
    fn non_retryable_run_fails_terminally_on_first_transient_error() {
        let (store, sink) = setup();
        let run = RunRecord::queued(ProjectId::new(), UserId::new(), json!({}))
            .with_retryable(false);
        store.insert(run.clone()).unwrap();

        let dispatcher = Dispatcher::new(
            store.clone(),
            FnRunExecutor::new(|_: &RunRecord| {
                Err::<serde_json::Value, _>(ExecutionError::transient("flaky network"))
            }),
            sink.clone(),
        );
        let report = dispatcher.dispatch_queued(&DispatchRequest::default()).unwrap();

        assert_eq!(report.outcomes[0].status, RunStatus::Failed);
        assert!(!report.outcomes[0].retried);
        assert!(!event_kinds(&sink).contains(&TelemetryEventKind::RetryScheduled));
    }

    #[test]
    fn cancel_requested_queued_run_is_finalized_and_never_dispatched() {
        let (store, sink) = setup();
        let run = seed_queued(&store);

        let patched = apply_patch(
            &store,
            run.id,
            &PatchRequest::operation(RunOperation::RequestCancel),
        )
        .unwrap();
        assert_eq!(patched.snapshot.status, RunStatus::Cancelled);
        assert!(patched.snapshot.finished_at.is_some());

        let dispatcher = Dispatcher::new(
            store.clone(),
            FnRunExecutor::new(|_: &RunRecord| Ok(json!({}))),
            sink.clone(),
        );
        let report = dispatcher.dispatch_queued(&DispatchRequest::default()).unwrap();
        assert_eq!(report.processed, 0);
        assert!(sink.is_empty());
    }

    #[test]
    fn runs_with_future_backoff_are_skipped() {
        let (store, sink) = setup();
        let run = seed_queued(&store);
        let mut pending = store.get(run.id).unwrap().unwrap();
        pending.snapshot.next_retry_at = Some(Utc::now() + Duration::minutes(5));
        store.replace(pending);

        let dispatcher = Dispatcher::new(
            store.clone(),
            FnRunExecutor::new(|_: &RunRecord| Ok(json!({}))),
            sink.clone(),
        );
        let report = dispatcher.dispatch_queued(&DispatchRequest::default()).unwrap();
        assert_eq!(report.processed, 0);
    }

    #[test]
    fn dispatch_processes_oldest_runs_first_up_to_limit() {
        let (store, sink) = setup();
        let first = seed_queued(&store);
        let mut older = store.get(first.id).unwrap().unwrap();
        older.created_at = Utc::now() - Duration::hours(1);
        store.replace(older);
        let second = seed_queued(&store);
        let _third = seed_queued(&store);

        let dispatcher = Dispatcher::new(
            store.clone(),
            FnRunExecutor::new(|_: &RunRecord| Ok(json!({}))),
            sink.clone(),
        );
        let report = dispatcher
            .dispatch_queued(&DispatchRequest::default().with_limit(2))
            .unwrap();

        assert_eq!(report.processed, 2);
        assert_eq!(report.outcomes[0].run_id, first.id);
        assert_eq!(report.outcomes[1].run_id, second.id);
        assert_eq!(store.stats().unwrap().queued, 1);
    }

    #[test]
    fn telemetry_carries_the_session_id() {
        let (store, sink) = setup();
        seed_queued(&store);

        let dispatcher = Dispatcher::new(
            store.clone(),
            FnRunExecutor::new(|_: &RunRecord| Ok(json!({}))),
            sink.clone(),
        );
        dispatcher
            .dispatch_queued(
                &DispatchRequest::default().with_telemetry_session_id("session-42"),
            )
            .unwrap();

        let events = sink.events();
        assert!(!events.is_empty());
        assert!(events.iter().all(|e| e.session_id.as_deref() == Some("session-42")));
    }

    /// Seed a running row whose last liveness signal is `age` in the past.
    fn seed_stale_running(store: &Arc<InMemoryRunStore>, age: Duration, retryable: bool) -> RunRecord {
        let mut run = RunRecord::queued(ProjectId::new(), UserId::new(), json!({}))
            .with_retryable(retryable);
        run.snapshot.status = RunStatus::Running;
        run.snapshot.attempt_count = 1;
        run.snapshot.progress = 10;
        run.snapshot.started_at = Some(Utc::now() - age);
        store.insert(run.clone()).unwrap();
        run
    }

    #[test]
    fn watchdog_requeues_stale_retryable_run() {
        let (store, sink) = setup();
        let run = seed_stale_running(&store, Duration::minutes(30), true);

        let watchdog = Watchdog::new(store.clone(), sink.clone());
        let report = watchdog
            .recover_stale_running(&WatchdogRequest::default())
            .unwrap();

        assert_eq!(report.scanned, 1);
        assert_eq!(report.stale, 1);
        assert_eq!(report.recovered, 1);
        assert_eq!(report.retried, 1);
        assert_eq!(report.failed, 0);

        let stored = store.get(run.id).unwrap().unwrap();
        assert_eq!(stored.snapshot.status, RunStatus::Queued);
        assert_eq!(stored.snapshot.attempt_count, 1);
        assert!(stored.snapshot.next_retry_at.is_some());
        // Re-queueing wipes the failure reason; the marker output survives
        // until the next attempt finishes.
        assert_eq!(stored.error_message, None);
        assert_eq!(stored.output, Some(json!({ "watchdog": true })));

        assert_eq!(
            event_kinds(&sink),
            vec![
                TelemetryEventKind::WatchdogMarkedFailed,
                TelemetryEventKind::WatchdogRetried,
            ]
        );
    }

    #[test]
    fn watchdog_leaves_non_retryable_stale_run_failed() {
        let (store, sink) = setup();
        let run = seed_stale_running(&store, Duration::minutes(30), false);

        let watchdog = Watchdog::new(store.clone(), sink.clone());
        let report = watchdog
            .recover_stale_running(&WatchdogRequest::default())
            .unwrap();

        assert_eq!(report.retried, 0);
        assert_eq!(report.failed, 1);
        let stored = store.get(run.id).unwrap().unwrap();
        assert_eq!(stored.snapshot.status, RunStatus::Failed);
        assert!(stored.snapshot.finished_at.is_some());
        assert_eq!(stored.error_message.as_deref(), Some(WATCHDOG_FAILURE_MESSAGE));

        assert_eq!(
            event_kinds(&sink),
            vec![
                TelemetryEventKind::WatchdogMarkedFailed,
                TelemetryEventKind::WatchdogTerminalFailure,
            ]
        );
    }

    #[test]
    fn watchdog_ignores_runs_within_the_threshold() {
        let (store, sink) = setup();
        let mut run = RunRecord::queued(ProjectId::new(), UserId::new(), json!({}));
        run.snapshot.status = RunStatus::Running;
        run.snapshot.attempt_count = 1;
        run.snapshot.started_at = Some(Utc::now() - Duration::hours(1));
        run.snapshot.last_heartbeat_at = Some(Utc::now() - Duration::seconds(30));
        store.insert(run).unwrap();

        let watchdog = Watchdog::new(store.clone(), sink.clone());
        let report = watchdog
            .recover_stale_running(&WatchdogRequest::default())
            .unwrap();

        assert_eq!(report.scanned, 1);
        assert_eq!(report.stale, 0);
        assert_eq!(report.recovered, 0);
        assert!(sink.is_empty());
    }

    #[test]
    fn watchdog_threshold_is_tunable_per_request() {
        let (store, sink) = setup();
        // 2 minutes old: fresh for the default 10-minute threshold, stale for 60s.
        seed_stale_running(&store, Duration::minutes(2), true);

        let watchdog = Watchdog::new(store.clone(), sink.clone());
        let default_pass = watchdog
            .recover_stale_running(&WatchdogRequest::default())
            .unwrap();
        assert_eq!(default_pass.stale, 0);

        let tight_pass = watchdog
            .recover_stale_running(&WatchdogRequest::default().with_stale_after_seconds(60))
            .unwrap();
        assert_eq!(tight_pass.stale, 1);
        assert_eq!(tight_pass.recovered, 1);
    }

    #[test]
    fn recovered_run_is_dispatchable_again_after_backoff() {
        let (store, sink) = setup();
        let run = seed_stale_running(&store, Duration::minutes(30), true);

        Watchdog::new(store.clone(), sink.clone())
            .recover_stale_running(&WatchdogRequest::default())
            .unwrap();

        let mut requeued = store.get(run.id).unwrap().unwrap();
        requeued.snapshot.next_retry_at = None;
        store.replace(requeued);

        let dispatcher = Dispatcher::new(
            store.clone(),
            FnRunExecutor::new(|_: &RunRecord| Ok(json!({ "recovered": true }))),
            sink.clone(),
        );
        let report = dispatcher.dispatch_queued(&DispatchRequest::default()).unwrap();

        assert_eq!(report.processed, 1);
        let outcome = &report.outcomes[0];
        assert_eq!(outcome.status, RunStatus::Succeeded);
        assert_eq!(outcome.attempt_count, 2);

        let stored = store.get(run.id).unwrap().unwrap();
        assert_eq!(stored.output, Some(json!({ "recovered": true })));
        assert_eq!(stored.error_message, None);
    }
}
