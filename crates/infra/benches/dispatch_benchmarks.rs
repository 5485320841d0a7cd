use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use chrono::Utc;
use serde_json::json;

use runway_core::{ProjectId, UserId};
use runway_infra::dispatcher::{DispatchRequest, Dispatcher};
use runway_infra::executor::FnRunExecutor;
use runway_infra::run_store::{InMemoryRunStore, RunStore};
use runway_telemetry::NoopTelemetrySink;
use runway_runs::{
    compute_transition, retry_delay_seconds, PatchRequest, RunOperation, RunRecord, RunSnapshot,
};

fn seeded_store(queued: usize) -> InMemoryRunStore {
    let store = InMemoryRunStore::new();
    for i in 0..queued {
        let run = RunRecord::queued(ProjectId::new(), UserId::new(), json!({ "index": i }));
        store.insert(run).expect("seed run");
    }
    store
}

fn bench_transition_engine(c: &mut Criterion) {
    let mut group = c.benchmark_group("transition_engine");
    group.throughput(Throughput::Elements(1));

    let queued = RunSnapshot::queued(3, true);
    let start_patch = PatchRequest::default().with_progress(10);
    group.bench_function("start", |b| {
        b.iter(|| {
            compute_transition(
                black_box(&queued),
                RunOperation::Start,
                black_box(&start_patch),
                Utc::now(),
            )
        })
    });

    let mut running = RunSnapshot::queued(3, true);
    running.status = runway_runs::RunStatus::Running;
    running.attempt_count = 1;
    let complete_patch = PatchRequest::default().with_output(json!({ "artifact": "app.ipa" }));
    group.bench_function("complete", |b| {
        b.iter(|| {
            compute_transition(
                black_box(&running),
                RunOperation::Complete,
                black_box(&complete_patch),
                Utc::now(),
            )
        })
    });

    group.bench_function("retry_delay", |b| {
        b.iter(|| {
            for attempt in 1..=10u32 {
                black_box(retry_delay_seconds(black_box(attempt)));
            }
        })
    });

    group.finish();
}

fn bench_dispatch_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatch_batch");

    for batch in [1usize, 5, 20] {
        group.throughput(Throughput::Elements(batch as u64));
        group.bench_with_input(BenchmarkId::from_parameter(batch), &batch, |b, &batch| {
            b.iter_batched(
                || {
                    let store = seeded_store(batch);
                    let dispatcher = Dispatcher::new(
                        store,
                        FnRunExecutor::new(|run: &RunRecord| Ok(run.input.clone())),
                        NoopTelemetrySink,
                    );
                    (dispatcher, DispatchRequest::default().with_limit(batch))
                },
                |(dispatcher, request)| {
                    let report = dispatcher.dispatch_queued(&request).expect("dispatch");
                    black_box(report)
                },
                criterion::BatchSize::SmallInput,
            )
        });
    }

    group.finish();
}

criterion_group!(benches, bench_transition_engine, bench_dispatch_batch);
criterion_main!(benches);
