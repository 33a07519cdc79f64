use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;
use retrier_core::{Clock, ManualClock};
use retrier_infra::runs::backoff::{to_duration, with_jitter_from, BackoffState};
use retrier_infra::runs::{InMemoryRunStore, Retrier, RetryOptions, RunStatus};
use retrier_infra::scheduler::{FunctionRef, InMemoryJobScheduler, SchedulerWorker};

fn bench_backoff(c: &mut Criterion) {
    let mut group = c.benchmark_group("backoff");

    group.bench_function("jitter", |b| {
        let mut rng = StdRng::seed_from_u64(42);
        b.iter(|| black_box(to_duration(with_jitter_from(&mut rng, black_box(1000.0)))));
    });

    group.bench_function("failure_sequence_16", |b| {
        let options = RetryOptions::default();
        b.iter(|| {
            let mut state = BackoffState::from_options(&options);
            while state.has_budget() {
                state = state.after_wait().after_failure(black_box(options.base));
            }
            black_box(state)
        });
    });

    group.finish();
}

/// Start `runs` runs, then drive them all to completion with a manual clock.
///
/// A failing action is retried `max_failures` times per run.
fn drive_runs(runs: usize, fail: bool, max_failures: u32) {
    let clock = ManualClock::default();
    let shared: Arc<dyn Clock> = Arc::new(clock.clone());
    let scheduler = InMemoryJobScheduler::arc(shared.clone());
    let retrier = Retrier::new(Arc::new(InMemoryRunStore::new()), scheduler.clone(), shared);

    let mut worker = SchedulerWorker::new(scheduler.clone());
    retrier.register(&mut worker);
    worker.register_handler("bench.action", move |args| {
        if fail {
            Err("transient".to_string())
        } else {
            Ok(args.clone())
        }
    });

    let ids: Vec<_> = (0..runs)
        .map(|_| {
            retrier
                .start(
                    FunctionRef::new("bench.action"),
                    serde_json::json!({ "n": 1 }),
                    RetryOptions::default().with_max_failures(max_failures),
                )
                .unwrap()
        })
        .collect();

    while let Some(next) = scheduler.next_due_at() {
        clock.advance_to(next);
        worker.tick().unwrap();
    }

    for id in ids {
        assert!(matches!(retrier.status(id).unwrap(), RunStatus::Completed { .. }));
    }
}

fn bench_run_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("run_throughput");
    group.sample_size(20);

    for runs in [10usize, 100, 500].iter() {
        group.throughput(Throughput::Elements(*runs as u64));
        group.bench_with_input(BenchmarkId::new("succeed_first_try", runs), runs, |b, &runs| {
            b.iter(|| drive_runs(runs, false, 0));
        });
        group.bench_with_input(BenchmarkId::new("exhaust_3_retries", runs), runs, |b, &runs| {
            b.iter(|| drive_runs(runs, true, 3));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_backoff, bench_run_throughput);
criterion_main!(benches);
