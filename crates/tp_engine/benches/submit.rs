//! Submission throughput, grounded on the pack's `game_tasks` crate
//! (`[[bench]] name = "spawn"`, `harness = false`).

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use tp_engine::{Pool, TaskDescription};

fn submit_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("submit");

    for workers in [1, 4, 8] {
        let pool = Pool::new(workers);
        pool.start(false).unwrap();

        group.bench_with_input(BenchmarkId::from_parameter(workers), &workers, |b, _| {
            b.iter(|| {
                let promise = pool.submit(Box::new(|| {}), TaskDescription::new()).unwrap();
                pool.wait(&promise);
            });
        });

        pool.stop();
    }

    group.finish();
}

fn ring_queue_push_pop(c: &mut Criterion) {
    use tp_engine::RingQueue;

    c.bench_function("ring_queue_push_pop", |b| {
        let q = RingQueue::new(1024);
        b.iter(|| {
            q.push(1usize).unwrap();
            q.pop().unwrap();
        });
    });
}

criterion_group!(benches, submit_throughput, ring_queue_push_pop);
criterion_main!(benches);
