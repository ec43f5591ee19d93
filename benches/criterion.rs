// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

const NUM_THREADS: &[usize] = &[1, 2, 4, 8];
const NUM_TASKS: &[usize] = &[1_000, 10_000, 100_000];

fn submit_async(c: &mut Criterion) {
    let mut group = c.benchmark_group("submit_async");
    for num_tasks in NUM_TASKS {
        group.throughput(Throughput::Elements(*num_tasks as u64));
        group.bench_with_input(
            BenchmarkId::new("serial", num_tasks),
            num_tasks,
            serial::run,
        );
        for &num_threads in NUM_THREADS {
            group.bench_with_input(
                BenchmarkId::new(format!("dispatch@{num_threads}"), num_tasks),
                num_tasks,
                |bencher, num_tasks| dispatch::submit_async(bencher, num_threads, num_tasks),
            );
        }
    }
    group.finish();
}

fn submit_sync(c: &mut Criterion) {
    let mut group = c.benchmark_group("submit_sync");
    for &num_threads in NUM_THREADS {
        group.bench_with_input(
            BenchmarkId::new("dispatch", num_threads),
            &num_threads,
            |bencher, num_threads| dispatch::submit_sync(bencher, *num_threads),
        );
    }
    group.finish();
}

/// Baseline benchmarks running the tasks on the current thread.
mod serial {
    use criterion::{black_box, Bencher};
    use std::sync::atomic::{AtomicU64, Ordering};

    pub fn run(bencher: &mut Bencher, num_tasks: &usize) {
        let counter = AtomicU64::new(0);
        bencher.iter(|| {
            for i in 0..*num_tasks as u64 {
                black_box(&counter).fetch_add(i, Ordering::Relaxed);
            }
        });
    }
}

/// Benchmarks using a dispatch engine.
mod dispatch {
    use criterion::{black_box, Bencher};
    use dispatch_lanes::{
        CompletionSignal, CpuPinningPolicy, EngineBuilder, LaneCaps, Priority, ThreadCount,
    };
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::sync::Arc;

    fn engine(num_threads: usize) -> dispatch_lanes::DispatchEngine {
        EngineBuilder {
            num_threads: ThreadCount::try_from(num_threads).unwrap(),
            name: "bench".to_owned(),
            cpu_pinning: CpuPinningPolicy::IfSupported,
            lane_caps: LaneCaps::UNBOUNDED,
            ..EngineBuilder::default()
        }
        .build()
        .unwrap()
    }

    pub fn submit_async(bencher: &mut Bencher, num_threads: usize, num_tasks: &usize) {
        let engine = engine(num_threads);
        let counter = Arc::new(AtomicU64::new(0));
        let done = Arc::new(CompletionSignal::new());

        bencher.iter(|| {
            let remaining = Arc::new(AtomicUsize::new(*num_tasks));
            for i in 0..*num_tasks as u64 {
                let counter = counter.clone();
                let remaining = remaining.clone();
                let done = done.clone();
                engine
                    .submit_async(Priority::Normal, move || {
                        black_box(&counter).fetch_add(i, Ordering::Relaxed);
                        if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                            done.signal();
                        }
                    })
                    .unwrap();
            }
            done.wait();
        });
    }

    pub fn submit_sync(bencher: &mut Bencher, num_threads: usize) {
        let engine = engine(num_threads);
        let counter = Arc::new(AtomicU64::new(0));
        bencher.iter(|| {
            let counter = counter.clone();
            engine
                .submit_sync(Priority::High, move || {
                    black_box(&counter).fetch_add(1, Ordering::Relaxed);
                })
                .unwrap()
        });
    }
}

criterion_group!(benches, submit_async, submit_sync);
criterion_main!(benches);
