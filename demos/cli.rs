// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! CLI tool to run example scenarios on a dispatch engine.
//!
//! Run with `RUST_LOG=debug` and `--features log` to see the engine's logs.

use clap::{Parser, ValueEnum};
use dispatch_lanes::{
    status_code, ClearScope, CpuPinningPolicy, DispatchEngine, EngineBuilder, LaneCaps, Priority,
    Task, ThreadCount,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha12Rng;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let engine = Arc::new(
        EngineBuilder {
            num_threads: match cli.num_threads {
                Some(num_threads) => ThreadCount::Count(num_threads),
                None => ThreadCount::ONE,
            },
            name: cli.name.clone(),
            poll_interval: Duration::from_millis(cli.poll_interval_ms),
            lane_caps: LaneCaps {
                dropable: Some(cli.dropable_cap),
                ..LaneCaps::UNBOUNDED
            },
            cpu_pinning: if cli.pin_cpus {
                CpuPinningPolicy::IfSupported
            } else {
                CpuPinningPolicy::No
            },
        }
        .build()
        .expect("failed to build the engine"),
    );

    match cli.scenario {
        Scenario::Mixed => mixed(&engine),
        Scenario::Priorities => priorities(&engine, cli.num_tasks),
        Scenario::Overload => overload(&engine, cli.num_tasks),
        Scenario::Delays => delays(&engine, cli.num_tasks),
    }

    println!("stats = {:?}", engine.stats());
}

/// Mix of immediate, delayed, high-priority and re-entrant synchronous tasks.
fn mixed(engine: &Arc<DispatchEngine>) {
    let value = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();

    engine
        .submit_delayed(Duration::from_secs(2), Priority::Normal, report(&value, 3, start))
        .unwrap();
    std::thread::scope(|scope| {
        scope.spawn(|| {
            engine.submit_async(Priority::Normal, report(&value, 1, start)).unwrap();
            engine
                .submit_delayed(Duration::from_millis(500), Priority::Normal, report(&value, 3, start))
                .unwrap();
            engine.submit_async(Priority::High, report(&value, 2, start)).unwrap();
        });
    });

    engine
        .submit_sync(Priority::Normal, {
            let engine = engine.clone();
            let inner = report(&value, 4, start);
            move || {
                engine
                    .submit_async(Priority::Low, || println!("queued from a task"))
                    .unwrap();
                // Runs inline when the engine has a single worker.
                engine.submit_sync(Priority::Normal, inner.clone()).unwrap();
            }
        })
        .unwrap();
    engine
        .submit_async(Priority::Normal, || {
            println!("[{:?}] last task", std::thread::current().name())
        })
        .unwrap();

    std::thread::sleep(Duration::from_millis(2_500));
    println!("value = {}", value.load(Ordering::SeqCst));
}

/// Returns an action storing `v` and printing it with the current thread and
/// time.
fn report(value: &Arc<AtomicUsize>, v: usize, start: Instant) -> impl Fn() + Clone + Send + Sync {
    let value = value.clone();
    move || {
        value.store(v, Ordering::SeqCst);
        println!(
            "[{:?} @ {:?}] value = {v}",
            std::thread::current().name(),
            start.elapsed()
        );
    }
}

/// Random mix of priority classes, printing the execution order per class.
fn priorities(engine: &DispatchEngine, num_tasks: usize) {
    let order = Arc::new(Mutex::new(Vec::with_capacity(num_tasks)));
    let mut rng = ChaCha12Rng::seed_from_u64(42);
    for _ in 0..num_tasks {
        let priority = Priority::DESCENDING[rng.random_range(0..4)];
        let order = order.clone();
        engine
            .submit_async(priority, move || order.lock().unwrap().push(priority))
            .unwrap();
    }
    engine.submit_sync(Priority::Dropable, || ()).unwrap();

    let order = order.lock().unwrap();
    let mut runs: Vec<(Priority, usize)> = Vec::new();
    for &priority in order.iter() {
        match runs.last_mut() {
            Some((last, count)) if *last == priority => *count += 1,
            _ => runs.push((priority, 1)),
        }
    }
    println!("execution runs = {runs:?}");
}

/// Floods the engine with droppable tasks and reports the rejections.
fn overload(engine: &DispatchEngine, num_tasks: usize) {
    let executed = Arc::new(AtomicUsize::new(0));
    let mut codes = [0usize; 3];
    for _ in 0..num_tasks {
        let executed = executed.clone();
        let result = engine.submit_async(Priority::Dropable, move || {
            std::thread::sleep(Duration::from_micros(10));
            executed.fetch_add(1, Ordering::Relaxed);
        });
        codes[status_code(&result).unsigned_abs() as usize] += 1;
    }
    println!(
        "accepted = {}, rejected (null) = {}, rejected (overloaded) = {}",
        codes[0], codes[1], codes[2]
    );
    let discarded = engine.clear_queues(ClearScope::ReadyAndDelayed);
    println!(
        "executed = {}, discarded = {discarded}",
        executed.load(Ordering::Relaxed)
    );
}

/// Delayed tasks, reporting how late each one ran.
fn delays(engine: &DispatchEngine, num_tasks: usize) {
    let start = Instant::now();
    let tasks = (0..num_tasks)
        .map(|i| {
            let delay = Duration::from_millis(10 * i as u64);
            let task = Arc::new(Task::new(Priority::Normal, move || {
                println!("delay = {delay:?}, late by {:?}", start.elapsed().saturating_sub(delay));
            }));
            engine.submit_task_delayed(&task, delay).unwrap();
            task
        })
        .collect::<Vec<_>>();
    for task in &tasks {
        task.wait();
    }
}

/// CLI tool to run example scenarios on a dispatch engine.
#[derive(Parser, Debug, PartialEq, Eq)]
#[command(version)]
struct Cli {
    /// Number of worker threads. Default to a single thread.
    #[arg(long)]
    num_threads: Option<NonZeroUsize>,

    /// Name of the engine.
    #[arg(long, default_value = "demo")]
    name: String,

    /// Scenario to run.
    #[arg(long, value_enum)]
    scenario: Scenario,

    /// Number of tasks to submit.
    #[arg(long, default_value_t = 4_096)]
    num_tasks: usize,

    /// Cap of the droppable lanes.
    #[arg(long, default_value_t = dispatch_lanes::DEFAULT_DROPABLE_CAP)]
    dropable_cap: usize,

    /// Longest idle sleep of a worker, in milliseconds.
    #[arg(long, default_value_t = 50)]
    poll_interval_ms: u64,

    /// Whether to pin worker threads to CPUs.
    #[arg(long, default_value_t = false)]
    pin_cpus: bool,
}

/// Scenario to run.
#[derive(ValueEnum, Clone, Debug, PartialEq, Eq)]
enum Scenario {
    /// Immediate, delayed, high-priority and nested synchronous tasks.
    Mixed,
    /// Random priorities.
    Priorities,
    /// More droppable tasks than the engine accepts.
    Overload,
    /// Delayed tasks.
    Delays,
}
