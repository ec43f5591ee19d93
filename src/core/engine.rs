// Copyright 2024-2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! A pool of worker threads dispatching prioritized tasks.

use super::config::{
    ClearScope, CpuPinningPolicy, LaneCaps, ThreadCount, DEFAULT_POLL_INTERVAL,
};
use super::error::{BuildError, SubmitError, SyncError};
use super::lanes::{DelayedTask, LaneQueue};
use super::task::{Priority, Task};
use super::util::{lock, Status};
#[cfg(feature = "log_dispatch")]
use crate::macros::log_info;
use crate::macros::{log_debug, log_error, log_trace, log_warn};
use crossbeam_utils::CachePadded;
// Platforms that support `libc::sched_setaffinity()`.
#[cfg(all(
    not(miri),
    any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux"
    )
))]
use nix::{
    sched::{sched_setaffinity, CpuSet},
    unistd::Pid,
};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{JoinHandle, ThreadId};
use std::time::{Duration, Instant};

/// A builder for [`DispatchEngine`].
///
/// ```
/// # use dispatch_lanes::{CpuPinningPolicy, EngineBuilder, LaneCaps, ThreadCount};
/// # use std::time::Duration;
/// let engine = EngineBuilder {
///     num_threads: ThreadCount::try_from(4).unwrap(),
///     name: "io".to_owned(),
///     poll_interval: Duration::from_millis(10),
///     lane_caps: LaneCaps::default(),
///     cpu_pinning: CpuPinningPolicy::No,
/// }
/// .build()
/// .unwrap();
/// assert_eq!(engine.name(), "io");
/// assert_eq!(engine.num_threads().get(), 4);
/// ```
#[derive(Clone, Debug)]
pub struct EngineBuilder {
    /// Number of worker threads to spawn in the engine.
    pub num_threads: ThreadCount,
    /// Name of the engine, also used to name the worker threads.
    pub name: String,
    /// Longest time an idle worker sleeps before re-checking the delayed
    /// queue. Delayed tasks may run up to this long after their deadline.
    pub poll_interval: Duration,
    /// Per-class caps of the ready and delayed queues.
    pub lane_caps: LaneCaps,
    /// Policy to pin worker threads to CPUs.
    pub cpu_pinning: CpuPinningPolicy,
}

impl Default for EngineBuilder {
    /// A single unnamed worker, polling every 50 ms, with only the
    /// [`Dropable`](Priority::Dropable) lanes capped.
    fn default() -> Self {
        Self {
            num_threads: ThreadCount::ONE,
            name: String::new(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            lane_caps: LaneCaps::default(),
            cpu_pinning: CpuPinningPolicy::No,
        }
    }
}

impl EngineBuilder {
    /// Spawns an engine with this configuration.
    pub fn build(&self) -> Result<DispatchEngine, BuildError> {
        DispatchEngine::new(self)
    }
}

/// Creates an unnamed engine with the given number of worker threads.
pub fn create(num_threads: ThreadCount) -> Result<DispatchEngine, BuildError> {
    create_engine(num_threads, "")
}

/// Creates a named engine with a single worker thread.
pub fn create_named(name: impl Into<String>) -> Result<DispatchEngine, BuildError> {
    create_engine(ThreadCount::ONE, name)
}

/// Creates a named engine with the given number of worker threads, and the
/// default configuration otherwise.
pub fn create_engine(
    num_threads: ThreadCount,
    name: impl Into<String>,
) -> Result<DispatchEngine, BuildError> {
    EngineBuilder {
        num_threads,
        name: name.into(),
        ..EngineBuilder::default()
    }
    .build()
}

/// Number of tasks waiting in each queue.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PendingTasks {
    /// Tasks eligible to run now.
    pub ready: usize,
    /// Tasks waiting for their deadline.
    pub delayed: usize,
}

/// Counters of what an engine did since it was created.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Tasks run by a worker thread or inline, including the ones that
    /// panicked.
    pub executed: usize,
    /// Tasks whose action panicked.
    pub panicked: usize,
    /// Submissions rejected, for a missing action or a full lane.
    pub rejected: usize,
    /// Delayed tasks moved to the ready queue.
    pub promoted: usize,
    /// Tasks signaled without running by a clear operation.
    pub discarded: usize,
}

/// Cache-padded counters backing [`EngineStats`].
#[derive(Default)]
struct Counters {
    executed: CachePadded<AtomicUsize>,
    panicked: CachePadded<AtomicUsize>,
    rejected: CachePadded<AtomicUsize>,
    promoted: CachePadded<AtomicUsize>,
    discarded: CachePadded<AtomicUsize>,
}

impl Counters {
    fn add(counter: &AtomicUsize, n: usize) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    fn snapshot(&self) -> EngineStats {
        EngineStats {
            executed: self.executed.load(Ordering::Relaxed),
            panicked: self.panicked.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            promoted: self.promoted.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
        }
    }
}

/// The ready and delayed queues, always locked together.
struct Queues {
    ready: LaneQueue<Arc<Task>>,
    delayed: LaneQueue<DelayedTask>,
}

impl Queues {
    /// Moves every delayed task whose deadline is not after `now` to the ready
    /// queue. Returns the number of promoted tasks.
    fn promote_due(&mut self, now: Instant) -> usize {
        if self.delayed.is_empty() {
            return 0;
        }
        let due = self.delayed.drain_where(|delayed| delayed.deadline <= now);
        let count = due.len();
        for delayed in due {
            self.ready.push_to(delayed.priority, delayed.task);
        }
        count
    }

    /// Earliest deadline in the delayed queue.
    fn next_deadline(&self) -> Option<Instant> {
        self.delayed.iter().map(|delayed| delayed.deadline).min()
    }
}

/// Returns the instant `delay` after `now`. A delay beyond what [`Instant`] can
/// represent is shortened to the furthest representable deadline.
fn deadline_after(now: Instant, delay: Duration) -> Instant {
    let mut delay = delay;
    loop {
        if let Some(deadline) = now.checked_add(delay) {
            return deadline;
        }
        delay /= 2;
    }
}

/// State shared between the engine handle and its worker threads.
struct Shared {
    /// Name of the engine.
    name: String,
    /// Ready and delayed queues.
    queues: Mutex<Queues>,
    /// Wake condition for idle workers. The value counts notifications and is
    /// only informative.
    wake: Status<u64>,
    /// Set once when the engine is dropped.
    canceled: CachePadded<AtomicBool>,
    /// Longest idle sleep of a worker.
    poll_interval: Duration,
    /// Per-class queue caps.
    lane_caps: LaneCaps,
    /// Statistics.
    counters: Counters,
}

impl Shared {
    fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }

    /// Counts a rejected submission.
    fn reject(&self, error: SubmitError) -> Result<(), SubmitError> {
        Counters::add(&self.counters.rejected, 1);
        log_trace!("[engine {}] Rejected a task: {error}", self.name);
        Err(error)
    }

    /// Checks that a lane currently holding `len` tasks can take one more
    /// task of the given class.
    fn check_capacity(&self, priority: Priority, len: usize) -> Result<(), SubmitError> {
        match self.lane_caps.get(priority) {
            Some(cap) if len >= cap => self.reject(SubmitError::Overloaded { priority, cap }),
            _ => Ok(()),
        }
    }

    /// Wakes one idle worker.
    fn wake_one(&self) {
        self.wake.notify_one_with(|count| *count = count.wrapping_add(1));
    }

    /// Runs a task, isolating any panic, and signals it.
    fn execute(&self, task: &Task) {
        if !task.run_isolated() {
            Counters::add(&self.counters.panicked, 1);
        }
        Counters::add(&self.counters.executed, 1);
        task.signal();
    }
}

/// A fixed pool of worker threads running prioritized tasks.
///
/// Tasks are queued in four priority lanes: a queued [`High`](Priority::High)
/// task always runs before queued tasks of lower classes, and tasks of the
/// same class run in submission order. Delayed tasks wait in a separate queue
/// until their deadline, then join the back of their lane.
///
/// Dropping the engine stops the workers once their current task is done and
/// joins them. Queued tasks that didn't start are abandoned without being
/// signaled.
///
/// ```
/// # use dispatch_lanes::{create_named, Priority};
/// # use std::sync::atomic::{AtomicUsize, Ordering};
/// # use std::sync::Arc;
/// let engine = create_named("demo").unwrap();
/// let counter = Arc::new(AtomicUsize::new(0));
///
/// for _ in 0..10 {
///     let counter = counter.clone();
///     engine
///         .submit_async(Priority::Normal, move || {
///             counter.fetch_add(1, Ordering::Relaxed);
///         })
///         .unwrap();
/// }
///
/// // With a single worker, a low-priority task runs after the normal ones that
/// // are already queued.
/// engine.submit_sync(Priority::Low, || ()).unwrap();
/// assert_eq!(counter.load(Ordering::Relaxed), 10);
/// ```
pub struct DispatchEngine {
    /// State shared with the worker threads.
    shared: Arc<Shared>,
    /// Handles to all the worker threads in the engine.
    threads: Vec<WorkerThreadHandle>,
    /// Identities of the worker threads, fixed before the constructor returns.
    worker_ids: Box<[ThreadId]>,
}

/// Handle to a worker thread in an engine.
struct WorkerThreadHandle {
    /// Thread handle object.
    handle: JoinHandle<()>,
}

impl DispatchEngine {
    /// Creates a new engine using the given parameters.
    fn new(builder: &EngineBuilder) -> Result<Self, BuildError> {
        let num_threads: usize = builder.num_threads.count().into();

        #[cfg(any(
            miri,
            not(any(
                target_os = "android",
                target_os = "dragonfly",
                target_os = "freebsd",
                target_os = "linux"
            ))
        ))]
        match builder.cpu_pinning {
            CpuPinningPolicy::No => (),
            CpuPinningPolicy::IfSupported => {
                log_warn!("Pinning threads to CPUs is not implemented on this platform.")
            }
            CpuPinningPolicy::Always => return Err(BuildError::CpuPinningUnsupported),
        }

        let shared = Arc::new(Shared {
            name: builder.name.clone(),
            queues: Mutex::new(Queues {
                ready: LaneQueue::new(),
                delayed: LaneQueue::new(),
            }),
            wake: Status::new(0),
            canceled: CachePadded::new(AtomicBool::new(false)),
            poll_interval: builder.poll_interval,
            lane_caps: builder.lane_caps,
            counters: Counters::default(),
        });

        // Dropping a partially built engine cancels and joins the threads
        // spawned so far.
        let mut engine = DispatchEngine {
            shared,
            threads: Vec::with_capacity(num_threads),
            worker_ids: Box::new([]),
        };

        let (pinned_tx, pinned_rx) = mpsc::channel();
        for id in 0..num_threads {
            let context = WorkerContext {
                #[cfg(feature = "log")]
                id,
                shared: engine.shared.clone(),
            };
            let pinned_tx = pinned_tx.clone();
            let cpu_pinning = builder.cpu_pinning;
            let handle = std::thread::Builder::new()
                .name(format!("{id}_{}", builder.name))
                .spawn(move || {
                    // The receiver is gone only if building the engine already failed.
                    let _ = pinned_tx.send((id, pin_to_cpu(id, cpu_pinning)));
                    drop(pinned_tx);
                    context.run()
                })
                .map_err(|source| BuildError::Spawn { thread: id, source })?;
            engine.threads.push(WorkerThreadHandle { handle });
        }
        drop(pinned_tx);
        engine.worker_ids = engine
            .threads
            .iter()
            .map(|t| t.handle.thread().id())
            .collect();
        log_debug!(
            "[engine {}] Spawned {num_threads} worker threads",
            builder.name
        );

        for (id, pinned) in pinned_rx.iter() {
            match (pinned, builder.cpu_pinning) {
                (Ok(()), _) => (),
                (Err(source), CpuPinningPolicy::Always) => {
                    return Err(BuildError::CpuPinning { thread: id, source })
                }
                (Err(_e), _) => {
                    log_warn!("Failed to set CPU affinity for thread #{id}: {_e}")
                }
            }
        }

        Ok(engine)
    }

    /// Returns the name of this engine.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Returns the number of worker threads that have been spawned in this
    /// engine.
    pub fn num_threads(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.worker_ids.len()).unwrap_or(NonZeroUsize::MIN)
    }

    /// Returns the number of tasks waiting in each queue.
    pub fn pending(&self) -> PendingTasks {
        let queues = lock(&self.shared.queues);
        PendingTasks {
            ready: queues.ready.len(),
            delayed: queues.delayed.len(),
        }
    }

    /// Returns the statistics of this engine.
    pub fn stats(&self) -> EngineStats {
        self.shared.counters.snapshot()
    }

    /// Queues the action to run as soon as a worker is available.
    ///
    /// Returns [`SubmitError::Overloaded`] if the ready lane of the given
    /// class is full.
    pub fn submit_async(
        &self,
        priority: Priority,
        action: impl Fn() + Send + Sync + 'static,
    ) -> Result<(), SubmitError> {
        self.submit_task_async(&Arc::new(Task::new(priority, action)))
    }

    /// Queues the action to run once the given delay has elapsed.
    ///
    /// Returns [`SubmitError::Overloaded`] if the delayed lane (or the ready
    /// lane, for a zero delay) of the given class is full.
    pub fn submit_delayed(
        &self,
        delay: Duration,
        priority: Priority,
        action: impl Fn() + Send + Sync + 'static,
    ) -> Result<(), SubmitError> {
        self.submit_task_delayed(&Arc::new(Task::new(priority, action)), delay)
    }

    /// Runs the action on this engine and waits until it has completed.
    ///
    /// If the action panicked, the panic message is returned as
    /// [`SyncError::Panicked`].
    pub fn submit_sync(
        &self,
        priority: Priority,
        action: impl Fn() + Send + Sync + 'static,
    ) -> Result<(), SyncError> {
        let task = Arc::new(Task::new(priority, action));
        self.submit_task_sync(&task)?;
        match task.take_failure() {
            Some(failure) => Err(SyncError::Panicked(failure)),
            None => Ok(()),
        }
    }

    /// Queues the task to run as soon as a worker is available.
    ///
    /// The task's signal is reset before queuing, and set once the task has
    /// run. A rejected task is neither queued nor signaled.
    pub fn submit_task_async(&self, task: &Arc<Task>) -> Result<(), SubmitError> {
        if !task.has_action() {
            return self.shared.reject(SubmitError::NullAction);
        }
        let priority = task.priority();
        {
            let mut queues = lock(&self.shared.queues);
            self.shared
                .check_capacity(priority, queues.ready.lane_len(priority))?;
            task.reset();
            queues.ready.push_to(priority, task.clone());
        }
        log_trace!(
            "[engine {}] Queued a {priority:?} task",
            self.shared.name
        );
        self.shared.wake_one();
        Ok(())
    }

    /// Queues the task to run once the given delay has elapsed.
    ///
    /// A zero delay is the same as [`submit_task_async()`]. The task may run
    /// up to one poll interval after its deadline. The task is promoted to
    /// the lane of the class it had when submitted, even if its priority
    /// changes in the meantime.
    ///
    /// [`submit_task_async()`]: Self::submit_task_async
    pub fn submit_task_delayed(
        &self,
        task: &Arc<Task>,
        delay: Duration,
    ) -> Result<(), SubmitError> {
        if delay.is_zero() {
            return self.submit_task_async(task);
        }
        if !task.has_action() {
            return self.shared.reject(SubmitError::NullAction);
        }
        let priority = task.priority();
        let deadline = deadline_after(Instant::now(), delay);
        {
            let mut queues = lock(&self.shared.queues);
            self.shared
                .check_capacity(priority, queues.delayed.lane_len(priority))?;
            task.reset();
            queues.delayed.push(DelayedTask {
                deadline,
                priority,
                task: task.clone(),
            });
        }
        log_trace!(
            "[engine {}] Queued a {priority:?} task delayed by {delay:?}",
            self.shared.name
        );
        self.shared.wake_one();
        Ok(())
    }

    /// Runs the task on this engine and waits until it has completed.
    ///
    /// When called from the only worker thread of a single-threaded engine
    /// (i.e. from within a running task), the task runs inline on the calling
    /// thread, as waiting for the worker would never end. Otherwise the task
    /// is queued like with [`submit_task_async()`] and this blocks until it
    /// is signaled: either after it ran, or when it is discarded by
    /// [`clear()`].
    ///
    /// A rejected task is returned as an error without waiting. A panic of
    /// the action is stored on the task, see [`Task::failure()`].
    ///
    /// [`submit_task_async()`]: Self::submit_task_async
    /// [`clear()`]: Self::clear
    pub fn submit_task_sync(&self, task: &Arc<Task>) -> Result<(), SubmitError> {
        if self.is_sole_worker(std::thread::current().id()) {
            if !task.has_action() {
                return self.shared.reject(SubmitError::NullAction);
            }
            log_trace!(
                "[engine {}] Running a synchronous task inline",
                self.shared.name
            );
            task.reset();
            self.shared.execute(task);
            return Ok(());
        }
        self.submit_task_async(task)?;
        task.wait();
        Ok(())
    }

    /// Returns whether the given thread is the only worker of this engine.
    fn is_sole_worker(&self, thread: ThreadId) -> bool {
        self.worker_ids.len() == 1 && self.worker_ids.contains(&thread)
    }

    /// Discards all the tasks of the ready queue without running them, and
    /// signals them. Returns the number of discarded tasks.
    ///
    /// Delayed tasks are left untouched: they still run once due. Use
    /// [`clear_queues()`](Self::clear_queues) to discard them too.
    pub fn clear(&self) -> usize {
        self.clear_queues(ClearScope::Ready)
    }

    /// Discards all the tasks of the given queues without running them, and
    /// signals them. Returns the number of discarded tasks.
    pub fn clear_queues(&self, scope: ClearScope) -> usize {
        let discarded = {
            let mut queues = lock(&self.shared.queues);
            let mut discarded = queues.ready.drain().collect::<Vec<_>>();
            if scope == ClearScope::ReadyAndDelayed {
                discarded.extend(queues.delayed.drain().map(|delayed| delayed.task));
            }
            discarded
        };
        for task in &discarded {
            task.signal();
        }
        let count = discarded.len();
        Counters::add(&self.shared.counters.discarded, count);
        log_debug!(
            "[engine {}] Discarded {count} tasks ({scope:?})",
            self.shared.name
        );
        count
    }

    #[cfg(feature = "log_dispatch")]
    fn print_statistics(&self) {
        let stats = self.stats();
        let pending = self.pending();
        log_info!(
            "[engine {}] Statistics: {stats:?}, abandoned: {pending:?}",
            self.shared.name
        );
    }
}

impl Drop for DispatchEngine {
    /// Stops and joins all the worker threads.
    #[allow(clippy::unused_enumerate_index)]
    fn drop(&mut self) {
        log_debug!(
            "[engine {}] Notifying threads to finish...",
            self.shared.name
        );
        self.shared.canceled.store(true, Ordering::Release);
        self.shared.wake.wake_all();

        log_debug!(
            "[engine {}] Joining threads in the engine...",
            self.shared.name
        );
        let current = std::thread::current().id();
        let mut failed_joins = 0;
        for (_i, t) in self.threads.drain(..).enumerate() {
            if t.handle.thread().id() == current {
                log_warn!(
                    "[engine {}] Dropped from worker thread {_i}, which exits after its current task",
                    self.shared.name
                );
                continue;
            }
            let result = t.handle.join();
            match result {
                Ok(_) => log_debug!("[engine] Thread {_i} joined with result: {result:?}"),
                Err(_) => {
                    log_error!("[engine] Thread {_i} joined with result: {result:?}");
                    failed_joins += 1;
                }
            }
        }
        log_debug!("[engine {}] Joined threads.", self.shared.name);

        #[cfg(feature = "log_dispatch")]
        self.print_statistics();

        if failed_joins != 0 && !std::thread::panicking() {
            panic!("{failed_joins} worker thread(s) of the engine failed to join");
        }
    }
}

/// Pins the calling thread to the CPU of the given index, if the policy asks
/// for it.
#[cfg(all(
    not(miri),
    any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux"
    )
))]
fn pin_to_cpu(id: usize, cpu_pinning: CpuPinningPolicy) -> std::io::Result<()> {
    match cpu_pinning {
        CpuPinningPolicy::No => Ok(()),
        CpuPinningPolicy::IfSupported | CpuPinningPolicy::Always => {
            let mut cpu_set = CpuSet::new();
            cpu_set.set(id)?;
            sched_setaffinity(Pid::from_raw(0), &cpu_set)?;
            log_debug!("Pinned thread #{id} to CPU #{id}");
            Ok(())
        }
    }
}

#[cfg(any(
    miri,
    not(any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux"
    ))
))]
fn pin_to_cpu(_id: usize, _cpu_pinning: CpuPinningPolicy) -> std::io::Result<()> {
    Ok(())
}

/// Context object owned by a worker thread.
struct WorkerContext {
    /// Thread index.
    #[cfg(feature = "log")]
    id: usize,
    /// State shared with the engine.
    shared: Arc<Shared>,
}

impl WorkerContext {
    /// Main function run by this thread.
    fn run(&self) {
        log_debug!("[thread {}] Entering the dispatch loop", self.id);
        while !self.shared.is_canceled() {
            self.wait_for_work();
            while !self.shared.is_canceled() {
                let Some(task) = self.next_task() else {
                    break;
                };
                log_trace!(
                    "[thread {}] Running a {:?} task",
                    self.id,
                    task.priority()
                );
                self.shared.execute(&task);
            }
        }
        log_debug!("[thread {}] Received finish signal", self.id);
    }

    /// Promotes the due delayed tasks and pops the highest-priority ready
    /// task, atomically with respect to the other workers.
    fn next_task(&self) -> Option<Arc<Task>> {
        let mut queues = lock(&self.shared.queues);
        let promoted = queues.promote_due(Instant::now());
        if promoted != 0 {
            Counters::add(&self.shared.counters.promoted, promoted);
            log_trace!("[thread {}] Promoted {promoted} delayed tasks", self.id);
        }
        queues.ready.pop()
    }

    /// Sleeps until a task is submitted, the engine is dropped, or a delayed
    /// task may be due.
    ///
    /// The sleep never exceeds the poll interval.
    fn wait_for_work(&self) {
        // Holding the wake lock while checking the queues: a submitter pushes
        // before taking this lock to notify, so the notification can't be
        // missed.
        let guard = self.shared.wake.lock();
        if self.shared.is_canceled() {
            return;
        }
        let timeout = {
            let queues = lock(&self.shared.queues);
            if !queues.ready.is_empty() {
                return;
            }
            match queues.next_deadline() {
                Some(deadline) => deadline
                    .saturating_duration_since(Instant::now())
                    .min(self.shared.poll_interval),
                None => self.shared.poll_interval,
            }
        };
        if timeout.is_zero() {
            return;
        }
        drop(self.shared.wake.wait_timeout(guard, timeout));
    }
}
