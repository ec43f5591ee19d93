// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Tasks, their priorities and their completion signals.

use super::util::{lock, Status};
use std::any::Any;
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

/// Scheduling class of a task.
///
/// Classes are strictly ordered: a queued [`High`](Self::High) task always
/// runs before any queued [`Normal`](Self::Normal) task, and so on. Within a
/// class, tasks run in submission order.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    /// Work that may be rejected when the engine is overloaded.
    Dropable,
    /// Background work.
    Low,
    /// Default class.
    #[default]
    Normal,
    /// Latency-sensitive work.
    High,
}

impl Priority {
    /// All the priority classes, in descending scheduling precedence.
    pub const DESCENDING: [Priority; 4] = [
        Priority::High,
        Priority::Normal,
        Priority::Low,
        Priority::Dropable,
    ];

    /// Index of this class's lane, where lane 0 is scanned first.
    pub(crate) fn lane(self) -> usize {
        match self {
            Priority::High => 0,
            Priority::Normal => 1,
            Priority::Low => 2,
            Priority::Dropable => 3,
        }
    }
}

/// Action wrapped in a [`Task`].
pub type Action = Box<dyn Fn() + Send + Sync>;

/// A two-state (unsignaled/signaled) primitive letting a waiter block until a
/// task finishes.
pub struct CompletionSignal {
    signaled: Status<bool>,
}

impl CompletionSignal {
    /// Creates a new unsignaled completion signal.
    pub fn new() -> Self {
        Self {
            signaled: Status::new(false),
        }
    }

    /// Sets the signal and wakes all waiters. Signaling twice is the same as
    /// signaling once.
    pub fn signal(&self) {
        self.signaled.notify_all(true);
    }

    /// Forces the signal back to the unsignaled state.
    pub fn reset(&self) {
        self.signaled.set(false);
    }

    /// Returns whether the signal is currently set.
    pub fn is_signaled(&self) -> bool {
        *self.signaled.lock()
    }

    /// Blocks until the signal is set, then resets it.
    pub fn wait(&self) {
        let mut guard = self.signaled.wait_while(|signaled| !*signaled);
        *guard = false;
    }

    /// Blocks until the signal is set or the timeout elapses.
    ///
    /// Returns `true` and resets the signal if it was set, or `false` if the
    /// timeout elapsed first (in which case the state is left untouched).
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (mut guard, timed_out) = self
            .signaled
            .wait_timeout_while(timeout, |signaled| !*signaled);
        if timed_out {
            false
        } else {
            *guard = false;
            true
        }
    }
}

impl Default for CompletionSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Failure captured when a task's action panicked.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskFailure {
    message: String,
}

impl TaskFailure {
    /// Builds a failure from a panic payload, as returned by
    /// [`std::panic::catch_unwind()`].
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_owned()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "task panicked with a non-string payload".to_owned()
        };
        Self { message }
    }

    /// Message of the panic.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// A unit of work: an action, a priority and a completion signal.
///
/// Tasks are shared as `Arc<Task>` between the submitter and the engine. The
/// same task may be submitted several times, its action runs once per
/// accepted submission.
///
/// ```
/// # use dispatch_lanes::{Priority, Task};
/// # use std::sync::atomic::{AtomicUsize, Ordering};
/// # use std::sync::Arc;
/// let counter = Arc::new(AtomicUsize::new(0));
/// let task = Task::new(Priority::High, {
///     let counter = counter.clone();
///     move || {
///         counter.fetch_add(1, Ordering::Relaxed);
///     }
/// });
///
/// task.run();
/// task.signal();
/// task.wait();
/// assert_eq!(counter.load(Ordering::Relaxed), 1);
/// ```
pub struct Task {
    action: Option<Action>,
    priority: Mutex<Priority>,
    signal: CompletionSignal,
    failure: Mutex<Option<TaskFailure>>,
}

impl Task {
    /// Creates a task running the given action with the given priority.
    pub fn new(priority: Priority, action: impl Fn() + Send + Sync + 'static) -> Self {
        Self::with_action(priority, Some(Box::new(action)))
    }

    /// Creates a task from an optional action. Submitting a task without
    /// action is rejected with [`SubmitError::NullAction`].
    ///
    /// [`SubmitError::NullAction`]: crate::SubmitError::NullAction
    pub fn with_action(priority: Priority, action: Option<Action>) -> Self {
        Self {
            action,
            priority: Mutex::new(priority),
            signal: CompletionSignal::new(),
            failure: Mutex::new(None),
        }
    }

    /// Returns whether this task carries an action.
    pub fn has_action(&self) -> bool {
        self.action.is_some()
    }

    /// Scheduling class of this task.
    pub fn priority(&self) -> Priority {
        *lock(&self.priority)
    }

    /// Changes the scheduling class of this task.
    ///
    /// This only affects future submissions: a queued task stays in the lane
    /// it was pushed into.
    pub fn set_priority(&self, priority: Priority) {
        *lock(&self.priority) = priority;
    }

    /// Runs the action once.
    ///
    /// A panicking action unwinds out of this function. Worker threads run it
    /// under [`std::panic::catch_unwind`] and store the panic as the task's
    /// [`failure()`](Self::failure).
    pub fn run(&self) {
        if let Some(action) = &self.action {
            action();
        }
    }

    /// Runs the action, catching any panic and storing it as this task's
    /// failure. Returns whether the action completed without panicking.
    pub(crate) fn run_isolated(&self) -> bool {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| self.run()));
        self.record_outcome(result)
    }

    /// Stores the outcome of a run: a panic payload becomes the task's
    /// failure, a success clears any previous failure.
    pub(crate) fn record_outcome(&self, result: std::thread::Result<()>) -> bool {
        let mut failure = lock(&self.failure);
        match result {
            Ok(()) => {
                *failure = None;
                true
            }
            Err(payload) => {
                *failure = Some(TaskFailure::from_panic(payload));
                false
            }
        }
    }

    /// Failure of the last run, if it panicked.
    pub fn failure(&self) -> Option<TaskFailure> {
        lock(&self.failure).clone()
    }

    /// Takes the failure of the last run out of this task.
    pub fn take_failure(&self) -> Option<TaskFailure> {
        lock(&self.failure).take()
    }

    /// Sets the completion signal and wakes the waiter, if any.
    pub fn signal(&self) {
        self.signal.signal();
    }

    /// Forces the completion signal back to unsignaled.
    pub fn reset(&self) {
        self.signal.reset();
    }

    /// Returns whether the completion signal is set.
    pub fn is_signaled(&self) -> bool {
        self.signal.is_signaled()
    }

    /// Blocks until this task is signaled, then resets its signal.
    ///
    /// This has no internal timeout: waiting on a task that is never signaled
    /// (because it was rejected, or abandoned when its engine was dropped)
    /// blocks forever. See [`wait_timeout()`](Self::wait_timeout) for a
    /// bounded variant.
    pub fn wait(&self) {
        self.signal.wait();
    }

    /// Blocks until this task is signaled or the timeout elapses. Returns
    /// whether the task was signaled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.signal.wait_timeout(timeout)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("has_action", &self.has_action())
            .field("priority", &self.priority())
            .field("signaled", &self.is_signaled())
            .finish_non_exhaustive()
    }
}
