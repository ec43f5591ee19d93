// Copyright 2024-2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Engine configuration.

use super::task::Priority;
use std::num::NonZeroUsize;
use std::time::Duration;

/// Default cap of the [`Dropable`](Priority::Dropable) lanes.
pub const DEFAULT_DROPABLE_CAP: usize = 2048;

/// Default upper bound on how long an idle worker sleeps before re-checking
/// the delayed queue.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Number of threads to spawn in an engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadCount {
    /// Spawn the number of threads returned by
    /// [`std::thread::available_parallelism()`], or a single thread if that
    /// number is unknown.
    AvailableParallelism,
    /// Spawn the given number of threads.
    Count(NonZeroUsize),
}

impl ThreadCount {
    /// A single worker thread.
    pub const ONE: ThreadCount = ThreadCount::Count(NonZeroUsize::MIN);

    /// Resolves the number of threads to spawn.
    pub fn count(self) -> NonZeroUsize {
        match self {
            ThreadCount::AvailableParallelism => {
                std::thread::available_parallelism().unwrap_or(NonZeroUsize::MIN)
            }
            ThreadCount::Count(count) => count,
        }
    }
}

impl TryFrom<usize> for ThreadCount {
    type Error = <NonZeroUsize as TryFrom<usize>>::Error;

    fn try_from(thread_count: usize) -> Result<Self, Self::Error> {
        let count = NonZeroUsize::try_from(thread_count)?;
        Ok(ThreadCount::Count(count))
    }
}

/// Policy to pin worker threads to CPUs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CpuPinningPolicy {
    /// Don't pin worker threads to CPUs.
    No,
    /// Pin each worker thread to a CPU, if CPU pinning is supported and
    /// implemented on this platform.
    IfSupported,
    /// Pin each worker thread to a CPU. If CPU pinning isn't supported on this
    /// platform (or not implemented), building an engine fails.
    Always,
}

/// Maximum number of queued tasks per priority class.
///
/// Each cap applies separately to the ready queue and to the delayed queue. A
/// submission is rejected when the lane of its class already holds `cap`
/// tasks, so a lane never holds more than `cap` tasks; `None` means the lane is
/// unbounded. This is one stricter than a check rejecting only once the lane
/// holds more than `cap` tasks: with the default cap of 2048, the 2049th
/// pending droppable task is rejected.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LaneCaps {
    /// Cap of the [`High`](Priority::High) lanes.
    pub high: Option<usize>,
    /// Cap of the [`Normal`](Priority::Normal) lanes.
    pub normal: Option<usize>,
    /// Cap of the [`Low`](Priority::Low) lanes.
    pub low: Option<usize>,
    /// Cap of the [`Dropable`](Priority::Dropable) lanes.
    pub dropable: Option<usize>,
}

impl LaneCaps {
    /// No lane is capped.
    pub const UNBOUNDED: LaneCaps = LaneCaps {
        high: None,
        normal: None,
        low: None,
        dropable: None,
    };

    /// Cap of the lanes of the given class.
    pub fn get(&self, priority: Priority) -> Option<usize> {
        match priority {
            Priority::High => self.high,
            Priority::Normal => self.normal,
            Priority::Low => self.low,
            Priority::Dropable => self.dropable,
        }
    }
}

impl Default for LaneCaps {
    /// Only the [`Dropable`](Priority::Dropable) lanes are capped, at
    /// [`DEFAULT_DROPABLE_CAP`].
    fn default() -> Self {
        Self {
            dropable: Some(DEFAULT_DROPABLE_CAP),
            ..Self::UNBOUNDED
        }
    }
}

/// Queues drained by [`DispatchEngine::clear_queues()`].
///
/// [`DispatchEngine::clear_queues()`]: crate::DispatchEngine::clear_queues
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ClearScope {
    /// Only the ready queue. Delayed tasks stay pending and still run once
    /// due.
    #[default]
    Ready,
    /// Both the ready and the delayed queues.
    ReadyAndDelayed,
}
