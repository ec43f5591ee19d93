// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Error types.

use super::task::{Priority, TaskFailure};
use thiserror::Error;

/// Status code of an accepted submission.
pub const ACCEPTED: i64 = 0;

/// Reason why a submission was rejected. A rejected task is never queued nor
/// signaled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SubmitError {
    /// The submitted task carries no action.
    #[error("submitted task has no action")]
    NullAction,
    /// The lane of the task's class is full.
    #[error("engine overloaded: {priority:?} lane holds {cap} tasks")]
    Overloaded {
        /// Class of the rejected task.
        priority: Priority,
        /// Cap of the lane that rejected it.
        cap: usize,
    },
}

impl SubmitError {
    /// Integer status code of this rejection: `-1` for
    /// [`NullAction`](Self::NullAction), `-2` for
    /// [`Overloaded`](Self::Overloaded).
    pub fn code(&self) -> i64 {
        match self {
            SubmitError::NullAction => -1,
            SubmitError::Overloaded { .. } => -2,
        }
    }
}

/// Integer status code of a submission: [`ACCEPTED`] or
/// [`SubmitError::code()`].
pub fn status_code(result: &Result<(), SubmitError>) -> i64 {
    match result {
        Ok(()) => ACCEPTED,
        Err(e) => e.code(),
    }
}

/// Error returned by a synchronous submission.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// The task was rejected and didn't run.
    #[error(transparent)]
    Rejected(#[from] SubmitError),
    /// The task ran and panicked.
    #[error("task panicked: {0}")]
    Panicked(TaskFailure),
}

/// Error returned when building an engine.
#[derive(Debug, Error)]
pub enum BuildError {
    /// The operating system failed to spawn a worker thread.
    #[error("failed to spawn worker thread #{thread}")]
    Spawn {
        /// Index of the worker thread.
        thread: usize,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// Pinning threads to CPUs was required but isn't implemented on this
    /// platform.
    #[error("pinning threads to CPUs is not implemented on this platform")]
    CpuPinningUnsupported,
    /// Pinning a worker thread to a CPU was required but failed.
    #[error("failed to set CPU affinity for worker thread #{thread}")]
    CpuPinning {
        /// Index of the worker thread.
        thread: usize,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}
