// Copyright 2024-2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Core engine: worker threads, priority lanes and completion signals.

mod config;
mod engine;
mod error;
mod lanes;
mod task;
mod util;

pub use config::{
    ClearScope, CpuPinningPolicy, LaneCaps, ThreadCount, DEFAULT_DROPABLE_CAP,
    DEFAULT_POLL_INTERVAL,
};
pub use engine::{
    create, create_engine, create_named, DispatchEngine, EngineBuilder, EngineStats, PendingTasks,
};
pub use error::{status_code, BuildError, SubmitError, SyncError, ACCEPTED};
pub use lanes::{DelayedTask, LaneQueue, Prioritized};
pub use task::{Action, CompletionSignal, Priority, Task, TaskFailure};
