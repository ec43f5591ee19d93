// Copyright 2024-2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

#![doc = include_str!("../README.md")]
#![forbid(missing_docs, unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod core;
mod macros;

pub use crate::core::{
    create, create_engine, create_named, status_code, Action, BuildError, ClearScope,
    CompletionSignal, CpuPinningPolicy, DelayedTask, DispatchEngine, EngineBuilder, EngineStats,
    LaneCaps, LaneQueue, PendingTasks, Prioritized, Priority, SubmitError, SyncError, Task,
    TaskFailure, ThreadCount, ACCEPTED, DEFAULT_DROPABLE_CAP, DEFAULT_POLL_INTERVAL,
};
