// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Thread-safe futures and the wake protocol that couples them to a task scheduler.
//!
//! An [`AsyncFuture`] is completed exactly once, either with a result or by
//! cancellation, and may be observed from any number of threads. Dependents
//! (blocked threads, [tasks](task), [gathering futures](gather()) and
//! [shields](shield())) register themselves with a pending future and are
//! notified by whichever thread completes it. Tasks are handed back to their
//! [`TaskManager`], which services them cooperatively.

mod error;
mod event;
mod future;
pub mod gather;
mod id;
mod loom;
pub mod manager;
mod shield;
mod sync;
pub mod task;
#[cfg(all(test, not(loom)))]
mod test_util;
mod wake;

pub use error::FutureError;
pub use event::{Event, EventQueue};
pub use future::{AsyncFuture, FutureResult, FutureState};
pub use gather::{AsyncGatheringFuture, gather};
pub use id::Id;
pub use manager::{ChainInfo, TaskManager, TaskManagerBuilder};
pub use shield::shield;
pub use task::{DoneStatus, TaskBuilder, TaskContext, TaskState};
