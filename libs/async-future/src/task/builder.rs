// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::future::{AsyncFuture, FutureKind};
use crate::manager::{DEFAULT_CHAIN, TaskManager};
use crate::task::{BirthHook, DeathHook, DoneStatus, TaskContext, TaskCore};
use core::panic::Location;
use std::sync::Arc;

/// Configures and creates a task.
///
/// ```
/// # use async_future::{TaskBuilder, TaskManager, DoneStatus};
/// let manager = TaskManager::new("example");
/// let task = TaskBuilder::new("hello")
///     .chain("io")
///     .build(|_cx| DoneStatus::Done);
/// manager.add(&task);
/// manager.poll();
/// assert!(task.done());
/// ```
pub struct TaskBuilder {
    name: String,
    chain: String,
    location: Option<&'static Location<'static>>,
    upon_birth: Option<BirthHook>,
    upon_death: Option<DeathHook>,
}

impl TaskBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            chain: DEFAULT_CHAIN.to_string(),
            location: None,
            upon_birth: None,
            upon_death: None,
        }
    }

    /// Override the chain the task is serviced on.
    ///
    /// By default, tasks run on the manager's default chain.
    #[must_use]
    pub fn chain(mut self, chain: impl Into<String>) -> Self {
        self.chain = chain.into();
        self
    }

    /// Override the source code location that will be associated with the task.
    ///
    /// By default, the task inherits the location of where it was built.
    #[must_use]
    pub fn location(mut self, location: &'static Location<'static>) -> Self {
        self.location = Some(location);
        self
    }

    /// Hook run when a manager takes ownership of the task.
    #[must_use]
    pub fn upon_birth<F>(mut self, f: F) -> Self
    where
        F: Fn(&TaskManager, &Arc<AsyncFuture>) + Send + Sync + 'static,
    {
        self.upon_birth = Some(Box::new(f));
        self
    }

    /// Hook run when the task leaves its manager. The flag is `true` if the
    /// task finished and `false` if it was removed.
    #[must_use]
    pub fn upon_death<F>(mut self, f: F) -> Self
    where
        F: Fn(&TaskManager, &AsyncFuture, bool) + Send + Sync + 'static,
    {
        self.upon_death = Some(Box::new(f));
        self
    }

    /// Creates the task. It is inactive until it is added to a manager or a
    /// future it awaits completes.
    #[track_caller]
    pub fn build<F>(self, body: F) -> Arc<AsyncFuture>
    where
        F: FnMut(&TaskContext<'_>) -> DoneStatus + Send + 'static,
    {
        let loc = self.location.unwrap_or(Location::caller());
        let span = tracing::trace_span!(
            "task",
            task.id = tracing::field::Empty,
            task.name = %self.name,
            task.chain = %self.chain,
            loc.file = loc.file(),
            loc.line = loc.line(),
            loc.col = loc.column(),
        );

        let core = TaskCore::new(
            self.name,
            self.chain,
            span,
            Box::new(body),
            self.upon_birth,
            self.upon_death,
        );
        let task = AsyncFuture::with_kind(FutureKind::Task(core));
        if let Some(core) = task.as_task() {
            core.span.record("task.id", task.id().as_u64());
        }
        tracing::trace!(task = %task, "built task");
        task
    }
}
