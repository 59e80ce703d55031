// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Tasks: futures that are driven to completion by a [`TaskManager`].
//!
//! A task wraps a body that is serviced repeatedly by its manager. Each time
//! it runs the body reports a [`DoneStatus`]: it is finished, it wants to run
//! again next epoch, or it wants to sleep until another future is done. The
//! task's own future completes once the body reports [`DoneStatus::Done`] (or
//! is cancelled if the task is removed from its manager first).

mod builder;

use crate::future::AsyncFuture;
use crate::id::Id;
use crate::manager::TaskManager;
use crate::sync::Mutex;
use core::cell::Cell;
use core::fmt;
use std::sync::{Arc, Weak};

pub use builder::TaskBuilder;

/// The scheduler lifecycle state of a task.
///
/// Transitions are only ever made with the owning manager's lock held.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum TaskState {
    /// Not owned by any manager.
    Inactive,
    /// Queued on its chain, waiting to be serviced.
    Active,
    /// Its body is currently running.
    Servicing,
    /// Its body is currently running and it was removed from its manager; it
    /// will be cleaned up as cancelled once the body returns.
    ServicingRemoved,
    /// Parked until a future it awaits is done.
    Awaiting,
}

/// What a task body wants to happen next.
#[derive(Debug)]
pub enum DoneStatus {
    /// The task is finished. Its future completes and it leaves its manager.
    Done,
    /// Run the task again in the next epoch.
    Cont,
    /// Sleep until the given future is done, then run again.
    Await(Arc<AsyncFuture>),
}

/// Everything a task body gets to see while it runs.
pub struct TaskContext<'a> {
    task: &'a Arc<AsyncFuture>,
    manager: &'a TaskManager,
}

pub(crate) type TaskBody = Box<dyn FnMut(&TaskContext<'_>) -> DoneStatus + Send>;
pub(crate) type BirthHook = Box<dyn Fn(&TaskManager, &Arc<AsyncFuture>) + Send + Sync>;
pub(crate) type DeathHook = Box<dyn Fn(&TaskManager, &AsyncFuture, bool) + Send + Sync>;

/// The task-specific part of a task future.
pub(crate) struct TaskCore {
    name: String,
    chain: String,
    span: tracing::Span,
    sched: Mutex<Sched>,
    body: Mutex<Option<TaskBody>>,
    upon_birth: Option<BirthHook>,
    upon_death: Option<DeathHook>,
}

/// Scheduling bookkeeping, only written with the manager's lock held.
struct Sched {
    state: TaskState,
    manager: Weak<TaskManager>,
}

crate::loom::thread_local! {
    static CURRENT_TASK: Cell<Option<Id>> = Cell::new(None);
}

/// Returns the ID of the task being serviced on this thread, if any.
#[must_use]
pub fn current_task_id() -> Option<Id> {
    CURRENT_TASK.with(Cell::get)
}

/// Restores the previously current task when dropped, even if the body panicked.
struct CurrentGuard(Option<Id>);

impl CurrentGuard {
    fn enter(id: Id) -> Self {
        Self(CURRENT_TASK.with(|current| current.replace(Some(id))))
    }
}

impl Drop for CurrentGuard {
    fn drop(&mut self) {
        CURRENT_TASK.with(|current| current.set(self.0));
    }
}

// === impl TaskContext ===

impl<'a> TaskContext<'a> {
    /// The future representing the running task.
    #[must_use]
    pub fn task(&self) -> &'a Arc<AsyncFuture> {
        self.task
    }

    /// The manager servicing the task.
    #[must_use]
    pub fn manager(&self) -> &'a TaskManager {
        self.manager
    }
}

impl fmt::Debug for TaskContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskContext")
            .field("task", &self.task)
            .field("manager", &self.manager.name())
            .finish()
    }
}

// === impl TaskCore ===

impl TaskCore {
    pub(crate) fn new(
        name: String,
        chain: String,
        span: tracing::Span,
        body: TaskBody,
        upon_birth: Option<BirthHook>,
        upon_death: Option<DeathHook>,
    ) -> Self {
        Self {
            name,
            chain,
            span,
            sched: Mutex::new(Sched {
                state: TaskState::Inactive,
                manager: Weak::new(),
            }),
            body: Mutex::new(Some(body)),
            upon_birth,
            upon_death,
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Name of the chain this task is serviced on.
    pub(crate) fn chain(&self) -> &str {
        &self.chain
    }

    pub(crate) fn state(&self) -> TaskState {
        self.sched.lock().state
    }

    pub(crate) fn set_state(&self, state: TaskState) {
        tracing::trace!(task = %self.name, ?state, "task state transition");
        self.sched.lock().state = state;
    }

    pub(crate) fn manager_weak(&self) -> Weak<TaskManager> {
        self.sched.lock().manager.clone()
    }

    pub(crate) fn set_manager(&self, manager: Weak<TaskManager>) {
        self.sched.lock().manager = manager;
    }

    pub(crate) fn is_owned_by(&self, manager: &Weak<TaskManager>) -> bool {
        Weak::ptr_eq(&self.sched.lock().manager, manager)
    }

    pub(crate) fn upon_birth(&self, manager: &TaskManager, task: &Arc<AsyncFuture>) {
        if let Some(hook) = &self.upon_birth {
            let _enter = self.span.enter();
            hook(manager, task);
        }
    }

    pub(crate) fn upon_death(&self, manager: &TaskManager, task: &AsyncFuture, clean_exit: bool) {
        if let Some(hook) = &self.upon_death {
            let _enter = self.span.enter();
            hook(manager, task, clean_exit);
        }
    }

    /// Runs the body once. Must be called without the manager lock held.
    pub(crate) fn run(&self, task: &Arc<AsyncFuture>, manager: &TaskManager) -> DoneStatus {
        let _enter = self.span.enter();
        let _current = CurrentGuard::enter(task.id());

        // take the body out so it runs without any of our locks held
        let Some(mut body) = self.body.lock().take() else {
            tracing::error!("task body is missing, was it serviced concurrently?");
            return DoneStatus::Done;
        };

        let status = body(&TaskContext { task, manager });
        tracing::trace!(?status, "task body returned");

        *self.body.lock() = Some(body);
        status
    }

    /// Cancels the task `task` (whose core this is).
    pub(crate) fn cancel(&self, task: &AsyncFuture) -> bool {
        if let Some(manager) = self.manager_weak().upgrade() {
            manager.remove(task)
        } else {
            // never scheduled, there is nothing to remove it from
            task.cancel_plain()
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::test_util::trace_init;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn builder_defaults() {
        let _trace = trace_init();

        let task = TaskBuilder::new("defaults").build(|_| DoneStatus::Done);
        assert!(task.is_task());
        assert_eq!(task.task_name(), Some("defaults"));
        assert_eq!(task.task_state(), Some(TaskState::Inactive));
        assert!(task.manager().is_none());
        assert!(!task.done());
    }

    #[test]
    fn cancel_unscheduled_task() {
        let _trace = trace_init();

        let task = TaskBuilder::new("unscheduled").build(|_| DoneStatus::Done);
        assert!(task.cancel());
        assert!(task.cancelled());
        assert!(!task.cancel());
    }

    #[test]
    fn current_task_is_set_while_running() {
        let _trace = trace_init();

        let manager = TaskManager::new("current");
        let seen = Arc::new(AtomicUsize::new(0));

        let task = TaskBuilder::new("current").build({
            let seen = seen.clone();
            move |cx| {
                assert_eq!(current_task_id(), Some(cx.task().id()));
                // a task can't block on itself
                assert_eq!(
                    cx.task().result(None).unwrap_err(),
                    crate::FutureError::WouldDeadlock
                );
                seen.fetch_add(1, Ordering::Relaxed);
                DoneStatus::Done
            }
        });

        manager.add(&task);
        manager.poll();

        assert_eq!(seen.load(Ordering::Relaxed), 1);
        assert!(task.done());
        assert_eq!(current_task_id(), None);
    }
}
