// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The completion side of a future: notifying dependents and handing woken
//! tasks back to their scheduler.

use crate::event::{Event, EventQueue};
use crate::future::{AsyncFuture, FutureKind, FutureState, Waiter};
use crate::manager::TaskManager;
use crate::task::TaskState;
use std::sync::Arc;

impl AsyncFuture {
    /// Runs the wake protocol.
    ///
    /// Must be called exactly once, by the thread that moved this future into
    /// a terminal state, after the terminal state was published. `clean_exit`
    /// is `true` when the future finished and `false` when it was cancelled.
    #[tracing::instrument(level = "trace", skip(self), fields(future = %self))]
    pub(crate) fn notify_done(&self, clean_exit: bool) {
        debug_assert!(self.done());
        debug_assert_eq!(clean_exit, self.state() == FutureState::Finished);

        let waiting = self.take_waiting();

        // blocked threads don't go through the scheduler, release them first
        for waiter in &waiting {
            if let Waiter::Thread(thread) = waiter {
                thread.unpark();
            }
        }

        for waiter in waiting {
            if let Waiter::Future(dependent) = waiter {
                self.notify_dependent(&dependent, clean_exit);
            }
        }

        if !clean_exit {
            return;
        }

        if let Some(name) = self.terminal_done_event() {
            // `self` is reachable through an `Arc` for as long as we're running
            if let Some(this) = self.to_arc() {
                tracing::trace!(event = %name, "posting done event");
                EventQueue::global().queue_event(Event::new(name, this));
            }
        }
    }

    fn notify_dependent(&self, dependent: &Arc<AsyncFuture>, clean_exit: bool) {
        match dependent.kind() {
            FutureKind::Task(_) => wake_task(self, dependent),
            FutureKind::Gathering(gathering) => gathering.component_done(dependent),
            FutureKind::Plain => {
                // a plain dependent shields this future, forward our outcome
                if clean_exit {
                    if dependent.try_lock_pending() {
                        dependent.store_result_from(self);
                        dependent.unlock_to(FutureState::Finished);
                        dependent.notify_done(true);
                    }
                } else if dependent.set_future_state(FutureState::Cancelled) {
                    dependent.notify_done(false);
                }
            }
        }
    }
}

/// Hands `task` back to its scheduler because `future`, which it was waiting
/// on, is done.
///
/// Depending on the task's lifecycle state this either
/// - keeps it running if it is being serviced and was removed in the meantime,
/// - does nothing if it is already queued,
/// - schedules it for the first time (running its birth hook) if it was never added, or
/// - moves it from the awaiting set back onto its chain's active queue.
///
/// A task whose future is already done is left alone. That is checked again
/// with the manager lock held, because removing a task completes its future
/// under the same lock.
///
/// A task only registers with a future after its body returned, so a wake
/// during servicing means the body registered its own task. With a pending
/// removal that is tolerated: the wake withdraws the removal. Without one it
/// is a scheduler invariant violation.
#[tracing::instrument(level = "debug", skip_all, fields(future = %future, task = %task))]
pub(crate) fn wake_task(future: &AsyncFuture, task: &Arc<AsyncFuture>) {
    let Some(core) = task.as_task() else {
        unreachable!("wake_task() called with {task}, which is not a task");
    };

    if task.done() {
        // cancelled while it was waiting, nothing left to run
        tracing::trace!("not waking finished task");
        return;
    }

    let manager = core
        .manager_weak()
        .upgrade()
        .or_else(|| future.manager())
        .unwrap_or_else(TaskManager::global);

    let mut inner = manager.lock();
    if task.done() {
        tracing::trace!("task was removed before the wake got to it");
        return;
    }

    match core.state() {
        TaskState::ServicingRemoved => {
            tracing::warn!("task woken while servicing, withdrawing its removal");
            // it is still running, the scheduler will pick the state up when the body returns
            core.set_state(TaskState::Servicing);
        }
        TaskState::Active => {}
        TaskState::Inactive => {
            tracing::debug!("adding task woken by its future");

            crate::sync::MutexGuard::unlocked(&mut inner, || core.upon_birth(&manager, task));

            if task.done() {
                tracing::trace!("task was cancelled while running its birth hook");
                return;
            }
            if core.state() != TaskState::Inactive || core.manager_weak().strong_count() > 0 {
                tracing::error!("task was scheduled concurrently while running its birth hook");
                return;
            }

            inner.do_add(&manager, task.clone());
        }
        TaskState::Awaiting => {
            inner.activate_awaiting(task.clone());
        }
        TaskState::Servicing => {
            panic!("{task} was woken by {future} while it is being serviced")
        }
    }
}
