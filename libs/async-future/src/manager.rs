// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A minimal cooperative scheduler for tasks.
//!
//! A [`TaskManager`] owns a set of named chains. Every call to
//! [`TaskManager::poll`] services each chain once: the tasks that are active
//! at the start of the epoch run (as do tasks woken while the epoch is in
//! progress), tasks that ask to continue are deferred to the next epoch, and
//! tasks awaiting a future are parked until the wake protocol hands them
//! back.
//!
//! All task lifecycle transitions happen with the manager's lock held, task
//! bodies and hooks always run with it released.

mod chain;

use crate::future::{AsyncFuture, FutureState};
use crate::sync::{Mutex, MutexGuard};
use crate::task::{DoneStatus, TaskCore, TaskState};
use core::fmt;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

pub use chain::ChainInfo;
use chain::TaskChain;

/// The chain tasks are serviced on unless their builder says otherwise.
pub const DEFAULT_CHAIN: &str = "default";

pub struct TaskManager {
    name: String,
    this: Weak<TaskManager>,
    inner: Mutex<Inner>,
}

pub(crate) struct Inner {
    chains: BTreeMap<String, TaskChain>,
    num_tasks: usize,
}

/// Configures and creates a [`TaskManager`].
#[derive(Debug)]
pub struct TaskManagerBuilder {
    name: String,
    chains: Vec<String>,
}

crate::loom::lazy_static! {
    static ref GLOBAL: Arc<TaskManager> = TaskManager::new("global");
}

// === impl TaskManager ===

impl TaskManager {
    /// Returns a new manager with only the default chain.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Self::builder(name).build()
    }

    pub fn builder(name: impl Into<String>) -> TaskManagerBuilder {
        TaskManagerBuilder {
            name: name.into(),
            chains: Vec::new(),
        }
    }

    /// The process-wide manager. Tasks that are woken without ever having
    /// been added to a manager end up here.
    #[must_use]
    pub fn global() -> Arc<TaskManager> {
        GLOBAL.clone()
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock()
    }

    /// Number of tasks owned by this manager, in any state.
    #[must_use]
    pub fn num_tasks(&self) -> usize {
        self.inner.lock().num_tasks
    }

    /// Returns `true` if `task` is owned by this manager.
    #[must_use]
    pub fn has_task(&self, task: &AsyncFuture) -> bool {
        let _inner = self.inner.lock();
        task.as_task()
            .is_some_and(|core| core.is_owned_by(&self.this))
    }

    /// Returns a snapshot of the chain called `name`, if it exists.
    #[must_use]
    pub fn find_task_chain(&self, name: &str) -> Option<ChainInfo> {
        self.inner.lock().chains.get(name).map(TaskChain::info)
    }

    /// Creates the chain called `name` unless it exists. Returns `true` if it was created.
    pub fn make_task_chain(&self, name: &str) -> bool {
        let mut inner = self.inner.lock();
        if inner.chains.contains_key(name) {
            return false;
        }
        tracing::debug!(manager = %self.name, chain = name, "creating task chain");
        inner
            .chains
            .insert(name.to_string(), TaskChain::new(name.to_string()));
        true
    }

    #[must_use]
    pub fn chain_names(&self) -> Vec<String> {
        self.inner.lock().chains.keys().cloned().collect()
    }

    /// Hands `task` to this manager.
    ///
    /// Runs the task's birth hook and queues it on its chain (creating the
    /// chain if needed). Returns `false` if the task is already owned by a
    /// manager, already done, or not a task at all.
    #[tracing::instrument(level = "debug", skip_all, fields(manager = %self.name, task = %task))]
    pub fn add(&self, task: &Arc<AsyncFuture>) -> bool {
        let Some(core) = task.as_task() else {
            tracing::error!("only tasks can be added to a task manager");
            return false;
        };

        if task.done() {
            tracing::warn!("not adding a task that is already done");
            return false;
        }

        {
            let _inner = self.inner.lock();
            if core.state() != TaskState::Inactive {
                tracing::error!("task is already scheduled");
                return false;
            }
        }

        core.upon_birth(self, task);

        self.inner.lock().do_add(self, task.clone())
    }

    /// Takes `task` away from this manager, cancelling its future.
    ///
    /// A task whose body is running right now is cleaned up once the body
    /// returns. Returns `false` if the task isn't owned by this manager or
    /// its removal is already pending.
    #[tracing::instrument(level = "debug", skip_all, fields(manager = %self.name, task = %task))]
    pub fn remove(&self, task: &AsyncFuture) -> bool {
        let Some(core) = task.as_task() else {
            return false;
        };

        let mut inner = self.inner.lock();
        if !core.is_owned_by(&self.this) {
            tracing::trace!("task is not owned by this manager");
            return false;
        }

        match core.state() {
            TaskState::Servicing => {
                core.set_state(TaskState::ServicingRemoved);
                true
            }
            TaskState::ServicingRemoved | TaskState::Inactive => false,
            TaskState::Active => {
                if let Some(chain) = inner.chains.get_mut(core.chain()) {
                    chain.unqueue(task);
                }
                self.cleanup_task(&mut inner, task, core, false);
                true
            }
            TaskState::Awaiting => {
                if let Some(chain) = inner.chains.get_mut(core.chain()) {
                    chain.num_awaiting -= 1;
                }
                self.cleanup_task(&mut inner, task, core, false);
                true
            }
        }
    }

    /// Runs one epoch on every chain.
    #[tracing::instrument(level = "debug", skip(self), fields(manager = %self.name))]
    pub fn poll(&self) {
        let names = self.chain_names();
        for name in &names {
            self.service_chain(name);
        }
    }

    fn service_chain(&self, name: &str) {
        let mut inner = self.inner.lock();
        let Some(chain) = inner.chains.get_mut(name) else {
            return;
        };
        chain.start_epoch();

        while let Some(task) = inner
            .chains
            .get_mut(name)
            .and_then(|chain| chain.active.pop_front())
        {
            let Some(core) = task.as_task() else {
                continue;
            };

            if task.done() {
                // cancelled directly while queued, don't run the body after that
                tracing::debug!(task = %task, "not servicing a task that is already done");
                let clean_exit = !task.cancelled();
                self.cleanup_task(&mut inner, &task, core, clean_exit);
                continue;
            }

            core.set_state(TaskState::Servicing);
            let status = MutexGuard::unlocked(&mut inner, || core.run(&task, self));

            match core.state() {
                TaskState::Servicing => self.handle_status(&mut inner, &task, core, status),
                TaskState::ServicingRemoved => {
                    tracing::debug!(task = %task, "task was removed while it was running");
                    self.cleanup_task(&mut inner, &task, core, false);
                }
                state => {
                    tracing::error!(task = %task, ?state, "task changed state while it was running");
                }
            }
        }
    }

    fn handle_status(
        &self,
        inner: &mut MutexGuard<'_, Inner>,
        task: &Arc<AsyncFuture>,
        core: &TaskCore,
        status: DoneStatus,
    ) {
        match status {
            DoneStatus::Done => self.cleanup_task(inner, task, core, true),
            DoneStatus::Await(fut) if !Arc::ptr_eq(&fut, task) => {
                core.set_state(TaskState::Awaiting);
                if let Some(chain) = inner.chains.get_mut(core.chain()) {
                    chain.num_awaiting += 1;
                }
                // registering may wake the task right away, which needs our lock
                let registered = MutexGuard::unlocked(inner, || fut.add_waiting_task(task));

                // the future was already done, run again next epoch like `Cont` so a
                // task awaiting done futures can't keep the current epoch going forever
                if !registered && core.state() == TaskState::Active {
                    if let Some(chain) = inner.chains.get_mut(core.chain()) {
                        if chain.unqueue(task) {
                            chain.next_active.push_back(task.clone());
                        }
                    }
                }
            }
            status => {
                if matches!(status, DoneStatus::Await(_)) {
                    tracing::error!(task = %task, "a task cannot await itself");
                }
                core.set_state(TaskState::Active);
                if let Some(chain) = inner.chains.get_mut(core.chain()) {
                    chain.next_active.push_back(task.clone());
                }
            }
        }
    }

    /// Releases `task` and completes its future. Hooks and the wake protocol
    /// run with the lock released.
    ///
    /// The future turns terminal before the lock is released, so a concurrent
    /// [`wake_task`](crate::wake::wake_task) can tell a removed task from one
    /// that was never scheduled.
    fn cleanup_task(
        &self,
        inner: &mut MutexGuard<'_, Inner>,
        task: &AsyncFuture,
        core: &TaskCore,
        clean_exit: bool,
    ) {
        tracing::debug!(task = %task, clean_exit, "task leaving manager");

        if let Some(chain) = inner.chains.get_mut(core.chain()) {
            chain.num_tasks -= 1;
        }
        inner.num_tasks -= 1;
        core.set_state(TaskState::Inactive);
        core.set_manager(Weak::new());

        let state = if clean_exit {
            FutureState::Finished
        } else {
            FutureState::Cancelled
        };
        // only waits out another thread's locked window, which never takes our lock
        let completed = task.set_future_state(state);

        MutexGuard::unlocked(inner, || {
            if completed {
                task.notify_done(clean_exit);
            }
            core.upon_death(self, task, clean_exit);
        });
    }
}

impl fmt::Debug for TaskManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("TaskManager")
            .field("name", &self.name)
            .field("num_tasks", &inner.num_tasks)
            .field("chains", &inner.chains.values().map(TaskChain::info).collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Drop for TaskManager {
    fn drop(&mut self) {
        let num_tasks = self.inner.get_mut().num_tasks;
        if num_tasks > 0 {
            tracing::debug!(manager = %self.name, num_tasks, "dropping task manager with live tasks");
        }
    }
}

// === impl Inner ===

impl Inner {
    fn chain_or_insert(&mut self, name: &str, manager: &str) -> &mut TaskChain {
        self.chains.entry(name.to_string()).or_insert_with(|| {
            tracing::warn!(manager, chain = name, "creating implicit task chain");
            TaskChain::new(name.to_string())
        })
    }

    /// Queues an inactive task on its chain and takes ownership of it.
    pub(crate) fn do_add(&mut self, manager: &TaskManager, task: Arc<AsyncFuture>) -> bool {
        let Some(core) = task.as_task() else {
            return false;
        };

        if task.done() {
            tracing::warn!(task = %task, "not adding a task that is already done");
            return false;
        }
        if core.state() != TaskState::Inactive || core.manager_weak().strong_count() > 0 {
            tracing::error!(task = %task, "task is already owned by a manager");
            return false;
        }

        core.set_manager(manager.this.clone());
        core.set_state(TaskState::Active);

        let chain = self.chain_or_insert(core.chain(), &manager.name);
        chain.num_tasks += 1;
        chain.active.push_back(task.clone());
        self.num_tasks += 1;

        tracing::trace!(task = %task, "task added");
        true
    }

    /// Moves an awaiting task back onto its chain's active queue.
    pub(crate) fn activate_awaiting(&mut self, task: Arc<AsyncFuture>) {
        let Some(core) = task.as_task() else {
            return;
        };

        let Some(chain) = self.chains.get_mut(core.chain()) else {
            tracing::error!(task = %task, "awaiting task has no chain");
            return;
        };

        core.set_state(TaskState::Active);
        chain.num_awaiting -= 1;
        chain.active.push_back(task);
    }
}

// === impl TaskManagerBuilder ===

impl TaskManagerBuilder {
    /// Declare a chain up front. Tasks naming a chain that was not declared
    /// still work, but the chain's implicit creation is logged as a warning.
    #[must_use]
    pub fn chain(mut self, name: impl Into<String>) -> Self {
        self.chains.push(name.into());
        self
    }

    #[must_use]
    pub fn build(self) -> Arc<TaskManager> {
        let mut chains = BTreeMap::new();
        for name in core::iter::once(DEFAULT_CHAIN.to_string()).chain(self.chains) {
            chains.insert(name.clone(), TaskChain::new(name));
        }

        Arc::new_cyclic(|this| TaskManager {
            name: self.name,
            this: this.clone(),
            inner: Mutex::new(Inner {
                chains,
                num_tasks: 0,
            }),
        })
    }
}
