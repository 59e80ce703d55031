// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::error::FutureError;
use crate::gather::AsyncGatheringFuture;
use crate::id::Id;
use crate::loom::cell::UnsafeCell;
use crate::loom::sync::atomic::{self, AtomicU8, Ordering};
use crate::loom::thread::{self, Thread};
use crate::manager::TaskManager;
use crate::sync::Backoff;
use crate::task::{self, TaskCore, TaskState};
use core::any::Any;
use core::fmt;
use static_assertions::const_assert;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// The type-erased, reference-counted value a future resolves to.
pub type FutureResult = Arc<dyn Any + Send + Sync>;

/// The lifecycle state of an [`AsyncFuture`].
///
/// States are totally ordered; everything at or above [`FutureState::Finished`]
/// is terminal and never changes again.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(u8)]
pub enum FutureState {
    /// Not yet done.
    Pending = 0,
    /// Not yet done, and some thread is inside the short locked window
    /// (registering a dependent or writing the result).
    LockedPending = 1,
    /// Completed with (or without) a result.
    Finished = 2,
    /// Cancelled before a result was set.
    Cancelled = 3,
}

const_assert!((FutureState::LockedPending as u8) > (FutureState::Pending as u8));
const_assert!((FutureState::Finished as u8) > (FutureState::LockedPending as u8));
const_assert!((FutureState::Cancelled as u8) > (FutureState::Finished as u8));

/// A thread-safe handle to the eventual result of an asynchronous operation.
///
/// An `AsyncFuture` is a small state machine driven by compare-and-swap:
///
/// ```text
/// Pending ⇄ LockedPending → Finished
///    └──────────────────────→ Cancelled
/// ```
///
/// The `LockedPending` state is a micro-lock that is held only while a
/// dependent is appended to the waiting list or while the producer stores the
/// result. Everything a future guards (its result, dependents, manager and
/// done event) is written inside that window and becomes immutable once the
/// future is terminal. After that it may be read from any thread without
/// further synchronization.
///
/// Whichever thread moves the future into a terminal state runs the wake
/// protocol: parked threads are unparked, dependent tasks are handed back to
/// their [`TaskManager`], gathering futures are re-evaluated and shielding
/// futures receive the result (or the cancellation).
///
/// Futures are always handled through an [`Arc`]. There are three kinds: plain
/// futures (created with [`AsyncFuture::new`]), [gathering futures] and
/// [tasks].
///
/// [gathering futures]: crate::gather
/// [tasks]: crate::task
pub struct AsyncFuture {
    id: Id,
    state: AtomicU8,
    this: Weak<AsyncFuture>,
    result: UnsafeCell<Option<FutureResult>>,
    waiting: UnsafeCell<Vec<Waiter>>,
    manager: UnsafeCell<Weak<TaskManager>>,
    done_event: UnsafeCell<Option<String>>,
    kind: FutureKind,
}

/// What kind of future this is. Inspected by the wake protocol to decide how
/// a dependent is notified.
pub(crate) enum FutureKind {
    Plain,
    Gathering(AsyncGatheringFuture),
    Task(TaskCore),
}

/// Something registered in a future's waiting list.
pub(crate) enum Waiter {
    /// A task, gathering future, or shielding future.
    Future(Arc<AsyncFuture>),
    /// A thread blocked in [`AsyncFuture::wait`].
    Thread(Thread),
}

/// Mutable view of the fields guarded by the locked window.
pub(crate) struct Locked<'a> {
    pub(crate) waiting: &'a mut Vec<Waiter>,
    pub(crate) manager: &'a mut Weak<TaskManager>,
    pub(crate) done_event: &'a mut Option<String>,
}

// === impl FutureState ===

impl FutureState {
    fn from_u8(bits: u8) -> Self {
        match bits {
            0 => FutureState::Pending,
            1 => FutureState::LockedPending,
            2 => FutureState::Finished,
            3 => FutureState::Cancelled,
            _ => unreachable!("invalid future state {bits:#x}"),
        }
    }

    /// Returns `true` for the terminal states.
    #[must_use]
    pub fn is_done(self) -> bool {
        self >= FutureState::Finished
    }
}

impl fmt::Display for FutureState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            FutureState::Pending => "pending",
            FutureState::LockedPending => "locked",
            FutureState::Finished => "finished",
            FutureState::Cancelled => "cancelled",
        })
    }
}

// === impl AsyncFuture ===

impl AsyncFuture {
    /// Returns a new pending future.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Self::with_kind(FutureKind::Plain)
    }

    /// Returns a future that is already finished with `value`.
    #[must_use]
    pub fn ready<T: Any + Send + Sync>(value: T) -> Arc<Self> {
        let fut = Self::new();
        fut.set_result(value);
        fut
    }

    pub(crate) fn with_kind(kind: FutureKind) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            id: Id::next(),
            state: AtomicU8::new(FutureState::Pending as u8),
            this: this.clone(),
            result: UnsafeCell::new(None),
            waiting: UnsafeCell::new(Vec::new()),
            manager: UnsafeCell::new(Weak::new()),
            done_event: UnsafeCell::new(None),
            kind,
        })
    }

    #[must_use]
    pub fn id(&self) -> Id {
        self.id
    }

    #[must_use]
    pub fn state(&self) -> FutureState {
        FutureState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Returns `true` once the future is finished or cancelled.
    #[inline]
    #[must_use]
    pub fn done(&self) -> bool {
        self.state().is_done()
    }

    #[inline]
    #[must_use]
    pub fn cancelled(&self) -> bool {
        self.state() == FutureState::Cancelled
    }

    /// Returns `true` if this future represents a task.
    #[must_use]
    pub fn is_task(&self) -> bool {
        matches!(self.kind, FutureKind::Task(_))
    }

    /// Returns the gathering state if this future was created by [`gather`](crate::gather()).
    #[must_use]
    pub fn as_gathering(&self) -> Option<&AsyncGatheringFuture> {
        match &self.kind {
            FutureKind::Gathering(gathering) => Some(gathering),
            _ => None,
        }
    }

    pub(crate) fn kind(&self) -> &FutureKind {
        &self.kind
    }

    pub(crate) fn as_task(&self) -> Option<&TaskCore> {
        match &self.kind {
            FutureKind::Task(core) => Some(core),
            _ => None,
        }
    }

    /// Returns the name of the task this future represents.
    #[must_use]
    pub fn task_name(&self) -> Option<&str> {
        self.as_task().map(TaskCore::name)
    }

    /// Returns a snapshot of the scheduler lifecycle state if this future is a task.
    #[must_use]
    pub fn task_state(&self) -> Option<TaskState> {
        self.as_task().map(TaskCore::state)
    }

    /// Returns a strong reference to this future.
    pub(crate) fn to_arc(&self) -> Option<Arc<AsyncFuture>> {
        self.this.upgrade()
    }

    /// Attempts to cancel the future.
    ///
    /// Returns `true` if this call moved the future into the cancelled state,
    /// in which case the wake protocol has already run once this returns.
    /// Returns `false` if the future was already done.
    ///
    /// Cancelling a gathering future cancels every component first; cancelling
    /// a task removes it from its manager.
    pub fn cancel(&self) -> bool {
        match &self.kind {
            FutureKind::Plain => self.cancel_plain(),
            FutureKind::Gathering(gathering) => gathering.cancel(self),
            FutureKind::Task(core) => core.cancel(self),
        }
    }

    #[tracing::instrument(level = "trace", skip(self), fields(future = %self))]
    pub(crate) fn cancel_plain(&self) -> bool {
        if self.set_future_state(FutureState::Cancelled) {
            self.notify_done(false);
            true
        } else {
            tracing::trace!("future already done, not cancelling");
            false
        }
    }

    /// Enters the locked window.
    ///
    /// Returns `false` if the future is already done, in which case the
    /// caller must treat it as completed instead. If another thread is inside
    /// the window this backs off until it leaves.
    ///
    /// A successful call must be paired with [`AsyncFuture::unlock`].
    pub fn try_lock_pending(&self) -> bool {
        self.set_future_state(FutureState::LockedPending)
    }

    /// Leaves the locked window, returning the future to pending.
    pub fn unlock(&self) {
        self.unlock_to(FutureState::Pending);
    }

    pub(crate) fn unlock_to(&self, new_state: FutureState) {
        debug_assert_ne!(new_state, FutureState::LockedPending);
        debug_assert_eq!(
            self.state(),
            FutureState::LockedPending,
            "unlock() called on {self} without holding the lock"
        );
        self.state.store(new_state as u8, Ordering::Release);
    }

    /// Attempts the transition `Pending → new_state`, waiting out any
    /// concurrent locked window. Returns `true` if this call performed it.
    pub(crate) fn set_future_state(&self, new_state: FutureState) -> bool {
        let mut boff = Backoff::new();
        loop {
            match self.state.compare_exchange(
                FutureState::Pending as u8,
                new_state as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) if actual == FutureState::LockedPending as u8 => boff.snooze(),
                Err(_) => return false,
            }
        }
    }

    /// Runs `f` inside the locked window. Returns `None` (without calling `f`)
    /// if the future is already done.
    pub(crate) fn with_locked<R>(&self, f: impl FnOnce(Locked<'_>) -> R) -> Option<R> {
        if !self.try_lock_pending() {
            return None;
        }

        let ret = self.waiting.with_mut(|waiting| {
            self.manager.with_mut(|manager| {
                self.done_event.with_mut(|done_event| {
                    // Safety: we hold the locked window. These fields are only ever touched by the
                    // lock holder or, once the future is terminal, by the thread that completed it.
                    let locked = unsafe {
                        Locked {
                            waiting: &mut *waiting,
                            manager: &mut *manager,
                            done_event: &mut *done_event,
                        }
                    };
                    f(locked)
                })
            })
        });

        self.unlock();
        Some(ret)
    }

    /// Stores the result and completes the future.
    ///
    /// Only the producer may call this, and only once. If the future was
    /// cancelled concurrently the value is dropped with a warning. Calling it
    /// on a finished future is a usage error that is logged and ignored.
    pub fn set_result<T: Any + Send + Sync>(&self, value: T) {
        self.set_result_shared(Arc::new(value));
    }

    /// Like [`AsyncFuture::set_result`] but takes an already shared value.
    #[tracing::instrument(level = "trace", skip_all, fields(future = %self))]
    pub fn set_result_shared(&self, value: FutureResult) {
        if self.try_lock_pending() {
            self.result.with_mut(|result| {
                // Safety: we hold the locked window, nobody reads the result before the future
                // is terminal.
                unsafe { *result = Some(value) };
            });
            self.unlock_to(FutureState::Finished);
            self.notify_done(true);
            return;
        }

        match self.state() {
            FutureState::Cancelled => {
                // A producer racing an external cancel, cancellation wins.
                tracing::warn!("ignoring set_result() called on cancelled {self}");
            }
            _ => tracing::error!("set_result() was called on finished {self}"),
        }
    }

    /// Returns a reference to the result if the future finished with a value
    /// of type `T`.
    #[must_use]
    pub fn get_result<T: Any>(&self) -> Option<&T> {
        self.result_ref()?.downcast_ref::<T>()
    }

    /// Returns the shared result if the future finished with one.
    #[must_use]
    pub fn result_shared(&self) -> Option<FutureResult> {
        if self.state() != FutureState::Finished {
            return None;
        }
        // Safety: the future is terminal so the result is immutable.
        self.result.with(|result| unsafe { (*result).clone() })
    }

    fn result_ref(&self) -> Option<&(dyn Any + Send + Sync)> {
        if self.state() != FutureState::Finished {
            return None;
        }
        // Safety: the future is terminal so the result is immutable for the rest of its lifetime.
        let result = self.result.with(|result| unsafe { &*result });
        result.as_deref()
    }

    /// Waits (optionally bounded by `timeout`) and returns the result.
    ///
    /// # Errors
    ///
    /// - [`FutureError::Cancelled`] if the future was cancelled.
    /// - [`FutureError::Timeout`] if `timeout` elapsed first.
    /// - [`FutureError::WouldDeadlock`] if the calling task asked for its own result.
    pub fn result(&self, timeout: Option<Duration>) -> Result<Option<FutureResult>, FutureError> {
        if !self.done() {
            if self.is_current_task() {
                tracing::error!("task {self} cannot wait for its own result");
                return Err(FutureError::WouldDeadlock);
            }

            match timeout {
                None => self.wait(),
                Some(timeout) => {
                    if !self.wait_timeout(timeout) {
                        return Err(FutureError::Timeout);
                    }
                }
            }
        }

        match self.state() {
            FutureState::Finished => Ok(self.result_shared()),
            FutureState::Cancelled => Err(FutureError::Cancelled),
            FutureState::Pending | FutureState::LockedPending => Err(FutureError::Timeout),
        }
    }

    /// Blocks the calling thread until the future is done.
    ///
    /// Must not be called by the thread responsible for completing the
    /// future. A task waiting on itself is reported and returns immediately.
    pub fn wait(&self) {
        if !self.done() {
            if self.is_current_task() {
                tracing::error!("task {self} cannot wait for itself");
                return;
            }

            let _span = tracing::trace_span!("wait", future = %self).entered();

            if self.add_waiting_thread() {
                while !self.done() {
                    thread::park();
                }
            }
        }

        // pairs with the release store of the completing thread
        atomic::fence(Ordering::Acquire);
    }

    /// Blocks the calling thread until the future is done or `timeout`
    /// elapses. Returns whether the future is done. The future is left
    /// untouched on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if !self.done() {
            if self.is_current_task() {
                tracing::error!("task {self} cannot wait for itself");
                return false;
            }

            let _span = tracing::trace_span!("wait_timeout", future = %self, ?timeout).entered();

            let deadline = Instant::now() + timeout;
            if self.add_waiting_thread() {
                while !self.done() {
                    let now = Instant::now();
                    if now >= deadline {
                        tracing::trace!("timed out");
                        return false;
                    }
                    park_timeout(deadline - now);
                }
            }
        }

        atomic::fence(Ordering::Acquire);
        true
    }

    /// Registers the current thread to be unparked on completion. Returns
    /// `false` if the future is already done.
    fn add_waiting_thread(&self) -> bool {
        let me = thread::current();
        self.with_locked(|locked| {
            let registered = locked
                .waiting
                .iter()
                .any(|waiter| matches!(waiter, Waiter::Thread(t) if t.id() == me.id()));
            if !registered {
                locked.waiting.push(Waiter::Thread(me));
            }
        })
        .is_some()
    }

    /// Registers `task` to be woken when this future is done.
    ///
    /// Returns `true` if the task was registered. If the future is already
    /// done the task is woken right away (before this returns) and `false` is
    /// returned, so a task awaiting a future is woken exactly once regardless
    /// of which side wins the race.
    #[tracing::instrument(level = "trace", skip_all, fields(future = %self, task = %task))]
    pub fn add_waiting_task(&self, task: &Arc<AsyncFuture>) -> bool {
        let Some(core) = task.as_task() else {
            tracing::error!("add_waiting_task() called with {task}, which is not a task");
            return false;
        };

        let task_manager = core.manager_weak();
        let registered = self.with_locked(|locked| {
            if locked.manager.strong_count() == 0 {
                locked.manager.clone_from(&task_manager);
            }
            locked.waiting.push(Waiter::Future(task.clone()));
        });

        if registered.is_some() {
            tracing::trace!("registered waiting task");
            true
        } else {
            tracing::trace!("future already done, waking task immediately");
            crate::wake::wake_task(self, task);
            false
        }
    }

    /// Sets the name of the event posted when this future finishes cleanly.
    pub fn set_done_event(&self, name: impl Into<String>) {
        let name = name.into();
        if self
            .with_locked(|locked| *locked.done_event = Some(name))
            .is_none()
        {
            tracing::warn!("ignoring set_done_event() called on done {self}");
        }
    }

    #[must_use]
    pub fn done_event(&self) -> Option<String> {
        self.with_locked(|locked| locked.done_event.clone())
            // Safety: the future is terminal so the name is immutable.
            .unwrap_or_else(|| self.done_event.with(|name| unsafe { (*name).clone() }))
    }

    /// Returns the manager dependents of this future are scheduled on.
    ///
    /// For a scheduled task this is the manager running it, otherwise it is
    /// the first manager that was encountered among this future's dependents.
    #[must_use]
    pub fn manager(&self) -> Option<Arc<TaskManager>> {
        self.manager_weak().upgrade()
    }

    pub(crate) fn manager_weak(&self) -> Weak<TaskManager> {
        if let Some(core) = self.as_task() {
            let manager = core.manager_weak();
            if manager.strong_count() > 0 {
                return manager;
            }
        }

        self.with_locked(|locked| locked.manager.clone())
            // Safety: the future is terminal so the manager is immutable.
            .unwrap_or_else(|| self.manager.with(|manager| unsafe { (*manager).clone() }))
    }

    /// The manager a dependent registering with this future should adopt.
    /// Must be called from inside this future's locked window.
    ///
    /// A scheduled task keeps its manager in its scheduling slot rather than
    /// in the locked field, so that one takes precedence.
    pub(crate) fn locked_manager(&self, locked: &Locked<'_>) -> Weak<TaskManager> {
        self.as_task()
            .map(TaskCore::manager_weak)
            .filter(|manager| manager.strong_count() > 0)
            .unwrap_or_else(|| locked.manager.clone())
    }

    /// Drains the waiting list. Only the thread that moved this future into a
    /// terminal state may call this.
    pub(crate) fn take_waiting(&self) -> Vec<Waiter> {
        debug_assert!(self.done());
        // Safety: the future is terminal and the caller completed it, so no other thread
        // touches the waiting list anymore.
        self.waiting
            .with_mut(|waiting| unsafe { core::mem::take(&mut *waiting) })
    }

    /// Returns the name of the done event. Only valid once the future is terminal.
    pub(crate) fn terminal_done_event(&self) -> Option<String> {
        debug_assert!(self.done());
        // Safety: the future is terminal so the name is immutable.
        self.done_event.with(|name| unsafe { (*name).clone() })
    }

    /// Copies the result of `other` (a finished future) into this future, which
    /// must be inside the locked window.
    pub(crate) fn store_result_from(&self, other: &AsyncFuture) {
        debug_assert_eq!(self.state(), FutureState::LockedPending);
        let value = other.result_shared();
        // Safety: the caller holds our locked window.
        self.result.with_mut(|result| unsafe { *result = value });
    }

    fn is_current_task(&self) -> bool {
        self.is_task() && task::current_task_id() == Some(self.id)
    }
}

// Safety: all interior mutability is synchronized through the state word, see the type level docs.
unsafe impl Send for AsyncFuture {}
// Safety: all interior mutability is synchronized through the state word, see the type level docs.
unsafe impl Sync for AsyncFuture {}

impl fmt::Display for AsyncFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            FutureKind::Plain => write!(f, "AsyncFuture({})", self.id)?,
            FutureKind::Gathering(gathering) => write!(
                f,
                "AsyncGatheringFuture({}, {} futures)",
                self.id,
                gathering.num_futures()
            )?,
            FutureKind::Task(core) => write!(f, "AsyncTask({}, {:?})", self.id, core.name())?,
        }
        write!(f, " [{}]", self.state())
    }
}

impl fmt::Debug for AsyncFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("AsyncFuture");
        s.field("id", &self.id).field("state", &self.state());
        match &self.kind {
            FutureKind::Plain => {}
            FutureKind::Gathering(gathering) => {
                s.field("num_futures", &gathering.num_futures());
            }
            FutureKind::Task(core) => {
                s.field("task", &core.name());
            }
        }
        s.finish_non_exhaustive()
    }
}

impl Drop for AsyncFuture {
    fn drop(&mut self) {
        // Safety: we have exclusive access.
        let stranded = self.waiting.with(|waiting| unsafe {
            (*waiting)
                .iter()
                .filter(|waiter| matches!(waiter, Waiter::Future(_)))
                .count()
        });

        if stranded > 0 {
            tracing::error!(
                future = %self,
                stranded,
                "future destroyed before completion while dependents were still waiting on it"
            );
            debug_assert!(
                std::thread::panicking(),
                "{self} destroyed with {stranded} waiting dependents"
            );
        }
    }
}

#[cfg(not(loom))]
fn park_timeout(dur: Duration) {
    thread::park_timeout(dur);
}

#[cfg(loom)]
fn park_timeout(_dur: Duration) {
    // loom doesn't model time
    thread::yield_now();
}


#[cfg(all(test, loom))]
mod loom_tests {
    use super::*;
    use crate::loom::{self, thread};

    #[test]
    fn set_result_races_cancel() {
        loom::model(|| {
            let fut = AsyncFuture::new();

            let setter = thread::spawn({
                let fut = fut.clone();
                move || fut.set_result(1_u8)
            });

            let cancelled = fut.cancel();
            setter.join().unwrap();

            assert!(fut.done());
            assert_eq!(cancelled, fut.cancelled());
            assert_eq!(fut.get_result::<u8>().is_some(), !cancelled);
        });
    }

    #[test]
    fn wait_sees_result() {
        loom::model(|| {
            let fut = AsyncFuture::new();

            let setter = thread::spawn({
                let fut = fut.clone();
                move || fut.set_result(42_i32)
            });

            fut.wait();
            assert_eq!(fut.get_result::<i32>(), Some(&42));
            setter.join().unwrap();
        });
    }
}
