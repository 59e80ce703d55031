// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Futures that complete once every future in a fixed set is done.

use crate::future::{AsyncFuture, FutureKind, FutureState, Waiter};
use crate::loom::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

/// The state of a gathering future, see [`gather`].
///
/// A gathering future finishes (never cancels on its own) once all of its
/// components are done, regardless of whether they finished or were
/// cancelled. It carries no result of its own; inspect the components via
/// [`AsyncGatheringFuture::futures`] instead.
#[derive(Debug)]
pub struct AsyncGatheringFuture {
    futures: Box<[Arc<AsyncFuture>]>,
    num_pending: AtomicUsize,
}

/// Returns a future that finishes once all of `futures` are done.
///
/// Components that are already done are not waited for; if all of them are,
/// the returned future is finished right away. The first task manager found
/// among the components is adopted as the gathering future's manager.
///
/// ```
/// # use async_future::{AsyncFuture, gather};
/// let a = AsyncFuture::new();
/// let b = AsyncFuture::new();
/// let all = gather([a.clone(), b.clone()]);
///
/// a.set_result(1_u32);
/// assert!(!all.done());
/// b.cancel();
/// assert!(all.done() && !all.cancelled());
/// ```
#[tracing::instrument(level = "trace", skip_all)]
pub fn gather<I>(futures: I) -> Arc<AsyncFuture>
where
    I: IntoIterator<Item = Arc<AsyncFuture>>,
{
    // the bias of one keeps the count from reaching zero while we are still registering
    let this = AsyncFuture::with_kind(FutureKind::Gathering(AsyncGatheringFuture {
        futures: futures.into_iter().collect(),
        num_pending: AtomicUsize::new(1),
    }));
    let Some(gathering) = this.as_gathering() else {
        unreachable!("just created a gathering future");
    };

    let mut manager = Weak::new();
    for fut in &gathering.futures {
        // the count has to be raised inside the window, or the component could complete and
        // decrement it before we got here
        fut.with_locked(|locked| {
            locked.waiting.push(Waiter::Future(this.clone()));
            gathering.num_pending.fetch_add(1, Ordering::Relaxed);
            if manager.strong_count() == 0 {
                manager = fut.locked_manager(&locked);
            }
        });
    }

    if manager.strong_count() > 0 {
        this.with_locked(|locked| *locked.manager = manager);
    }

    tracing::trace!(
        gather = %this,
        num_pending = gathering.num_pending.load(Ordering::Relaxed) - 1,
        "registered with components"
    );

    // drop the bias, this may complete the gathering future right here
    gathering.component_done(&this);
    this
}

impl AsyncFuture {
    /// Shorthand for [`gather`].
    pub fn gather<I>(futures: I) -> Arc<AsyncFuture>
    where
        I: IntoIterator<Item = Arc<AsyncFuture>>,
    {
        gather(futures)
    }
}

// === impl AsyncGatheringFuture ===

impl AsyncGatheringFuture {
    #[must_use]
    pub fn num_futures(&self) -> usize {
        self.futures.len()
    }

    /// Returns the `n`-th component.
    #[must_use]
    pub fn future(&self, n: usize) -> Option<&Arc<AsyncFuture>> {
        self.futures.get(n)
    }

    /// All components, in the order they were passed to [`gather`].
    #[must_use]
    pub fn futures(&self) -> &[Arc<AsyncFuture>] {
        &self.futures
    }

    /// Number of components that are not yet done.
    ///
    /// This is a snapshot meant for diagnostics, it may be stale by the time
    /// it is returned.
    #[must_use]
    pub fn num_pending(&self) -> usize {
        // hide the registration bias while the constructor is running
        self.futures
            .len()
            .min(self.num_pending.load(Ordering::Acquire))
    }

    /// Called whenever a component is done. `outer` is the gathering future
    /// owning this state.
    pub(crate) fn component_done(&self, outer: &AsyncFuture) {
        if self.num_pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            tracing::trace!(gather = %outer, "all components done");
            if outer.set_future_state(FutureState::Finished) {
                outer.notify_done(true);
            }
        }
    }

    /// Cancels every component, then the gathering future itself.
    ///
    /// Returns `true` if at least one component was cancelled by this call.
    /// Once this returns every component is done. The gathering future ends
    /// up cancelled if all component completions were processed by then;
    /// otherwise the last one to be processed finishes it.
    #[tracing::instrument(level = "trace", skip_all, fields(gather = %outer))]
    pub(crate) fn cancel(&self, outer: &AsyncFuture) -> bool {
        if outer.done() {
            return false;
        }

        // bias the count so that cancelling the components can't complete us halfway through
        self.num_pending.fetch_add(1, Ordering::AcqRel);

        let mut any_cancelled = false;
        for fut in &self.futures {
            if fut.cancel() {
                any_cancelled = true;
            }
        }

        if self.num_pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            if outer.set_future_state(FutureState::Cancelled) {
                outer.notify_done(false);
            }
        } else {
            tracing::trace!("components still completing, gathering future will finish instead");
        }

        any_cancelled
    }
}


#[cfg(all(test, loom))]
mod loom_tests {
    use super::*;
    use crate::loom::{self, thread};

    #[test]
    fn components_complete_during_gather() {
        loom::model(|| {
            let a = AsyncFuture::new();
            let b = AsyncFuture::new();

            let completer = thread::spawn({
                let a = a.clone();
                let b = b.clone();
                move || {
                    a.set_result(());
                    b.cancel();
                }
            });

            let all = gather([a, b]);
            completer.join().unwrap();

            assert_eq!(all.state(), FutureState::Finished);
        });
    }
}
