// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::future::{AsyncFuture, Waiter};
use std::sync::Arc;

/// Returns a future that mirrors `inner` but can be cancelled independently.
///
/// Cancelling the returned future leaves `inner` running. When `inner`
/// finishes its result is forwarded to the shield (unless the shield was
/// cancelled first), and when `inner` is cancelled so is the shield.
///
/// If `inner` is already done it is returned as is.
///
/// ```
/// # use async_future::{AsyncFuture, shield};
/// let inner = AsyncFuture::new();
/// let outer = shield(&inner);
///
/// outer.cancel();
/// assert!(!inner.done());
///
/// inner.set_result(3_i32);
/// assert!(outer.cancelled());
/// assert_eq!(inner.get_result::<i32>(), Some(&3));
/// ```
#[tracing::instrument(level = "trace", skip_all, fields(inner = %inner))]
pub fn shield(inner: &Arc<AsyncFuture>) -> Arc<AsyncFuture> {
    let outer = AsyncFuture::new();

    let manager = inner.with_locked(|locked| {
        locked.waiting.push(Waiter::Future(outer.clone()));
        inner.locked_manager(&locked)
    });

    let Some(manager) = manager else {
        tracing::trace!("inner future already done, nothing to shield");
        return inner.clone();
    };

    if manager.strong_count() > 0 {
        outer.with_locked(|locked| *locked.manager = manager);
    }

    outer
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::test_util::trace_init;
    use crate::{DoneStatus, TaskBuilder, TaskManager};

    #[test]
    fn forwards_result() {
        let _trace = trace_init();

        let inner = AsyncFuture::new();
        let outer = shield(&inner);
        assert!(!Arc::ptr_eq(&inner, &outer));

        inner.set_result(String::from("shielded"));
        assert_eq!(
            outer.get_result::<String>().map(String::as_str),
            Some("shielded")
        );
    }

    #[test]
    fn forwards_cancellation() {
        let _trace = trace_init();

        let inner = AsyncFuture::new();
        let outer = shield(&inner);

        inner.cancel();
        assert!(outer.cancelled());
    }

    #[test]
    fn outer_cancel_leaves_inner_running() {
        let _trace = trace_init();

        let inner = AsyncFuture::new();
        let outer = shield(&inner);

        assert!(outer.cancel());
        assert!(!inner.done());

        inner.set_result(1_u8);
        assert!(outer.cancelled());
        assert!(outer.get_result::<u8>().is_none());
    }

    #[test]
    fn adopts_manager_of_scheduled_task() {
        let _trace = trace_init();

        let manager = TaskManager::new("shielded");
        let task = TaskBuilder::new("inner").build(|_| DoneStatus::Cont);
        manager.add(&task);

        let outer = shield(&task);
        assert!(Arc::ptr_eq(&outer.manager().unwrap(), &manager));

        assert!(manager.remove(&task));
        assert!(outer.cancelled());
    }

    #[test]
    fn done_inner_is_returned_as_is() {
        let _trace = trace_init();

        let inner = AsyncFuture::ready(());
        assert!(Arc::ptr_eq(&shield(&inner), &inner));
    }
}
