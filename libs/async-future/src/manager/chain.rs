// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::future::AsyncFuture;
use std::collections::VecDeque;
use std::sync::Arc;

/// A named queue of tasks inside a [`TaskManager`](crate::TaskManager).
///
/// Only ever accessed with the manager's lock held.
#[derive(Debug)]
pub(crate) struct TaskChain {
    name: String,
    /// Tasks to service in the current epoch.
    pub(super) active: VecDeque<Arc<AsyncFuture>>,
    /// Tasks that asked to run again, serviced starting with the next epoch.
    pub(super) next_active: VecDeque<Arc<AsyncFuture>>,
    /// Every task owned by this chain, no matter its state.
    pub(super) num_tasks: usize,
    /// Tasks sleeping until a future they await is done.
    pub(super) num_awaiting: usize,
}

/// A point-in-time snapshot of a chain's bookkeeping.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ChainInfo {
    pub name: String,
    pub num_tasks: usize,
    pub num_active: usize,
    pub num_awaiting: usize,
}

// === impl TaskChain ===

impl TaskChain {
    pub(super) fn new(name: String) -> Self {
        Self {
            name,
            active: VecDeque::new(),
            next_active: VecDeque::new(),
            num_tasks: 0,
            num_awaiting: 0,
        }
    }

    /// Starts a new epoch: everything that asked to run again becomes active.
    pub(super) fn start_epoch(&mut self) {
        let next = core::mem::take(&mut self.next_active);
        self.active.extend(next);
    }

    /// Unlinks `task` from whichever queue it sits in. Returns `false` if it wasn't queued.
    pub(super) fn unqueue(&mut self, task: &AsyncFuture) -> bool {
        for queue in [&mut self.active, &mut self.next_active] {
            if let Some(pos) = queue.iter().position(|queued| queued.id() == task.id()) {
                queue.remove(pos);
                return true;
            }
        }
        false
    }

    pub(super) fn info(&self) -> ChainInfo {
        ChainInfo {
            name: self.name.clone(),
            num_tasks: self.num_tasks,
            num_active: self.active.len() + self.next_active.len(),
            num_awaiting: self.num_awaiting,
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn epochs_and_unqueue() {
        let mut chain = TaskChain::new("test".to_string());
        let a = AsyncFuture::new();
        let b = AsyncFuture::new();

        chain.active.push_back(a.clone());
        chain.next_active.push_back(b.clone());
        assert_eq!(chain.info().num_active, 2);

        chain.start_epoch();
        assert!(chain.next_active.is_empty());
        assert_eq!(chain.active.len(), 2);

        assert!(chain.unqueue(&b));
        assert!(!chain.unqueue(&b));
        assert_eq!(chain.active.len(), 1);
        assert!(Arc::ptr_eq(&chain.active[0], &a));
    }
}
