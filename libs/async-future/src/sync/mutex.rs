// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use super::Backoff;
use crate::loom::sync::atomic::{AtomicBool, Ordering};

/// The lock protecting a task manager's chains and task lifecycle states.
pub(crate) type Mutex<T> = lock_api::Mutex<RawSpinMutex, T>;
pub(crate) type MutexGuard<'a, T> = lock_api::MutexGuard<'a, RawSpinMutex, T>;

/// A test-and-test-and-set lock that snoozes (and eventually yields the
/// thread) while contended.
///
/// Critical sections under this lock never call back into future or task
/// code, so holders are always short-lived. Unlike `std::sync::Mutex` there is
/// no poisoning: a panicking task body runs with the lock released.
pub(crate) struct RawSpinMutex {
    #[cfg(not(loom))]
    lock: AtomicBool,
    // loom's atomics can't be created in a const context, the flag is built on first use
    #[cfg(loom)]
    lock: std::sync::OnceLock<AtomicBool>,
}

impl RawSpinMutex {
    #[cfg(not(loom))]
    #[inline]
    fn flag(&self) -> &AtomicBool {
        &self.lock
    }

    #[cfg(loom)]
    fn flag(&self) -> &AtomicBool {
        self.lock.get_or_init(|| AtomicBool::new(false))
    }
}

// Safety: `lock` only returns once the flag was flipped from `false` to `true` by this
// caller, which establishes exclusive ownership until `unlock` stores `false` again.
unsafe impl lock_api::RawMutex for RawSpinMutex {
    type GuardMarker = lock_api::GuardSend;

    #[cfg(not(loom))]
    const INIT: Self = Self {
        lock: AtomicBool::new(false),
    };
    #[cfg(loom)]
    const INIT: Self = Self {
        lock: std::sync::OnceLock::new(),
    };

    fn lock(&self) {
        let mut boff = Backoff::new();
        while self
            .flag()
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.is_locked() {
                boff.snooze();
            }
        }
    }

    fn try_lock(&self) -> bool {
        self.flag()
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    unsafe fn unlock(&self) {
        self.flag().store(false, Ordering::Release);
    }

    fn is_locked(&self) -> bool {
        self.flag().load(Ordering::Relaxed)
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn smoke() {
        let m = Mutex::new(());
        drop(m.lock());
        drop(m.lock());
    }

    #[test]
    fn try_lock() {
        let mutex = Mutex::new(42);

        let a = mutex.try_lock();
        assert_eq!(a.as_ref().map(|r| **r), Some(42));

        let b = mutex.try_lock();
        assert!(b.is_none());

        drop(a);
        let c = mutex.try_lock();
        assert_eq!(c.as_ref().map(|r| **r), Some(42));
    }

    #[test]
    fn contended_increments() {
        const THREADS: usize = 4;
        const ITERS: usize = 1_000;

        let counter = Arc::new(Mutex::new(0_usize));
        let joins: Vec<_> = (0..THREADS)
            .map(|_| {
                let counter = counter.clone();
                thread::spawn(move || {
                    for _ in 0..ITERS {
                        *counter.lock() += 1;
                    }
                })
            })
            .collect();

        for join in joins {
            join.join().unwrap();
        }

        assert_eq!(*counter.lock(), THREADS * ITERS);
    }
}
