// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::hint;

/// Contention handling for the locked window of an [`AsyncFuture`] and the
/// scheduler's spin mutex.
///
/// Both critical sections are a handful of instructions long, so a waiter
/// first issues `2^step` [spin loop hints] per round. Once `step` reaches
/// [`Backoff::SPIN_LIMIT`] the holder was most likely preempted, and every
/// further round gives the time slice back to the operating system instead.
///
/// [spin loop hints]: hint::spin_loop
/// [`AsyncFuture`]: crate::AsyncFuture
#[derive(Debug)]
pub(crate) struct Backoff {
    step: u8,
}

// === impl Backoff ===

impl Backoff {
    pub(crate) const SPIN_LIMIT: u8 = 6;

    pub(crate) const fn new() -> Self {
        Self { step: 0 }
    }

    /// Waits a little before the caller retries.
    #[inline]
    pub(crate) fn snooze(&mut self) {
        if self.step >= Self::SPIN_LIMIT {
            crate::loom::thread::yield_now();
            return;
        }

        for _ in 0..1_u32 << self.step {
            // loom only schedules other threads at explicit yield points
            #[cfg(loom)]
            crate::loom::thread::yield_now();

            hint::spin_loop();
        }
        self.step += 1;
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn spins_then_yields() {
        let mut backoff = Backoff::new();
        for step in 0..Backoff::SPIN_LIMIT {
            assert_eq!(backoff.step, step);
            backoff.snooze();
        }

        // yielding rounds leave the step where it is
        backoff.snooze();
        assert_eq!(backoff.step, Backoff::SPIN_LIMIT);
    }
}
