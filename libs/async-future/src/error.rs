// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;

/// Why [`AsyncFuture::result`] could not produce a value.
///
/// [`AsyncFuture::result`]: crate::AsyncFuture::result
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FutureError {
    /// The future was cancelled before a result was set.
    Cancelled,
    /// The future was still pending when the timeout elapsed.
    Timeout,
    /// The calling task asked for its own result while it is being serviced,
    /// which could never complete.
    WouldDeadlock,
}

impl fmt::Display for FutureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FutureError::Cancelled => f.write_str("future was cancelled"),
            FutureError::Timeout => f.write_str("timed out waiting for future"),
            FutureError::WouldDeadlock => {
                f.write_str("task cannot wait for its own completion while it is running")
            }
        }
    }
}

impl core::error::Error for FutureError {}
