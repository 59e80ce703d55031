// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::future::AsyncFuture;
use crate::sync::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// A named notification carrying the future that triggered it.
#[derive(Debug, Clone)]
pub struct Event {
    name: String,
    parameter: Arc<AsyncFuture>,
}

/// A FIFO of [`Event`]s.
///
/// Futures post their done event to the [global queue](EventQueue::global)
/// when they finish cleanly. Consumers drain it at their own pace.
#[derive(Debug, Default)]
pub struct EventQueue {
    events: Mutex<VecDeque<Event>>,
}

crate::loom::lazy_static! {
    static ref GLOBAL: EventQueue = EventQueue::new();
}

// === impl Event ===

impl Event {
    pub fn new(name: impl Into<String>, parameter: Arc<AsyncFuture>) -> Self {
        Self {
            name: name.into(),
            parameter,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The future whose completion posted this event.
    #[must_use]
    pub fn parameter(&self) -> &Arc<AsyncFuture> {
        &self.parameter
    }
}

// === impl EventQueue ===

impl EventQueue {
    #[must_use]
    pub fn new() -> Self {
        Self {
            events: Mutex::new(VecDeque::new()),
        }
    }

    #[must_use]
    pub fn global() -> &'static EventQueue {
        &GLOBAL
    }

    pub fn queue_event(&self, event: Event) {
        tracing::trace!(event = %event.name, "queueing event");
        self.events.lock().push_back(event);
    }

    /// Pops the oldest event.
    pub fn pop(&self) -> Option<Event> {
        self.events.lock().pop_front()
    }

    /// Removes and returns all queued events called `name`, oldest first.
    pub fn take_events(&self, name: &str) -> Vec<Event> {
        let mut events = self.events.lock();
        let mut taken = Vec::new();
        events.retain(|event| {
            if event.name == name {
                taken.push(event.clone());
                false
            } else {
                true
            }
        });
        taken
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}
