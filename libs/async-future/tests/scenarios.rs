// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use async_future::{
    AsyncFuture, DoneStatus, EventQueue, FutureState, TaskBuilder, TaskManager, TaskState, gather,
};
use proptest::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::util::SubscriberInitExt;

fn trace_init() -> tracing::subscriber::DefaultGuard {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_thread_ids(true)
        .with_test_writer()
        .set_default()
}

#[test]
fn blocked_thread_sees_result() {
    let _trace = trace_init();

    let fut = AsyncFuture::new();
    let a = thread::spawn({
        let fut = fut.clone();
        move || {
            fut.wait();
            (fut.done(), fut.cancelled(), fut.get_result::<i32>().copied())
        }
    });

    thread::sleep(Duration::from_millis(20));
    let b = thread::spawn({
        let fut = fut.clone();
        move || fut.set_result(42_i32)
    });
    b.join().unwrap();

    assert_eq!(a.join().unwrap(), (true, false, Some(42)));
}

#[test]
fn gather_finishes_cleanly_with_cancelled_component() {
    let _trace = trace_init();

    let f1 = AsyncFuture::new();
    let f2 = AsyncFuture::new();
    let g = gather([f1.clone(), f2.clone()]);

    f1.set_result(1_i32);
    f2.cancel();

    assert!(g.done());
    assert!(!g.cancelled());
    assert_eq!(f1.get_result::<i32>(), Some(&1));
    assert!(f2.cancelled());
}

#[test]
fn add_waiting_task_after_completion_wakes_synchronously() {
    let _trace = trace_init();

    let manager = TaskManager::new("sync-wake");
    let fut = AsyncFuture::new();
    let task = TaskBuilder::new("late").build({
        let fut = fut.clone();
        let mut awaited = false;
        move |_| {
            if awaited {
                DoneStatus::Done
            } else {
                awaited = true;
                DoneStatus::Await(fut.clone())
            }
        }
    });

    // park the task without the future being registered yet by awaiting something else first
    let gate = AsyncFuture::new();
    let parked = TaskBuilder::new("parked").build({
        let gate = gate.clone();
        move |_| DoneStatus::Await(gate.clone())
    });
    manager.add(&parked);
    manager.poll();
    assert_eq!(parked.task_state(), Some(TaskState::Awaiting));

    fut.set_result(());
    assert!(!fut.add_waiting_task(&parked));
    assert_eq!(parked.task_state(), Some(TaskState::Active));

    manager.remove(&parked);
    gate.cancel();

    // awaiting a future that is already done resumes in the next epoch
    manager.add(&task);
    manager.poll();
    assert_eq!(task.task_state(), Some(TaskState::Active));
    manager.poll();
    assert!(task.done());
}

#[test]
fn inactive_task_is_born_on_wake() {
    let _trace = trace_init();

    let manager = TaskManager::new("birth");
    let births = Arc::new(AtomicUsize::new(0));

    let fut = AsyncFuture::new();
    let sentinel = TaskBuilder::new("sentinel").build({
        let fut = fut.clone();
        move |_| {
            if fut.done() {
                DoneStatus::Done
            } else {
                DoneStatus::Await(fut.clone())
            }
        }
    });
    manager.add(&sentinel);
    manager.poll();
    // fut now knows its manager

    let task = TaskBuilder::new("unborn")
        .upon_birth({
            let births = births.clone();
            move |_, _| {
                births.fetch_add(1, Ordering::Relaxed);
            }
        })
        .build(|_| DoneStatus::Done);

    assert!(fut.add_waiting_task(&task));
    assert_eq!(task.task_state(), Some(TaskState::Inactive));

    fut.set_result(());
    assert_eq!(births.load(Ordering::Relaxed), 1);
    assert!(manager.has_task(&task));

    manager.poll();
    assert!(task.done());
    assert!(sentinel.done());
}

/// Races `complete` on another thread against the polling thread registering
/// an awaiting task with the same future.
fn race_completion_with_registration(complete: fn(&AsyncFuture)) {
    for _ in 0..50 {
        let manager = TaskManager::new("race");
        let fut = AsyncFuture::new();
        let runs = Arc::new(AtomicUsize::new(0));

        let task = TaskBuilder::new("awaiter").build({
            let fut = fut.clone();
            let runs = runs.clone();
            move |_| {
                if runs.fetch_add(1, Ordering::Relaxed) == 0 {
                    DoneStatus::Await(fut.clone())
                } else {
                    DoneStatus::Done
                }
            }
        });
        manager.add(&task);

        let barrier = Arc::new(Barrier::new(2));
        let producer = thread::spawn({
            let fut = fut.clone();
            let barrier = barrier.clone();
            move || {
                barrier.wait();
                complete(&fut);
            }
        });

        barrier.wait();
        manager.poll();
        producer.join().unwrap();

        // the wake may have landed after the epoch ended
        if !task.done() {
            manager.poll();
        }

        assert!(task.done());
        assert_eq!(runs.load(Ordering::Relaxed), 2);
        assert_eq!(manager.num_tasks(), 0);
        assert_eq!(manager.find_task_chain("default").unwrap().num_awaiting, 0);
    }
}

#[test]
fn concurrent_completion_wakes_awaiting_task_once() {
    let _trace = trace_init();
    race_completion_with_registration(|fut| fut.set_result(()));
}

#[test]
fn concurrent_cancel_wakes_awaiting_task_once() {
    let _trace = trace_init();
    race_completion_with_registration(|fut| {
        fut.cancel();
    });
}

#[test]
fn removed_task_stays_removed_when_woken_concurrently() {
    let _trace = trace_init();

    for _ in 0..2_000 {
        let manager = TaskManager::new("remove-race");
        let fut = AsyncFuture::new();
        let births = Arc::new(AtomicUsize::new(0));
        let runs = Arc::new(AtomicUsize::new(0));

        let task = TaskBuilder::new("awaiter")
            .upon_birth({
                let births = births.clone();
                move |_, _| {
                    births.fetch_add(1, Ordering::Relaxed);
                }
            })
            .build({
                let fut = fut.clone();
                let runs = runs.clone();
                move |_| {
                    runs.fetch_add(1, Ordering::Relaxed);
                    DoneStatus::Await(fut.clone())
                }
            });
        manager.add(&task);
        manager.poll();
        assert_eq!(task.task_state(), Some(TaskState::Awaiting));

        let barrier = Arc::new(Barrier::new(2));
        let producer = thread::spawn({
            let fut = fut.clone();
            let barrier = barrier.clone();
            move || {
                barrier.wait();
                fut.set_result(());
            }
        });

        barrier.wait();
        assert!(manager.remove(&task));
        producer.join().unwrap();
        manager.poll();

        assert!(task.cancelled());
        assert_eq!(task.task_state(), Some(TaskState::Inactive));
        assert_eq!(births.load(Ordering::Relaxed), 1);
        assert_eq!(runs.load(Ordering::Relaxed), 1);
        assert_eq!(manager.num_tasks(), 0);
        assert!(!TaskManager::global().has_task(&task));
    }
}

#[test]
fn done_event_is_posted_for_tasks() {
    let _trace = trace_init();

    let manager = TaskManager::new("events");
    let task = TaskBuilder::new("eventful").build(|cx| {
        cx.task().set_result("done");
        DoneStatus::Done
    });
    task.set_done_event("scenario-task-done");

    manager.add(&task);
    manager.poll();

    assert_eq!(task.get_result::<&str>(), Some(&"done"));
    let events = EventQueue::global().take_events("scenario-task-done");
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].name(), "scenario-task-done");
    assert!(Arc::ptr_eq(events[0].parameter(), &task));
}

#[test]
fn cancelling_gather_of_tasks() {
    let _trace = trace_init();

    let manager = TaskManager::new("gather-tasks");
    let tasks: Vec<_> = (0..4)
        .map(|i| {
            let task = TaskBuilder::new(format!("spinner-{i}")).build(|_| DoneStatus::Cont);
            manager.add(&task);
            task
        })
        .collect();

    let all = gather(tasks.iter().cloned());
    manager.poll();
    assert!(!all.done());

    assert!(all.cancel());
    assert!(all.cancelled());
    assert!(tasks.iter().all(|task| task.cancelled()));
    assert_eq!(manager.num_tasks(), 0);
}

proptest! {
    #[test]
    fn at_most_once_result(setters in 1_usize..4, cancellers in 0_usize..4) {
        let fut = AsyncFuture::new();
        let barrier = Arc::new(Barrier::new(setters + cancellers));

        let mut joins = Vec::new();
        for i in 0..setters {
            let fut = fut.clone();
            let barrier = barrier.clone();
            joins.push(thread::spawn(move || {
                barrier.wait();
                fut.set_result(i);
                false
            }));
        }
        for _ in 0..cancellers {
            let fut = fut.clone();
            let barrier = barrier.clone();
            joins.push(thread::spawn(move || {
                barrier.wait();
                fut.cancel()
            }));
        }

        let successful_cancels = joins
            .into_iter()
            .map(|join| join.join().unwrap())
            .filter(|cancelled| *cancelled)
            .count();

        prop_assert!(fut.done());
        match fut.state() {
            FutureState::Cancelled => {
                prop_assert_eq!(successful_cancels, 1);
                prop_assert!(fut.get_result::<usize>().is_none());
            }
            FutureState::Finished => {
                prop_assert_eq!(successful_cancels, 0);
                prop_assert!(fut.get_result::<usize>().is_some_and(|i| *i < setters));
            }
            state => prop_assert!(false, "future ended up {state}"),
        }
    }
}
