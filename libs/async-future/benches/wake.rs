// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use async_future::{AsyncFuture, DoneStatus, TaskBuilder, TaskManager, gather};
use criterion::{Criterion, criterion_group, criterion_main};
use std::sync::Arc;

fn set_result_10k(c: &mut Criterion) {
    const FUTURES: usize = 10_000;

    c.bench_function("set_result_10k", |b| {
        b.iter(|| {
            for i in 0..FUTURES {
                let fut = AsyncFuture::new();
                fut.set_result(i);
            }
        });
    });
}

fn gather_1k(c: &mut Criterion) {
    const FUTURES: usize = 1_000;

    c.bench_function("gather_1k", |b| {
        b.iter(|| {
            let futures: Vec<_> = (0..FUTURES).map(|_| AsyncFuture::new()).collect();
            let all = gather(futures.iter().cloned());
            for fut in &futures {
                fut.set_result(());
            }
            assert!(all.done());
        });
    });
}

fn await_ping_pong_10k(c: &mut Criterion) {
    const PINGS: usize = 10_000;

    let manager = TaskManager::new("bench");

    c.bench_function("await_ping_pong_10k", |b| {
        b.iter(|| {
            let mut pings = 0;
            let task = TaskBuilder::new("ping").build(move |_| {
                if pings == PINGS {
                    return DoneStatus::Done;
                }
                pings += 1;
                DoneStatus::Await(AsyncFuture::ready(pings))
            });

            // every await of a done future resumes one epoch later
            manager.add(&task);
            while !task.done() {
                manager.poll();
            }
        });
    });
}

fn wake_blocked_thread(c: &mut Criterion) {
    c.bench_function("wake_blocked_thread", |b| {
        b.iter(|| {
            let fut = AsyncFuture::new();
            let waiter = std::thread::spawn({
                let fut = Arc::clone(&fut);
                move || fut.wait()
            });
            fut.set_result(());
            waiter.join().unwrap();
        });
    });
}

criterion_group!(
    benches,
    set_result_10k,
    gather_1k,
    await_ping_pong_10k,
    wake_blocked_thread
);
criterion_main!(benches);
