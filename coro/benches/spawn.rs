// Copyright 2025 coro contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Spawn-and-join throughput: how many child tasks a single scheduler can
//! create, run to completion, and reap per second.

use criterion::{Criterion, black_box, criterion_group, criterion_main};

fn spawn_join_one(c: &mut Criterion) {
    c.bench_function("spawn_join_one", |b| {
        b.iter(|| {
            coro::block_on(|| {
                let child = coro::spawn(|| black_box(1usize));
                *child.join().unwrap()
            })
            .unwrap()
        });
    });
}

fn spawn_join_batch(c: &mut Criterion) {
    const BATCH: usize = 64;

    c.bench_function("spawn_join_batch_64", |b| {
        b.iter(|| {
            coro::block_on(|| {
                let children: Vec<_> =
                    (0..BATCH).map(|i| coro::spawn(move || black_box(i))).collect();
                children.into_iter().map(|c| *c.join().unwrap()).sum::<usize>()
            })
            .unwrap()
        });
    });
}

fn spawn_nested(c: &mut Criterion) {
    c.bench_function("spawn_nested_chain", |b| {
        b.iter(|| {
            coro::block_on(|| {
                let outer = coro::spawn(|| {
                    let inner = coro::spawn(|| black_box(1usize));
                    *inner.join().unwrap() + 1
                });
                *outer.join().unwrap()
            })
            .unwrap()
        });
    });
}

criterion_group!(spawn, spawn_join_one, spawn_join_batch, spawn_nested);
criterion_main!(spawn);
