// Copyright 2025 coro contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Mailbox round-trip latency: two tasks bounce a decrementing counter back
//! and forth over their mailboxes until it reaches zero.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use criterion::{Criterion, criterion_group, criterion_main};

/// Receives values from the current task's mailbox, forwarding `v - 1` to
/// `peer` until a `0` is received. Requires the very first value ever sent
/// into this chain to be >= 1.
fn bounce_loop(peer: &coro::JoinHandle<()>) {
    loop {
        let v = *coro::ops::receive::<usize>();
        if v == 0 {
            break;
        }
        let next = v - 1;
        peer.send(next);
        if next == 0 {
            break;
        }
    }
}

fn round_trips(hops: usize) {
    coro::block_on(move || {
        let pong_slot: Rc<RefCell<Option<coro::JoinHandle<()>>>> = Rc::new(RefCell::new(None));
        let ping_slot: Rc<RefCell<Option<coro::JoinHandle<()>>>> = Rc::new(RefCell::new(None));
        let done = Rc::new(Cell::new(0u32));

        let pong_slot_in_ping = pong_slot.clone();
        let done_in_ping = done.clone();
        let ping = coro::spawn(move || {
            loop {
                if pong_slot_in_ping.borrow().is_some() {
                    break;
                }
                coro::ops::snooze();
            }
            let pong = pong_slot_in_ping.borrow_mut().take().unwrap();
            pong.send(hops);
            bounce_loop(&pong);
            done_in_ping.set(done_in_ping.get() + 1);
        });

        let ping_slot_in_pong = ping_slot.clone();
        let done_in_pong = done.clone();
        let pong = coro::spawn(move || {
            loop {
                if ping_slot_in_pong.borrow().is_some() {
                    break;
                }
                coro::ops::snooze();
            }
            let ping = ping_slot_in_pong.borrow_mut().take().unwrap();
            bounce_loop(&ping);
            done_in_pong.set(done_in_pong.get() + 1);
        });

        // Hand each task a handle to the other now that both exist.
        *pong_slot.borrow_mut() = Some(pong);
        *ping_slot.borrow_mut() = Some(ping);

        while done.get() < 2 {
            coro::ops::snooze();
        }
    })
    .unwrap();
}

fn ping_pong_100(c: &mut Criterion) {
    c.bench_function("ping_pong_100_hops", |b| b.iter(|| round_trips(100)));
}

fn ping_pong_1000(c: &mut Criterion) {
    c.bench_function("ping_pong_1000_hops", |b| b.iter(|| round_trips(1000)));
}

criterion_group!(ping_pong, ping_pong_100, ping_pong_1000);
criterion_main!(ping_pong);
