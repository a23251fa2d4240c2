// Copyright 2025 coro contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Timer deadlines, ordered by a min-heap.
//!
//! The teacher's async executors model timers behind a `Clock`/`RawClock`
//! vtable abstraction for `no_std` hardware clocks and a hierarchical timing
//! wheel for O(1) amortized insertion at large fleet sizes (see
//! `kasync::time`). Neither concern applies to a hosted, single-threaded
//! reactor with a handful of outstanding timers at once, so `coro` uses a
//! plain [`BinaryHeap`] of deadlines against [`std::time::Instant`] -- this
//! simplification is recorded in `DESIGN.md`.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::time::{Duration, Instant};

use crate::task::{Resume, TaskRef};

/// Identifies one armed timer so it can be cancelled before it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct TimerId(u64);

struct Entry {
    deadline: Instant,
    id: TimerId,
    task: TaskRef,
    resume: Resume,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.id == other.id
    }
}
impl Eq for Entry {}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse so the earliest deadline sorts first.
        other.deadline.cmp(&self.deadline).then_with(|| other.id.0.cmp(&self.id.0))
    }
}
impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A min-heap of armed timers, plus the monotonically increasing id counter
/// used to name them.
///
/// Cancelled timers are recorded in `cancelled` rather than removed from the
/// heap in place -- `BinaryHeap` has no safe way to mutate an element without
/// breaking its ordering invariant, and timers are cancelled far more often
/// than they fire, so lazy removal on pop is the cheaper discipline.
///
/// `armed` tracks every id that is still sitting in the heap (whether
/// cancelled-but-not-yet-reaped or still live). It lets [`TimerWheel::cancel`]
/// report whether it actually disarmed a live timer, which is what the
/// reactor's referenced-watcher count needs: decrementing once per arm and
/// once per disarm, never for a timer that already fired.
pub(crate) struct TimerWheel {
    heap: BinaryHeap<Entry>,
    cancelled: HashSet<TimerId>,
    armed: HashSet<TimerId>,
    next_id: u64,
}

impl TimerWheel {
    pub(crate) fn new() -> Self {
        Self { heap: BinaryHeap::new(), cancelled: HashSet::new(), armed: HashSet::new(), next_id: 0 }
    }

    pub(crate) fn arm(&mut self, after: Duration, task: TaskRef, resume: Resume) -> TimerId {
        self.arm_at(Instant::now() + after, task, resume)
    }

    /// Arms at an absolute deadline, used by `timer_loop` to anchor
    /// successive ticks to a base time and avoid drift.
    pub(crate) fn arm_at(&mut self, deadline: Instant, task: TaskRef, resume: Resume) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        self.armed.insert(id);
        self.heap.push(Entry { deadline, id, task, resume });
        id
    }

    /// Marks `id` as cancelled, unless it has already fired (and was reaped
    /// by [`TimerWheel::pop_due`]) or was already cancelled. Returns whether
    /// a live timer was actually disarmed.
    pub(crate) fn cancel(&mut self, id: TimerId) -> bool {
        if self.armed.remove(&id) {
            self.cancelled.insert(id);
            true
        } else {
            false
        }
    }

    /// Duration until the next live deadline, or `None` if no timers are armed.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.heap.iter().filter(|e| !self.cancelled.contains(&e.id)).map(|e| e.deadline).min()
    }

    /// Pops every entry whose deadline has passed, skipping cancelled ones.
    pub(crate) fn pop_due(&mut self, now: Instant) -> Vec<(TaskRef, Resume)> {
        let mut fired = Vec::new();
        while let Some(top) = self.heap.peek() {
            if top.deadline > now {
                break;
            }
            let entry = self.heap.pop().expect("peeked Some");
            self.armed.remove(&entry.id);
            if !self.cancelled.remove(&entry.id) {
                fired.push((entry.task, entry.resume));
            }
        }
        fired
    }
}
