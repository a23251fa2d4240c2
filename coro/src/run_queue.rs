// Copyright 2025 coro contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! FIFO of runnable tasks with priority front-insertion.

use std::collections::VecDeque;

use crate::task::{Resume, TaskRef};

struct Entry {
    task: TaskRef,
    value: Resume,
}

/// At most one pending entry per task: if a task is already queued and is
/// scheduled again without priority, the original entry stands.
pub(crate) struct RunQueue {
    entries: VecDeque<Entry>,
}

impl RunQueue {
    pub(crate) fn new() -> Self {
        Self { entries: VecDeque::new() }
    }

    pub(crate) fn push_back(&mut self, task: TaskRef, value: Resume) {
        if self.contains(&task) {
            return;
        }
        self.entries.push_back(Entry { task, value });
    }

    /// Priority resume: used by `interrupt`/`cancel!` to preempt ordinary
    /// scheduling. If the task already has a pending entry it is removed
    /// first, since prioritizing replaces the pending value.
    pub(crate) fn push_front(&mut self, task: TaskRef, value: Resume) {
        self.delete(&task);
        self.entries.push_front(Entry { task, value });
    }

    pub(crate) fn pop_front(&mut self) -> Option<(TaskRef, Resume)> {
        self.entries.pop_front().map(|e| (e.task, e.value))
    }

    /// Removes any pending entry for `task`. Idempotent.
    pub(crate) fn delete(&mut self, task: &TaskRef) {
        self.entries.retain(|e| &e.task != task);
    }

    pub(crate) fn contains(&self, task: &TaskRef) -> bool {
        self.entries.iter().any(|e| &e.task == task)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
