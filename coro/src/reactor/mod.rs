// Copyright 2025 coro contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The I/O event multiplexer.
//!
//! A [`Reactor`] owns every outstanding wait: FD readiness, timers, child-exit
//! watches and cross-thread wakeups. It translates OS readiness into
//! `(task, resume value)` pairs pushed onto the scheduler's run queue --
//! the reactor itself never touches task state directly, it only calls back
//! into the scheduler through [`Wake`].

mod epoll;
mod timer;

pub(crate) use epoll::EpollReactor;
pub(crate) use timer::{TimerId, TimerWheel};

use std::os::fd::RawFd;
use std::time::Duration;

use crate::task::{Resume, TaskRef};

/// Interest set for an FD watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Interest {
    pub(crate) readable: bool,
    pub(crate) writable: bool,
}

impl Interest {
    pub(crate) const READABLE: Self = Self { readable: true, writable: false };
    pub(crate) const WRITABLE: Self = Self { readable: false, writable: true };
}

/// A single outstanding registration with the reactor.
///
/// Every watcher is owned by whichever task is currently blocked on it: it is
/// installed on entry to the wait and removed on every exit path, including
/// cancellation, by the primitive that created it (see `ops::wait_io` et al).
pub(crate) enum Watcher {
    Io { fd: RawFd, interest: Interest, task: TaskRef },
    Timer { id: TimerId, task: TaskRef },
    Child { pid: libc::pid_t, task: TaskRef },
    Async { task: TaskRef },
}

/// Callback surface the reactor uses to hand readiness back to the scheduler.
///
/// Kept as a trait (rather than a direct `Scheduler` dependency) so the
/// reactor module never needs to know about run-queue internals; it only
/// needs somewhere to deposit a woken task.
pub(crate) trait Wake {
    /// Schedule `task` to resume with `value`, at the back of the run queue.
    fn wake(&self, task: TaskRef, value: crate::task::Resume);
}

/// Outcome of reaping a child process, delivered as the `wait_child` resume
/// value.
#[derive(Debug, Clone, Copy)]
pub struct ExitStatus {
    pub pid: libc::pid_t,
    pub code: i32,
}

/// Pluggable OS event backend. `coro` ships exactly one implementation,
/// [`EpollReactor`], but keeps the choice of OS primitive behind this trait
/// as the extension point a kqueue or io_uring backend would plug into.
pub(crate) trait Reactor {
    /// Registers interest in `fd`'s readiness. The FD is set non-blocking as
    /// a side effect if it is not already.
    fn register_io(&mut self, fd: RawFd, interest: Interest, task: TaskRef) -> std::io::Result<()>;

    /// Removes a previously registered FD interest. Idempotent.
    fn deregister_io(&mut self, fd: RawFd, task: &TaskRef);

    /// Arms a one-shot timer firing after `after`. On expiry `task` is
    /// resumed with `resume` (a plain value for `sleep`, or an injected
    /// `Timeout` sentinel for `timeout`/`cancel_after`). Returns an id usable
    /// with [`Reactor::cancel_timer`].
    fn register_timer(&mut self, after: Duration, task: TaskRef, resume: Resume) -> TimerId;

    /// Disarms a timer before it fires. Idempotent.
    fn cancel_timer(&mut self, id: TimerId);

    /// Registers interest in `pid`'s termination via a pidfd.
    fn register_child(&mut self, pid: libc::pid_t, task: TaskRef) -> std::io::Result<()>;

    /// An unreferenced cross-thread wakeup source: its mere presence never
    /// keeps [`Reactor::poll`] blocking forever.
    fn wakeup_handle(&self) -> WakeupHandle;

    /// Runs one iteration. When `blocking` is true and nothing is ready,
    /// parks the calling thread until an event fires or `wakeup_handle` is
    /// signalled. Woken tasks are pushed into `wake`.
    fn poll(&mut self, blocking: bool, wake: &dyn Wake) -> std::io::Result<()>;

    /// True if there is at least one *referenced* watcher outstanding, i.e.
    /// the reactor could still produce progress on its own.
    fn has_referenced_watchers(&self) -> bool;
}

/// A thread-safe, `Clone`-able handle that can break a blocking
/// [`Reactor::poll`] from another OS thread. Must be async-signal-safe to
/// invoke.
///
/// This is the one mechanism that crosses OS thread boundaries (see
/// `spec.md` §5, "Cross-thread safety"): every other part of the runtime --
/// the run queue, task handles, mailboxes -- is `Rc`-based and lives on a
/// single thread. An application that wants to hand work to a task running
/// on a *different* scheduler builds its own thread-safe queue (an
/// `std::sync::mpsc` channel, a lock-free ring buffer, ...) and pairs it with
/// a `WakeupHandle` obtained from that scheduler: push onto the queue, then
/// call `wakeup()` to break the target thread out of a blocking reactor poll
/// so a task there (waiting in [`crate::ops::wait_event`] or polling the
/// queue directly) notices the new item. Building and owning that queue is
/// application code's job, not the runtime's -- see `spec.md` §1 Non-goals.
#[derive(Clone)]
pub struct WakeupHandle {
    inner: std::sync::Arc<epoll::EventFd>,
}

impl WakeupHandle {
    pub(crate) fn new(inner: std::sync::Arc<epoll::EventFd>) -> Self {
        Self { inner }
    }

    /// Breaks a blocking [`Reactor::poll`] on the scheduler this handle was
    /// obtained from. Safe to call from any thread, including from a signal
    /// handler.
    pub fn wakeup(&self) {
        self.inner.notify();
    }
}
