// Copyright 2025 coro contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The per-thread driver: picks the next runnable task, polls the reactor
//! when idle, and resumes tasks with their pending value or injection.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::error::Error;
use crate::reactor::{EpollReactor, Reactor, Wake, WakeupHandle};
use crate::run_queue::RunQueue;
use crate::task::{self, Outcome, Resume, TaskId, TaskRef, TaskState};

/// How often (in dispatcher switches) to force a non-blocking reactor poll,
/// guaranteeing I/O progress under CPU-bound fiber churn.
const POLL_EVERY_N_SWITCHES: u64 = 61;

#[derive(Debug, Clone, Copy, Default)]
pub struct Stats {
    pub switches: u64,
    pub polls: u64,
    pub ops: u64,
}

/// Per-thread scheduler state. Exactly one instance exists per OS thread
/// that calls [`crate::block_on`]; there is no cross-thread sharing.
pub(crate) struct Scheduler {
    run_queue: RunQueue,
    reactor: EpollReactor,
    tasks: HashMap<TaskId, TaskRef>,
    stats: Stats,
    idle_gc_period: Option<Duration>,
    last_gc: Instant,
    idle_proc: Option<Box<dyn FnMut()>>,
}

thread_local! {
    static SCHEDULER: RefCell<Option<Scheduler>> = const { RefCell::new(None) };
}

/// Builder for the per-thread [`Scheduler`], mirroring the teacher's
/// constructor-parameter style of configuration (no globals, no env vars).
pub struct SchedulerBuilder {
    idle_gc_period: Option<Duration>,
    idle_proc: Option<Box<dyn FnMut()>>,
}

impl SchedulerBuilder {
    pub fn new() -> Self {
        Self { idle_gc_period: None, idle_proc: None }
    }

    /// How often the reactor's idle hook should trigger a GC cycle.
    pub fn idle_gc_period(mut self, period: Duration) -> Self {
        self.idle_gc_period = Some(period);
        self
    }

    /// Callback invoked just before the reactor is about to block.
    pub fn idle_proc(mut self, f: impl FnMut() + 'static) -> Self {
        self.idle_proc = Some(Box::new(f));
        self
    }

    /// Installs this configuration as the current thread's scheduler and
    /// runs `root` to completion as the root task, returning its result.
    ///
    /// # Panics
    ///
    /// Panics if a scheduler is already running on this thread.
    pub fn block_on<F, T>(self, root: F) -> Result<T, Error>
    where
        F: FnOnce() -> T + 'static,
        T: 'static,
    {
        let reactor = EpollReactor::new().map_err(Error::Io)?;
        let scheduler = Scheduler {
            run_queue: RunQueue::new(),
            reactor,
            tasks: HashMap::new(),
            stats: Stats::default(),
            idle_gc_period: self.idle_gc_period,
            last_gc: Instant::now(),
            idle_proc: self.idle_proc,
        };

        let prev = SCHEDULER.with(|cell| cell.replace(Some(scheduler)));
        assert!(prev.is_none(), "a scheduler is already running on this thread");

        let span = tracing::trace_span!("task", task.name = "root");
        let handle = task::spawn_with(Some("root".to_owned()), span, None, root);

        let result = drive(&handle);

        SCHEDULER.with(|cell| *cell.borrow_mut() = None);

        match result {
            Err(()) => Err(Error::Deadlock),
            Ok(Err(join_error)) => Err(Error::RootTerminated(join_error)),
            Ok(Ok(v)) => Ok(
                // `drive` takes (rather than clones) the root's outcome, so
                // this is always the sole strong reference.
                Rc::try_unwrap(v).unwrap_or_else(|_| {
                    unreachable!("root task outcome should have exactly one owner")
                }),
            ),
        }
    }
}

impl Default for SchedulerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs the dispatcher loop until `root` terminates, returning its outcome.
///
/// The outer `Result` is `Err(())` only on deadlock (nothing left that could
/// ever make the root runnable again); the inner `Result` is the root task's
/// own outcome, which may be `Err` if it was cancelled or panicked.
///
/// Uses `task::take_root_outcome` rather than `root.join()`: the latter
/// suspends the *calling* task to wait, but this runs at the scheduler level
/// with no task of its own, and calling it only once `root` has already
/// finished means there's nothing to wait for.
fn drive<T: 'static>(root: &task::JoinHandle<T>) -> Result<Result<Rc<T>, task::JoinError>, ()> {
    loop {
        if root.is_finished() {
            return Ok(task::take_root_outcome(root));
        }
        if !tick() {
            return Err(());
        }
    }
}

/// Executed by every task switch. Returns `false` on deadlock.
fn tick() -> bool {
    let popped = with(|s| s.run_queue.pop_front());

    let (next, value) = match popped {
        Some(entry) => entry,
        None => {
            if !poll_reactor(true) {
                return false;
            }
            match with(|s| s.run_queue.pop_front()) {
                Some(entry) => entry,
                None => return true,
            }
        }
    };

    with(|s| {
        s.stats.switches += 1;
        if s.stats.switches % POLL_EVERY_N_SWITCHES == 0 {
            s.stats.ops += 1;
        }
    });

    if with(|s| s.stats.switches % POLL_EVERY_N_SWITCHES == 0) {
        poll_reactor(false);
    }

    tracing::trace!(target: "coro::fiber_switch", task.tid = %next.id());
    let result = task::with_current_set(next.clone(), || next.resume_fiber(value));
    if let fiber::FiberResult::Return(()) = result {
        tracing::trace!(target: "coro::fiber_terminate", task.tid = %next.id());
    }
    true
}

/// Polls the reactor once. Returns `false` if blocking was requested, the
/// run queue is still empty afterwards, and no watcher is outstanding:
/// nothing could ever make it runnable again.
fn poll_reactor(blocking: bool) -> bool {
    let no_watchers = with(|s| !s.reactor.has_referenced_watchers());
    if blocking && no_watchers && with(|s| s.run_queue.is_empty()) {
        return false;
    }

    if blocking {
        with(|s| {
            if let Some(proc) = s.idle_proc.as_mut() {
                proc();
            }
            if let Some(period) = s.idle_gc_period {
                if s.last_gc.elapsed() >= period {
                    s.last_gc = Instant::now();
                }
            }
        });
    }

    tracing::trace!(target: "coro::fiber_event_poll_enter", blocking);
    with(|s| {
        s.stats.polls += 1;
        let mut run_queue = std::mem::replace(&mut s.run_queue, RunQueue::new());
        let waker = SchedulerWake { run_queue: &mut run_queue };
        let _ = s.reactor.poll(blocking, &waker);
        std::mem::swap(&mut s.run_queue, &mut run_queue);
    });
    tracing::trace!(target: "coro::fiber_event_poll_leave", blocking);

    true
}

struct SchedulerWake<'a> {
    run_queue: &'a mut RunQueue,
}

impl Wake for SchedulerWake<'_> {
    fn wake(&self, task: TaskRef, value: Resume) {
        task.set_state(TaskState::Runnable);
        self.run_queue.push_back(task, value);
    }
}

/// Runs `f` with mutable access to the current thread's scheduler.
///
/// # Panics
///
/// Panics if called outside of [`SchedulerBuilder::block_on`].
pub(crate) fn with<R>(f: impl FnOnce(&mut Scheduler) -> R) -> R {
    SCHEDULER.with(|cell| {
        let mut guard = cell.borrow_mut();
        let scheduler = guard.as_mut().expect("no scheduler running on this thread");
        f(scheduler)
    })
}

pub(crate) fn register(task: TaskRef) {
    with(|s| {
        s.tasks.insert(task.id(), task);
    });
}

pub(crate) fn unregister(task: &TaskRef) {
    with(|s| {
        s.tasks.remove(&task.id());
    });
}

/// `schedule_fiber(task, value, prioritize)`: pushes into the run
/// queue, front if `prioritize`.
pub(crate) fn schedule(task: TaskRef, value: Resume, prioritize: bool) {
    task.set_state(TaskState::Runnable);
    with(|s| {
        if prioritize {
            s.run_queue.push_front(task, value);
        } else {
            s.run_queue.push_back(task, value);
        }
    });
}

/// A handle that can break the calling thread's scheduler out of a blocking
/// reactor poll from any other OS thread. See [`WakeupHandle`].
///
/// # Panics
///
/// Panics if called outside of a running scheduler (see [`crate::block_on`]).
pub fn wakeup_handle() -> WakeupHandle {
    with(|s| s.reactor.wakeup_handle())
}

pub(crate) fn register_io(
    fd: std::os::fd::RawFd,
    interest: crate::reactor::Interest,
    task: TaskRef,
) -> std::io::Result<()> {
    with(|s| s.reactor.register_io(fd, interest, task))
}

pub(crate) fn deregister_io(fd: std::os::fd::RawFd, task: &TaskRef) {
    with(|s| s.reactor.deregister_io(fd, task));
}

pub(crate) fn register_timer(
    after: Duration,
    task: TaskRef,
    resume: Resume,
) -> crate::reactor::TimerId {
    with(|s| s.reactor.register_timer(after, task, resume))
}

pub(crate) fn cancel_timer(id: crate::reactor::TimerId) {
    with(|s| s.reactor.cancel_timer(id));
}

pub(crate) fn register_child(pid: libc::pid_t, task: TaskRef) -> std::io::Result<()> {
    with(|s| s.reactor.register_child(pid, task))
}

pub fn stats() -> Stats {
    with(|s| s.stats)
}
