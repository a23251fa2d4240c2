// Copyright 2025 coro contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Global suspension primitives and structured-concurrency fan-in.
//!
//! Every function here suspends the *current* task: there is no handle
//! argument. `snooze`, `suspend`, `sleep`, `timeout` and the rest always act
//! on whichever task calls them, the same way a thread blocks itself rather
//! than being blocked from outside.

use std::any::Any;
use std::cell::Cell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::cancel::{self, Injection, TimeoutToken};
use crate::error::Error;
use crate::reactor::ExitStatus;
use crate::scheduler;
use crate::task::{self, JoinError, JoinHandle, Resume, TaskRef};

/// Alias for [`crate::task::spawn`].
#[track_caller]
pub fn spin<F, T>(f: F) -> JoinHandle<T>
where
    F: FnOnce() -> T + 'static,
    T: 'static,
{
    task::spawn(f)
}

/// Voluntarily yields the CPU to the end of the run queue, then resumes. The
/// single fairness point: any tight syscall retry loop calls this between
/// attempts so other tasks get a turn.
pub fn snooze() {
    if snooze_suppressed() {
        return;
    }
    let task = task::current_ref();
    scheduler::schedule(task, Resume::Value(Rc::new(())), false);
    let _ = task::suspend_or_inject();
}

/// Yields without rescheduling self; resumes only once another task calls
/// [`JoinHandle::resume`] (or the runtime delivers a cancellation/interrupt),
/// and returns the value it was resumed with.
pub fn suspend<T: 'static>() -> Rc<T> {
    downcast_resume(task::suspend_or_inject())
}

/// Blocks the current task until `duration` has elapsed.
pub fn sleep(duration: Duration) {
    let task = task::current_ref();
    let id = scheduler::register_timer(duration, task, Resume::Value(Rc::new(())));
    let _guard = TimerGuard(Some(id));
    let _ = task::suspend_or_inject();
}

/// Disarms a timer on every exit path (normal return, cancellation, or any
/// other injected unwind) by riding Rust's own unwind-safe `Drop`.
struct TimerGuard(Option<crate::reactor::TimerId>);

impl Drop for TimerGuard {
    fn drop(&mut self) {
        if let Some(id) = self.0.take() {
            scheduler::cancel_timer(id);
        }
    }
}

/// Repeatedly waits `interval`, then runs `body`, anchoring each deadline to
/// the previous one rather than to `Instant::now()` at fire time so ticks
/// don't drift. If the caller is descheduled long enough that one or more
/// ticks are already in the past by the time it gets to run `body` again,
/// those ticks are skipped rather than replayed back-to-back.
pub fn timer_loop<F: FnMut()>(interval: Duration, mut body: F) -> ! {
    let mut next_deadline = Instant::now() + interval;
    loop {
        sleep_until(next_deadline);
        body();
        next_deadline += interval;
        let now = Instant::now();
        while next_deadline <= now {
            next_deadline += interval;
        }
    }
}

fn sleep_until(deadline: Instant) {
    let after = deadline.saturating_duration_since(Instant::now());
    sleep(after);
}

/// A one-shot cross-task event. `setup` receives an
/// [`EventHandle`] before the calling task suspends, so it can hand the
/// handle off to whoever should wake it (store it in shared state, pass it
/// to a spawned task, register it with an external callback, ...).
///
/// There is no reactor-level watcher here: waking a `wait_event` caller is
/// just scheduling it like any other resume, since the event has no
/// OS-level readiness to poll for. See `DESIGN.md`.
pub fn wait_event<T: 'static>(setup: impl FnOnce(EventHandle)) -> Rc<T> {
    setup(EventHandle(task::current_ref()));
    downcast_resume(task::suspend_or_inject())
}

/// A handle another task can use to wake a [`wait_event`] caller.
#[derive(Clone)]
pub struct EventHandle(TaskRef);

impl EventHandle {
    /// Schedules the waiting task to resume with `value`. No-op if the task
    /// has since terminated (e.g. it was cancelled while waiting).
    pub fn signal<T: 'static>(&self, value: T) {
        if self.0.is_alive() {
            scheduler::schedule(self.0.clone(), Resume::Value(Rc::new(value)), false);
        }
    }
}

/// Blocks the current task until `pid` is reaped, returning its exit status.
pub fn wait_child(pid: libc::pid_t) -> Result<ExitStatus, Error> {
    let task = task::current_ref();
    scheduler::register_child(pid, task).map_err(Error::Io)?;
    Ok(*downcast_resume::<ExitStatus>(task::suspend_or_inject()))
}

/// The deadline in a [`timeout`] call fired before the block finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Elapsed;

impl std::fmt::Display for Elapsed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("deadline elapsed")
    }
}

impl std::error::Error for Elapsed {}

/// Runs `f`, racing it against `duration`. If `f` returns first, its value is
/// returned as `Ok`. If the deadline fires first, `f`'s current suspension
/// point is unwound with the injected `Timeout` sentinel and `timeout`
/// returns `Err(Elapsed)`.
///
/// The timer is disarmed on every exit path, including when `f` itself
/// raises an unrelated error or is cancelled out from under the timeout.
pub fn timeout<F, T>(duration: Duration, f: F) -> Result<T, Elapsed>
where
    F: FnOnce() -> T,
{
    let token = TimeoutToken::next();
    let task = task::current_ref();
    let id = scheduler::register_timer(duration, task, Resume::Inject(Injection::Timeout(token)));

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(f));
    scheduler::cancel_timer(id);

    match result {
        Ok(value) => Ok(value),
        Err(payload) => match cancel::downcast(payload) {
            // Our own deadline fired: swallow it.
            Ok(Injection::Timeout(t)) if t == token => Err(Elapsed),
            // Anything else (an outer timeout's deadline, a cancellation, an
            // uncaught error) is not ours to handle; let it keep unwinding.
            Ok(other) => cancel::inject(other),
            Err(payload) => std::panic::resume_unwind(payload),
        },
    }
}

/// Runs `f`, returning `default` instead of the block's value if `duration`
/// elapses first.
pub fn move_on_after<F, T>(duration: Duration, default: T, f: F) -> T
where
    F: FnOnce() -> T,
{
    timeout(duration, f).unwrap_or(default)
}

/// Runs `f`, panicking (an ordinary unhandled task error, propagated exactly
/// like any other) if `duration` elapses before it finishes. The "re-raise
/// unless configured to move on" half of `timeout`.
pub fn cancel_after<F, T>(duration: Duration, f: F) -> T
where
    F: FnOnce() -> T,
{
    match timeout(duration, f) {
        Ok(value) => value,
        Err(Elapsed) => panic!("cancel_after: operation exceeded {duration:?}"),
    }
}

/// Fan-in await: joins every handle in order, returning each outcome. Because
/// the scheduler is cooperative, awaiting `handles[0]` does not block
/// `handles[1..]` from making progress (they keep running during
/// `handles[0]`'s wait), so a plain sequential join already gives the
/// concurrent fan-in this is meant to provide.
pub fn await_all<T: 'static>(
    handles: impl IntoIterator<Item = JoinHandle<T>>,
) -> Vec<Result<Rc<T>, JoinError>> {
    handles.into_iter().map(|h| h.join()).collect()
}

/// Receives the next message sent to the current task's mailbox, blocking if
/// it is empty. Ordering: messages are returned in the
/// order they were sent.
pub fn receive<M: 'static>() -> Rc<M> {
    let task = task::current_ref();
    loop {
        if let Some(msg) = task.try_recv() {
            return msg
                .downcast::<M>()
                .unwrap_or_else(|_| panic!("receive: mailbox message type mismatch"));
        }
        task.set_waiting_on_mailbox(true);
        let _ = task::suspend_or_inject();
    }
}

thread_local! {
    /// Depth counter rather than a bool so nested `chain` calls compose.
    static SUPPRESS_SNOOZE: Cell<u32> = const { Cell::new(0) };
}

pub(crate) fn snooze_suppressed() -> bool {
    SUPPRESS_SNOOZE.with(|c| c.get() > 0)
}

struct SuppressGuard;

impl SuppressGuard {
    fn enter() -> Self {
        SUPPRESS_SNOOZE.with(|c| c.set(c.get() + 1));
        Self
    }
}

impl Drop for SuppressGuard {
    fn drop(&mut self) {
        SUPPRESS_SNOOZE.with(|c| c.set(c.get() - 1));
    }
}

/// Batches a sequence of I/O operations (write/send/splice) so they execute
/// back-to-back without the between-iteration `snooze` fairness yield each
/// would normally take on its own. Operations still suspend
/// on genuine backpressure (`wait_fd`); only the voluntary fairness yield is
/// suppressed. Fails fast: the first `Err` stops the batch and is returned.
pub fn chain<T>(ops: Vec<Box<dyn FnOnce() -> Result<T, Error>>>) -> Result<Vec<T>, Error> {
    let _guard = SuppressGuard::enter();
    let mut out = Vec::with_capacity(ops.len());
    for op in ops {
        out.push(op()?);
    }
    Ok(out)
}

fn downcast_resume<T: 'static>(value: Rc<dyn Any>) -> Rc<T> {
    value.downcast::<T>().unwrap_or_else(|_| panic!("resumed with mismatched type"))
}
