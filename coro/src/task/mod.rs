// Copyright 2025 coro contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The task (coprocess) lifecycle: spawn, structured-concurrency teardown,
//! mailbox and result slot over a stack-switched execution context.

mod builder;
mod id;
mod mailbox;

pub use builder::TaskBuilder;
pub use id::TaskId;

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::marker::PhantomData;
use std::panic::{AssertUnwindSafe, Location};
use std::ptr::NonNull;
use std::rc::{Rc, Weak};

use fiber::stack::DefaultFiberStack;
use fiber::{Fiber, Suspend};

use crate::cancel::{self, Injection};
use crate::scheduler;
use mailbox::Mailbox;

pub(crate) type AnyValue = Rc<dyn Any>;
pub(crate) type TaskFiber = Fiber<Resume, (), (), (), DefaultFiberStack>;

/// The value (or injected sentinel) delivered to a task on resume.
pub(crate) enum Resume {
    Value(AnyValue),
    Inject(Injection),
}

/// A task's lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskState {
    Suspended,
    Runnable,
    Running,
    Terminated,
}

/// The outcome recorded in a task's result slot once it terminates.
#[derive(Clone)]
pub(crate) enum Outcome {
    /// Normal return, or `stop`/`interrupt` (`MoveOn`).
    Value(AnyValue),
    /// Terminated via `cancel!`.
    Cancelled,
    /// Terminated with an unhandled panic, either raised by the task itself
    /// or forwarded from an orphaned child.
    Error(AnyValue),
}

/// Why a [`JoinHandle::join`] failed to produce a value.
#[derive(Clone)]
pub enum JoinError {
    /// The task was cancelled via `cancel!`.
    Cancelled,
    /// The task terminated with an unhandled error.
    Panicked(Panic),
}

/// An unhandled task error, carrying the original panic payload for
/// diagnostics.
#[derive(Clone)]
pub struct Panic(pub(crate) AnyValue);

impl Panic {
    /// Best-effort extraction of a human-readable message, matching the
    /// common `&str`/`String` panic payload shapes.
    pub fn message(&self) -> String {
        if let Some(s) = self.0.downcast_ref::<&str>() {
            (*s).to_owned()
        } else if let Some(s) = self.0.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_owned()
        }
    }
}

impl fmt::Debug for Panic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Panic").field(&self.message()).finish()
    }
}

impl fmt::Display for JoinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinError::Cancelled => f.write_str("task was cancelled"),
            JoinError::Panicked(p) => write!(f, "task panicked: {}", p.message()),
        }
    }
}

impl fmt::Debug for JoinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinError::Cancelled => f.write_str("JoinError::Cancelled"),
            JoinError::Panicked(p) => f.debug_tuple("JoinError::Panicked").field(p).finish(),
        }
    }
}

impl std::error::Error for JoinError {}

fn any_from_panic(payload: Box<dyn Any + Send>) -> AnyValue {
    let payload: Box<dyn Any> = payload;
    Rc::from(payload)
}

/// The internal, type-erased task record. Never exposed directly; external
/// code holds a [`TaskRef`] (strong, used by the scheduler/reactor/run queue)
/// or a [`JoinHandle<T>`] (typed, user-facing).
pub(crate) struct TaskCell {
    id: TaskId,
    name: Option<String>,
    span: tracing::Span,
    state: Cell<TaskState>,
    fiber: RefCell<Option<TaskFiber>>,
    suspend_ptr: Cell<Option<NonNull<Suspend<Resume, ()>>>>,
    // A weak handle to itself, so methods taking `&self` can still produce a
    // strong `TaskRef` to hand to the scheduler (e.g. to wake a `receive`r).
    weak_self: Weak<TaskCell>,
    // Weak to avoid an ownership cycle: the scheduler registry is the sole
    // strong owner of every live task.
    parent: RefCell<Option<Weak<TaskCell>>>,
    children: RefCell<Vec<Weak<TaskCell>>>,
    mailbox: RefCell<Mailbox>,
    waiting_on_mailbox: Cell<bool>,
    awaiters: RefCell<Vec<TaskRef>>,
    when_done: RefCell<Vec<Box<dyn FnOnce(&Outcome)>>>,
    outcome: RefCell<Option<Outcome>>,
    location: Location<'static>,
}

/// A strong, type-erased handle to a task. Used internally by the scheduler,
/// reactor and run queue; user code only ever sees a [`JoinHandle<T>`].
#[derive(Clone)]
pub(crate) struct TaskRef(Rc<TaskCell>);

impl PartialEq for TaskRef {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for TaskRef {}

impl std::ops::Deref for TaskRef {
    type Target = TaskCell;
    fn deref(&self) -> &TaskCell {
        &self.0
    }
}

impl TaskCell {
    pub(crate) fn id(&self) -> TaskId {
        self.id
    }

    pub(crate) fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub(crate) fn span(&self) -> &tracing::Span {
        &self.span
    }

    pub(crate) fn location(&self) -> Location<'static> {
        self.location
    }

    pub(crate) fn state(&self) -> TaskState {
        self.state.get()
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.state.get() != TaskState::Terminated
    }

    pub(crate) fn outcome(&self) -> Option<Outcome> {
        self.outcome.borrow().clone()
    }

    /// Takes the outcome by value rather than cloning it. Used exactly once,
    /// by the scheduler's own dispatch loop for the root task (see
    /// `take_root_outcome`): an ordinary `join`/`await` caller must use
    /// `outcome` instead, since it is never guaranteed to be the sole
    /// remaining owner (several tasks may all be awaiting the same target).
    pub(crate) fn take_outcome(&self) -> Option<Outcome> {
        self.outcome.borrow_mut().take()
    }

    /// Queues `msg` into this task's mailbox, waking it if it is currently
    /// blocked in `receive`.
    pub(crate) fn send(&self, msg: AnyValue) {
        self.mailbox.borrow_mut().push(msg);
        if self.waiting_on_mailbox.get() {
            self.waiting_on_mailbox.set(false);
            let me = TaskRef(self.weak_self.upgrade().expect("task dropped while registered"));
            scheduler::schedule(me, Resume::Value(Rc::new(())), false);
        }
    }

    /// Pops the next queued message, if any. Used by [`crate::ops::receive`].
    pub(crate) fn try_recv(&self) -> Option<AnyValue> {
        self.mailbox.borrow_mut().pop()
    }

    pub(crate) fn set_waiting_on_mailbox(&self, waiting: bool) {
        self.waiting_on_mailbox.set(waiting);
    }

    /// Resumes this task's fiber with `value`. Called exclusively by the
    /// scheduler's dispatch loop.
    ///
    /// On `Yield`, the state is set to `Suspended`: if the suspension
    /// primitive that yielded also rescheduled the task (e.g. `snooze`), it
    /// is responsible for flipping the state back to `Runnable` itself.
    /// `Return` needs no handling here; `finalize` already set `Terminated`
    /// before the fiber returned.
    pub(crate) fn resume_fiber(&self, value: Resume) -> fiber::FiberResult<(), ()> {
        self.state.set(TaskState::Running);
        let first_run = !self.fiber.borrow().as_ref().expect("fiber missing").started();
        if first_run {
            tracing::trace!(target: "coro::fiber_run", task.tid = %self.id());
        }
        let result = self.fiber.borrow_mut().as_mut().expect("fiber missing").resume(value);
        if let fiber::FiberResult::Yield(()) = result {
            self.state.set(TaskState::Suspended);
        }
        result
    }

    pub(crate) fn set_state(&self, state: TaskState) {
        self.state.set(state);
    }

    pub(crate) fn register_when_done(&self, cb: Box<dyn FnOnce(&Outcome)>) {
        if let Some(outcome) = self.outcome.borrow().as_ref() {
            cb(outcome);
        } else {
            self.when_done.borrow_mut().push(cb);
        }
    }
}

thread_local! {
    static CURRENT_TASK: RefCell<Option<TaskRef>> = const { RefCell::new(None) };
}

/// The task currently running on this thread, if any.
pub(crate) fn current() -> Option<TaskRef> {
    CURRENT_TASK.with(|cell| cell.borrow().clone())
}

/// The id of the task currently running on this thread.
pub fn current_id() -> TaskId {
    current().expect("no task is currently running on this thread").id()
}

/// Like [`current`], but panics outside of a running task. Every suspension
/// primitive needs a task to suspend, so this is the common entry point.
pub(crate) fn current_ref() -> TaskRef {
    current().expect("no task is currently running on this thread")
}

/// Installs `task` as current for the duration of `f`. Called by the
/// scheduler immediately around a fiber resume.
pub(crate) fn with_current_set<R>(task: TaskRef, f: impl FnOnce() -> R) -> R {
    let prev = CURRENT_TASK.with(|cell| cell.replace(Some(task)));
    let result = f();
    CURRENT_TASK.with(|cell| *cell.borrow_mut() = prev);
    result
}

/// Suspends the current task, handing control back to the scheduler, and
/// returns whatever resume value it is later given.
///
/// This is the single primitive every suspension point in `ops`/`io` is
/// built on: it neither schedules the caller (that is `snooze`'s job) nor
/// interprets the result (callers decide whether an [`Injection`] should be
/// turned into a panic via [`crate::cancel::inject`]).
pub(crate) fn raw_suspend() -> Resume {
    let task = current().expect("suspended with no current task");
    let ptr = task.suspend_ptr.get().expect("suspend called before the task's first resume");
    unsafe { ptr.as_ref().suspend(()) }
}

/// Suspends and turns an injected sentinel into a panic; plain values pass
/// through. The idiom used by every suspension primitive in `ops`/`io`.
pub(crate) fn suspend_or_inject() -> AnyValue {
    match raw_suspend() {
        Resume::Value(v) => v,
        Resume::Inject(injection) => cancel::inject(injection),
    }
}

/// A public, typed handle to a spawned task. Dropping a `JoinHandle` does not affect the task; it keeps running
/// (or terminating) independently. Structured concurrency is enforced by the
/// parent task's own teardown, not by this handle's lifetime.
pub struct JoinHandle<T> {
    pub(crate) task: TaskRef,
    pub(crate) _marker: PhantomData<fn() -> T>,
}

/// Converts a type-erased [`Outcome`] into the typed result a [`JoinHandle<T>`]
/// hands back to callers (shared by `join`, `result` and `when_done`).
fn outcome_to_result<T: 'static>(outcome: Outcome) -> Result<Rc<T>, JoinError> {
    match outcome {
        Outcome::Value(v) => Ok(v
            .downcast::<T>()
            .unwrap_or_else(|_| panic!("JoinHandle<T> outcome type mismatch, this is a bug"))),
        Outcome::Cancelled => Err(JoinError::Cancelled),
        Outcome::Error(payload) => Err(JoinError::Panicked(Panic(payload))),
    }
}

impl<T: 'static> JoinHandle<T> {
    pub fn id(&self) -> TaskId {
        self.task.id()
    }

    pub fn is_finished(&self) -> bool {
        !self.task.is_alive()
    }

    /// Blocks the calling task until the target terminates, returning its
    /// value or the reason it did not produce one.
    ///
    /// Returns `Rc<T>` rather than `T` so that multiple callers can all
    /// `join` the same handle and observe the same outcome without
    /// requiring `T: Clone`.
    pub fn join(&self) -> Result<Rc<T>, JoinError> {
        outcome_to_result(join_task(&self.task))
    }

    /// The outcome if the task has already terminated, `None` while it is
    /// still alive.
    pub fn result(&self) -> Option<Result<Rc<T>, JoinError>> {
        self.task.outcome().map(outcome_to_result)
    }

    /// The source location of the `spawn`/`spin` call that created this task.
    pub fn location(&self) -> std::panic::Location<'static> {
        self.task.location()
    }

    /// Alias for [`JoinHandle::location`]. A single call-site location
    /// stands in for a caller stack trace; see `DESIGN.md`.
    pub fn caller(&self) -> std::panic::Location<'static> {
        self.location()
    }

    /// Terminates the target without an error: injects `MoveOn(value)`,
    /// prioritized ahead of ordinary scheduling.
    pub fn stop(&self, value: T) {
        scheduler::schedule(
            self.task.clone(),
            Resume::Inject(Injection::MoveOn(Rc::new(value))),
            true,
        );
    }

    /// Injects a `Cancel` exception into the target, prioritized.
    pub fn cancel(&self) {
        scheduler::schedule(self.task.clone(), Resume::Inject(Injection::Cancel), true);
    }

    /// Schedules the target to resume with `value` as an ordinary
    /// (non-error) resume value. No-op if already terminated.
    pub fn resume(&self, value: T) {
        if self.task.is_alive() {
            scheduler::schedule(self.task.clone(), Resume::Value(Rc::new(value)), false);
        }
    }

    /// Alias for [`JoinHandle::stop`].
    pub fn interrupt(&self, value: T) {
        self.stop(value);
    }

    /// Registers `cb` to run after termination.
    pub fn when_done(&self, cb: impl FnOnce(Result<Rc<T>, JoinError>) + 'static) {
        self.task.register_when_done(Box::new(move |outcome| cb(outcome_to_result(outcome.clone()))));
    }

    /// True until the task terminates.
    pub fn is_alive(&self) -> bool {
        self.task.is_alive()
    }

    /// Sends `msg` to this task's mailbox. No `<<` operator alias: overloading
    /// `Shl` for a send that isn't a bit shift would read as a surprise to a
    /// Rust caller, so `send` is the only spelling.
    pub fn send<M: 'static>(&self, msg: M) {
        self.task.send(Rc::new(msg));
    }
}

/// Blocks the calling task until `target` terminates, returning its outcome.
/// Internal, type-erased counterpart of [`JoinHandle::join`]. Unlike
/// [`wait_for_termination`], `join`/`await` is an ordinary suspension point
/// (spec.md §5 lists it as one): a `Cancel`/`MoveOn` delivered while blocked
/// here must unwind the waiter exactly as it would at any other suspension
/// primitive, so this uses [`suspend_or_inject`] rather than [`raw_suspend`].
pub(crate) fn join_task(target: &TaskRef) -> Outcome {
    loop {
        if let Some(outcome) = target.outcome() {
            return outcome;
        }
        // Only a running task can suspend to wait; the scheduler's own
        // `drive` loop calls this once `target` is already finished, in
        // which case the fast path above returns before this is ever
        // reached.
        let me = current().expect("join called with no current task");
        target.awaiters.borrow_mut().push(me.clone());

        // Removes `me` from `target`'s awaiter list on every exit, including
        // an injected unwind: otherwise a cancelled awaiter leaves a stale
        // entry behind, and `target`'s later `finalize` would try to
        // reschedule an already-terminated task.
        struct AwaiterGuard<'a> {
            target: &'a TaskRef,
            me: TaskRef,
        }
        impl Drop for AwaiterGuard<'_> {
            fn drop(&mut self) {
                self.target.awaiters.borrow_mut().retain(|a| a != &self.me);
            }
        }
        let _guard = AwaiterGuard { target, me: me.clone() };

        me.state.set(TaskState::Suspended);
        let _ = suspend_or_inject();
        me.state.set(TaskState::Running);
    }
}

/// Takes the root task's outcome by value rather than cloning it. Called
/// exactly once, by the scheduler's own dispatch loop, after it observes
/// (outside of any task context) that the root task has finished. Moving the
/// outcome out of its slot rather than cloning it leaves the returned `Rc` as
/// the sole owner, which is what lets [`crate::scheduler::SchedulerBuilder::block_on`]
/// unwrap it back into a plain `T`.
pub(crate) fn take_root_outcome<T: 'static>(handle: &JoinHandle<T>) -> Result<Rc<T>, JoinError> {
    let outcome = handle.task.take_outcome().expect("root task outcome not yet finalized");
    outcome_to_result(outcome)
}

/// Spawns `f` as a child task of the currently running task, returning a
/// handle to await its result.
///
/// # Panics
///
/// Panics if called outside of a running scheduler (see
/// [`crate::block_on`]).
#[track_caller]
pub fn spawn<F, T>(f: F) -> JoinHandle<T>
where
    F: FnOnce() -> T + 'static,
    T: 'static,
{
    TaskBuilder::new().spawn(f)
}

/// Spawns `f` as a child of the currently running task (or as a root task if
/// there is none, used by `block_on`). `location` defaults to the caller of
/// this function; [`TaskBuilder::location`] overrides it explicitly.
#[track_caller]
pub(crate) fn spawn_with<F, T>(
    name: Option<String>,
    span: tracing::Span,
    location: Option<Location<'static>>,
    f: F,
) -> JoinHandle<T>
where
    F: FnOnce() -> T + 'static,
    T: 'static,
{
    let parent = current();
    let id = TaskId::next();
    let location = location.unwrap_or(*Location::caller());
    let stack = DefaultFiberStack::default();

    let cell = Rc::new_cyclic(|weak: &Weak<TaskCell>| {
        let weak_self = weak.clone();
        let fiber = Fiber::with_stack(stack, move |first, suspend, _local: &()| {
            run_body(weak_self, f, first, suspend);
        });
        TaskCell {
            id,
            name,
            span,
            state: Cell::new(TaskState::Runnable),
            fiber: RefCell::new(Some(fiber)),
            suspend_ptr: Cell::new(None),
            weak_self: weak.clone(),
            parent: RefCell::new(parent.as_ref().map(|p| Rc::downgrade(&p.0))),
            children: RefCell::new(Vec::new()),
            mailbox: RefCell::new(Mailbox::default()),
            waiting_on_mailbox: Cell::new(false),
            awaiters: RefCell::new(Vec::new()),
            when_done: RefCell::new(Vec::new()),
            outcome: RefCell::new(None),
            location,
        }
    });
    let task = TaskRef(cell);

    if let Some(parent) = &parent {
        parent.children.borrow_mut().push(Rc::downgrade(&task.0));
    }

    scheduler::register(task.clone());
    scheduler::schedule(task.clone(), Resume::Value(Rc::new(())), false);

    JoinHandle { task, _marker: PhantomData }
}

/// The body every task fiber runs: executes the user closure, catches
/// sentinel injections and uncaught panics, then performs structured
/// concurrency teardown before the fiber returns.
///
/// Teardown happens *inside* the fiber, not after `Fiber::resume` returns --
/// a fiber that has returned can never be resumed again, but stopping
/// children requires suspending to wait for each one, so it must run while
/// the fiber is still alive.
fn run_body<F, T>(weak: Weak<TaskCell>, f: F, first: Resume, suspend: &Suspend<Resume, ()>)
where
    F: FnOnce() -> T + 'static,
    T: 'static,
{
    let task = TaskRef(weak.upgrade().expect("task dropped before its first resume"));
    task.suspend_ptr.set(Some(NonNull::from(suspend)));
    task.state.set(TaskState::Running);

    let outcome = match first {
        Resume::Inject(Injection::MoveOn(v)) => Outcome::Value(v),
        Resume::Inject(Injection::Cancel) => Outcome::Cancelled,
        Resume::Inject(Injection::Timeout(_) | Injection::Orphaned(_)) => {
            Outcome::Error(Rc::new(String::from("task injected before it ever ran")))
        }
        Resume::Value(_) => match std::panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(value) => Outcome::Value(Rc::new(value)),
            Err(payload) => match cancel::downcast(payload) {
                Ok(Injection::MoveOn(v)) => Outcome::Value(v),
                Ok(Injection::Cancel) => Outcome::Cancelled,
                Ok(Injection::Timeout(_)) => {
                    Outcome::Error(Rc::new(String::from("uncaught timeout")))
                }
                Ok(Injection::Orphaned(payload)) => Outcome::Error(payload),
                Err(payload) => Outcome::Error(any_from_panic(payload)),
            },
        },
    };

    finalize(&task, outcome);
}

/// Structured-concurrency teardown: finalize the result slot,
/// stop every live child in reverse spawn order and wait for it to
/// terminate, run `when_done` callbacks, wake awaiters, and forward an
/// unhandled error to the parent if nobody is watching.
fn finalize(task: &TaskRef, outcome: Outcome) {
    *task.outcome.borrow_mut() = Some(outcome.clone());

    let children: Vec<TaskRef> =
        task.children.borrow().iter().rev().filter_map(Weak::upgrade).map(TaskRef).collect();
    for child in &children {
        if child.is_alive() {
            scheduler::schedule(child.clone(), Resume::Inject(Injection::MoveOn(Rc::new(()))), true);
        }
        wait_for_termination(task, child);
    }

    let callbacks = std::mem::take(&mut *task.when_done.borrow_mut());
    for cb in callbacks {
        cb(&outcome);
    }

    let parent: Option<TaskRef> =
        task.parent.borrow_mut().take().and_then(|w| w.upgrade()).map(TaskRef);
    if let Some(parent) = &parent {
        parent
            .children
            .borrow_mut()
            .retain(|c| c.upgrade().map(|c| !Rc::ptr_eq(&c, &task.0)).unwrap_or(false));
    }

    let awaiters = std::mem::take(&mut *task.awaiters.borrow_mut());
    let has_awaiters = !awaiters.is_empty();
    for awaiter in awaiters {
        scheduler::schedule(awaiter, Resume::Value(Rc::new(())), false);
    }

    if let Outcome::Error(payload) = &outcome {
        if !has_awaiters {
            if let Some(parent) = parent {
                scheduler::schedule(
                    parent,
                    Resume::Inject(Injection::Orphaned(payload.clone())),
                    true,
                );
            }
        }
    }

    task.state.set(TaskState::Terminated);
    scheduler::unregister(task);
}

/// Suspends the finalizing task (without self-scheduling) until `child`
/// reports `Terminated`. Cancellation/interruption delivered during this
/// wait is swallowed: structured-concurrency teardown always runs to
/// completion once started.
fn wait_for_termination(parent: &TaskRef, child: &TaskRef) {
    while child.is_alive() {
        child.awaiters.borrow_mut().push(parent.clone());
        let _ = raw_suspend();
    }
}
