// Copyright 2025 coro contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Sentinel exceptions injected into a suspended task.
//!
//! These are never constructed by user code. A suspending primitive is
//! resumed with either a plain value or an [`Injection`]; in the latter case
//! it turns the injection into a Rust panic via [`inject`], which unwinds the
//! current fiber stack exactly like any other panic. The task's entry point
//! (`task::run_body`) catches this unwind and interprets the payload.

use std::any::Any;
use std::panic::resume_unwind;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

/// A value carried by `stop`/`interrupt`, type-erased. Downcast at the task's
/// entry point using the type the task was declared to return.
pub(crate) type AnyValue = Rc<dyn Any>;

/// A unique token identifying one `timeout()` call, so that nested timeouts
/// only catch their own deadline firing and let others propagate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TimeoutToken(pub(crate) u64);

impl TimeoutToken {
    /// Mints a fresh token, distinct from every other `timeout()` call ever
    /// made on any thread. Nested `timeout` calls each need their own, so a
    /// deadline firing for the inner call is never mistaken for the outer
    /// one's (and vice versa).
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// A sentinel injected into a task to terminate its current wait point.
pub enum Injection {
    /// Injected by `cancel`. Unless caught, unwinds the task; the task's
    /// result becomes `Outcome::Cancelled` and awaiters observe it as
    /// [`crate::task::JoinError::Cancelled`].
    Cancel,
    /// Injected by `stop`/`interrupt`. Caught at the task's entry frame; sets
    /// the task's result to `value` without raising an error to awaiters.
    MoveOn(AnyValue),
    /// Injected by an expired [`crate::ops::timeout`] deadline. Caught by the
    /// `timeout` call that registered it; any other `timeout` call, or the
    /// task entry point if uncaught, re-raises it.
    Timeout(TimeoutToken),
    /// A child task terminated with an unhandled error and had no awaiters;
    /// its error is forwarded here so it surfaces at the parent's next
    /// resume, exactly as if the parent had raised it itself.
    Orphaned(AnyValue),
}

impl std::fmt::Debug for Injection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Injection::Cancel => f.write_str("Cancel"),
            Injection::MoveOn(_) => f.write_str("MoveOn(..)"),
            Injection::Timeout(t) => f.debug_tuple("Timeout").field(t).finish(),
            Injection::Orphaned(_) => f.write_str("Orphaned(..)"),
        }
    }
}

/// `Injection` carries `Rc`s, so it isn't `Send`, but `resume_unwind`/
/// `catch_unwind` require a `Box<dyn Any + Send>` payload unconditionally
/// (the bound exists for the general case of a panic payload leaving its
/// thread, not because any particular payload does). A fiber's stack never
/// leaves the OS thread it was created on, and an `Injection` is always
/// caught by the same `catch_unwind` call stack that `resume_unwind` was
/// invoked under, so asserting `Send` here is sound.
struct AssertSend<T>(T);
unsafe impl<T> Send for AssertSend<T> {}

/// Panics with `injection` as the payload. Called exactly once per
/// suspension point that observes an injected (rather than plain) resume
/// value.
pub(crate) fn inject(injection: Injection) -> ! {
    resume_unwind(Box::new(AssertSend(injection)))
}

/// Tries to downcast a caught panic payload back into an [`Injection`].
pub(crate) fn downcast(payload: Box<dyn Any + Send>) -> Result<Injection, Box<dyn Any + Send>> {
    match payload.downcast::<AssertSend<Injection>>() {
        Ok(wrapped) => Ok(wrapped.0),
        Err(payload) => Err(payload),
    }
}
