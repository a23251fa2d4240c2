// Copyright 2025 coro contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A per-thread cooperative concurrency runtime.
//!
//! `coro` multiplexes lightweight, stack-switched tasks ("coprocesses") onto
//! a single OS thread. A [`Scheduler`](SchedulerBuilder) drives them: it
//! picks the next runnable task, and when none is runnable, parks the thread
//! in a reactor poll until file descriptor readiness, a timer, a
//! child-process exit, or a cross-thread wakeup produces more work.
//!
//! Call [`block_on`] to install a scheduler on the current thread and run a
//! root task to completion. From inside that root task (or any task it
//! transitively spawns), [`spawn`] creates children, and the primitives in
//! [`ops`] and [`io`] suspend the calling task until their condition is met:
//!
//! ```no_run
//! coro::block_on(|| {
//!     let child = coro::spawn(|| {
//!         coro::ops::sleep(std::time::Duration::from_millis(10));
//!         42
//!     });
//!     *child.join().unwrap()
//! }).unwrap();
//! ```
//!
//! Every task forms a structured-concurrency tree: when a task terminates,
//! its still-live children are stopped and awaited before it finishes, so a scheduler shutdown can never leave orphaned tasks running.

mod cancel;
pub mod error;
pub mod io;
pub mod ops;
mod reactor;
mod run_queue;
mod scheduler;
pub mod task;

pub use error::Error;
pub use reactor::{ExitStatus, WakeupHandle};
pub use scheduler::{stats, wakeup_handle, SchedulerBuilder, Stats};
pub use task::{spawn, JoinError, JoinHandle, Panic, TaskBuilder, TaskId};

/// Installs a [`Scheduler`](SchedulerBuilder) on the calling thread and runs
/// `root` to completion as the root task, returning its value.
///
/// Equivalent to `SchedulerBuilder::new().block_on(root)`; use
/// [`SchedulerBuilder`] directly to configure idle GC or an idle callback
/// first.
///
/// # Panics
///
/// Panics if a scheduler is already running on this thread.
pub fn block_on<F, T>(root: F) -> Result<T, Error>
where
    F: FnOnce() -> T + 'static,
    T: 'static,
{
    SchedulerBuilder::new().block_on(root)
}
