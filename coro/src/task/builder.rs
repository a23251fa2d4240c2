// Copyright 2025 coro contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Builder for configuring a task before it is spawned.

use std::any::type_name;
use std::panic::Location;

use crate::task::{self, JoinHandle};

/// Configures a task's diagnostics before spawning it onto the current
/// scheduler.
///
/// By default tasks are unnamed and their location is the `spawn` call site.
pub struct TaskBuilder<'a> {
    location: Option<Location<'static>>,
    name: Option<&'a str>,
}

impl<'a> TaskBuilder<'a> {
    pub fn new() -> Self {
        Self { location: None, name: None }
    }

    /// Names the task, shown in its tracing span and diagnostics.
    pub fn name(mut self, name: &'a str) -> Self {
        self.name = Some(name);
        self
    }

    /// Overrides the source location associated with the task. Defaults to
    /// the caller of [`TaskBuilder::spawn`].
    pub fn location(mut self, location: Location<'static>) -> Self {
        self.location = Some(location);
        self
    }

    /// Spawns `f` as a child of the currently running task.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a running scheduler (see
    /// [`crate::block_on`]).
    #[track_caller]
    pub fn spawn<F, T>(&self, f: F) -> JoinHandle<T>
    where
        F: FnOnce() -> T + 'static,
        T: 'static,
    {
        let loc = self.location.unwrap_or(*Location::caller());
        let span = tracing::trace_span!(
            "task",
            task.name = self.name,
            task.output = %type_name::<T>(),
            loc.file = loc.file(),
            loc.line = loc.line(),
        );
        task::spawn_with(self.name.map(str::to_owned), span, Some(loc), f)
    }
}

impl<'a> Default for TaskBuilder<'a> {
    fn default() -> Self {
        Self::new()
    }
}
