// Copyright 2025 coro contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Error kinds surfaced across the public boundary.
//!
//! Operational errors (I/O failures, bad arguments) are returned synchronously
//! at the call site as [`Error`]. Cancellation, interruption and timeouts are
//! injected into a suspended task rather than returned from a call; see
//! [`crate::cancel`] and [`crate::task::JoinError`].

use std::fmt;
use std::io;

/// An operational error raised synchronously by a runtime operation.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// A POSIX I/O failure, mapped from `errno`.
    Io(io::Error),
    /// The run queue is empty and the reactor has no watchers registered:
    /// nothing could ever wake the scheduler again.
    Deadlock,
    /// The root task terminated without producing a value: it was cancelled,
    /// or it panicked with an unhandled error. A non-root task's equivalent
    /// outcome is reported to its own awaiters as a
    /// [`crate::task::JoinError`] instead; the root has no parent or awaiter
    /// of its own; [`crate::block_on`] is the end of that line.
    RootTerminated(crate::task::JoinError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {e}"),
            Error::Deadlock => {
                f.write_str("deadlock: no runnable task and no registered watcher")
            }
            Error::RootTerminated(e) => write!(f, "root task did not complete: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::RootTerminated(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}
