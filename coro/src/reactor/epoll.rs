// Copyright 2025 coro contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Linux `epoll` backed [`Reactor`].
//!
//! Grounded on the single-threaded reactors found across the wider example
//! pack (a selector plus a token-to-waiter map, `turn`/`register`/`deregister`):
//! FD readiness is kept in an `epoll` instance; child-exit and cross-thread
//! wakeup are each just another pollable FD (`pidfd`, `eventfd`), so the same
//! `epoll_wait` loop serves all three without special-casing signals.

use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::reactor::{ExitStatus, Interest, Reactor, TimerId, TimerWheel, Wake, WakeupHandle};
use crate::task::{Resume, TaskRef};

const TOKEN_ASYNC: u64 = u64::MAX;

enum Registration {
    // `read`/`write` are independent slots so a reader and a writer task can
    // share one fd's registration (spec.md §5: concurrent read and write
    // from two tasks on the same fd is allowed, different watcher, different
    // events). `register_io` merges into whichever slot the call's interest
    // names; `poll` wakes and clears only the slot(s) that actually fired.
    Io { read: Option<TaskRef>, write: Option<TaskRef> },
    Child { task: TaskRef, pidfd: OwnedFd },
}

impl Registration {
    fn io_events(read: &Option<TaskRef>, write: &Option<TaskRef>) -> u32 {
        let mut events = libc::EPOLLONESHOT as u32;
        if read.is_some() {
            events |= libc::EPOLLIN as u32;
        }
        if write.is_some() {
            events |= libc::EPOLLOUT as u32;
        }
        events
    }
}

/// An `eventfd`-backed handle used to break a blocking `epoll_wait` from
/// another OS thread. Async-signal-safe: `write` on an eventfd is.
pub(crate) struct EventFd {
    fd: OwnedFd,
}

impl EventFd {
    fn new() -> io::Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { fd: unsafe { OwnedFd::from_raw_fd(fd) } })
    }

    pub(crate) fn notify(&self) {
        let one: u64 = 1;
        unsafe {
            libc::write(self.fd.as_raw_fd(), &one as *const u64 as *const _, 8);
        }
    }

    fn drain(&self) {
        let mut buf: u64 = 0;
        unsafe {
            libc::read(self.fd.as_raw_fd(), &mut buf as *mut u64 as *mut _, 8);
        }
    }
}

/// The epoll-based reactor. One instance per scheduler (per OS thread).
pub(crate) struct EpollReactor {
    epoll_fd: OwnedFd,
    registrations: HashMap<RawFd, Registration>,
    timers: TimerWheel,
    async_source: Arc<EventFd>,
    referenced_count: usize,
}

impl EpollReactor {
    pub(crate) fn new() -> io::Result<Self> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let epoll_fd = unsafe { OwnedFd::from_raw_fd(epoll_fd) };
        let async_source = Arc::new(EventFd::new()?);

        let mut event = libc::epoll_event { events: libc::EPOLLIN as u32, u64: TOKEN_ASYNC };
        let rc = unsafe {
            libc::epoll_ctl(
                epoll_fd.as_raw_fd(),
                libc::EPOLL_CTL_ADD,
                async_source.fd.as_raw_fd(),
                &mut event,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            epoll_fd,
            registrations: HashMap::new(),
            timers: TimerWheel::new(),
            async_source,
            referenced_count: 0,
        })
    }

    fn set_nonblocking(fd: RawFd) -> io::Result<()> {
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if flags & libc::O_NONBLOCK == 0 {
            let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
            if rc < 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }

    fn epoll_ctl(&self, op: i32, fd: RawFd, events: u32) -> io::Result<()> {
        let mut event = libc::epoll_event { events, u64: fd as u64 };
        let rc = unsafe { libc::epoll_ctl(self.epoll_fd.as_raw_fd(), op, fd, &mut event) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Reactor for EpollReactor {
    fn register_io(&mut self, fd: RawFd, interest: Interest, task: TaskRef) -> io::Result<()> {
        Self::set_nonblocking(fd)?;

        let op = match self.registrations.get_mut(&fd) {
            Some(Registration::Io { read, write }) => {
                if interest.readable && read.is_none() {
                    self.referenced_count += 1;
                }
                if interest.writable && write.is_none() {
                    self.referenced_count += 1;
                }
                if interest.readable {
                    *read = Some(task.clone());
                }
                if interest.writable {
                    *write = Some(task.clone());
                }
                libc::EPOLL_CTL_MOD
            }
            Some(Registration::Child { .. }) => {
                // A pidfd is never re-registered through this path.
                unreachable!("register_io called on a child-watch fd");
            }
            None => {
                let read = interest.readable.then(|| task.clone());
                let write = interest.writable.then(|| task.clone());
                if read.is_some() {
                    self.referenced_count += 1;
                }
                if write.is_some() {
                    self.referenced_count += 1;
                }
                self.registrations.insert(fd, Registration::Io { read, write });
                libc::EPOLL_CTL_ADD
            }
        };

        let events = match &self.registrations[&fd] {
            Registration::Io { read, write } => Registration::io_events(read, write),
            Registration::Child { .. } => unreachable!(),
        };
        self.epoll_ctl(op, fd, events)
    }

    fn deregister_io(&mut self, fd: RawFd, task: &TaskRef) {
        let Some(Registration::Io { read, write }) = self.registrations.get_mut(&fd) else {
            return;
        };
        if read.as_ref() == Some(task) {
            *read = None;
            self.referenced_count = self.referenced_count.saturating_sub(1);
        }
        if write.as_ref() == Some(task) {
            *write = None;
            self.referenced_count = self.referenced_count.saturating_sub(1);
        }

        if read.is_none() && write.is_none() {
            self.registrations.remove(&fd);
            let _ = self.epoll_ctl(libc::EPOLL_CTL_DEL, fd, 0);
        } else {
            let events = match &self.registrations[&fd] {
                Registration::Io { read, write } => Registration::io_events(read, write),
                Registration::Child { .. } => unreachable!(),
            };
            let _ = self.epoll_ctl(libc::EPOLL_CTL_MOD, fd, events);
        }
    }

    fn register_timer(&mut self, after: Duration, task: TaskRef, resume: Resume) -> TimerId {
        self.referenced_count += 1;
        self.timers.arm(after, task, resume)
    }

    fn cancel_timer(&mut self, id: TimerId) {
        if self.timers.cancel(id) {
            self.referenced_count = self.referenced_count.saturating_sub(1);
        }
    }

    fn register_child(&mut self, pid: libc::pid_t, task: TaskRef) -> io::Result<()> {
        let pidfd = unsafe { libc::syscall(libc::SYS_pidfd_open, pid, 0) };
        if pidfd < 0 {
            return Err(io::Error::last_os_error());
        }
        let pidfd = unsafe { OwnedFd::from_raw_fd(pidfd as RawFd) };
        let raw = pidfd.as_raw_fd();
        self.epoll_ctl(libc::EPOLL_CTL_ADD, raw, libc::EPOLLIN as u32)?;
        self.registrations.insert(raw, Registration::Child { task, pidfd });
        self.referenced_count += 1;
        Ok(())
    }

    fn wakeup_handle(&self) -> WakeupHandle {
        WakeupHandle::new(self.async_source.clone())
    }

    fn poll(&mut self, blocking: bool, wake: &dyn Wake) -> io::Result<()> {
        let now = Instant::now();
        let due = self.timers.pop_due(now);
        let have_due_timers = !due.is_empty();
        // Every fired entry was counted as referenced when armed; firing is
        // itself a disarm, so it must be accounted for here, not just in
        // `cancel_timer` (otherwise a reactor that has ever fired a timer
        // would never again report zero referenced watchers).
        self.referenced_count = self.referenced_count.saturating_sub(due.len());
        for (task, resume) in due {
            wake.wake(task, resume);
        }

        let timeout_ms = if !blocking || have_due_timers {
            0
        } else {
            match self.timers.next_deadline() {
                Some(deadline) => deadline.saturating_duration_since(now).as_millis().min(i32::MAX as u128) as i32,
                None => -1,
            }
        };

        let mut events: [libc::epoll_event; 64] = unsafe { std::mem::zeroed() };
        let n = unsafe {
            libc::epoll_wait(self.epoll_fd.as_raw_fd(), events.as_mut_ptr(), events.len() as i32, timeout_ms)
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }

        for event in &events[..n as usize] {
            let token = event.u64;
            if token == TOKEN_ASYNC {
                self.async_source.drain();
                continue;
            }
            let fd = token as RawFd;
            match self.registrations.get(&fd) {
                Some(Registration::Io { .. }) => {
                    // `EPOLLHUP`/`EPOLLERR` can arrive without the
                    // corresponding `IN`/`OUT` bit set; treat them as
                    // readiness for whichever side(s) are waiting so a
                    // closed/errored fd doesn't strand a watcher forever.
                    let readable = event.events & (libc::EPOLLIN | libc::EPOLLHUP | libc::EPOLLERR) as u32 != 0;
                    let writable = event.events & (libc::EPOLLOUT | libc::EPOLLHUP | libc::EPOLLERR) as u32 != 0;

                    let Some(Registration::Io { read, write }) = self.registrations.get_mut(&fd) else {
                        unreachable!();
                    };
                    let fired_read = if readable { read.take() } else { None };
                    let fired_write = if writable { write.take() } else { None };
                    let woken = fired_read.is_some() as usize + fired_write.is_some() as usize;
                    self.referenced_count = self.referenced_count.saturating_sub(woken);

                    let remaining_events = match &self.registrations[&fd] {
                        Registration::Io { read, write } if read.is_some() || write.is_some() => {
                            Some(Registration::io_events(read, write))
                        }
                        _ => None,
                    };
                    match remaining_events {
                        Some(events) => {
                            let _ = self.epoll_ctl(libc::EPOLL_CTL_MOD, fd, events);
                        }
                        None => {
                            self.registrations.remove(&fd);
                            let _ = self.epoll_ctl(libc::EPOLL_CTL_DEL, fd, 0);
                        }
                    }

                    if let Some(task) = fired_read {
                        wake.wake(task, Resume::Value(std::rc::Rc::new(())));
                    }
                    if let Some(task) = fired_write {
                        wake.wake(task, Resume::Value(std::rc::Rc::new(())));
                    }
                }
                Some(Registration::Child { .. }) => {
                    let Some(Registration::Child { task, pidfd }) = self.registrations.remove(&fd) else {
                        unreachable!();
                    };
                    self.referenced_count = self.referenced_count.saturating_sub(1);
                    let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
                    let status = unsafe {
                        libc::waitid(
                            libc::P_PIDFD,
                            pidfd.as_raw_fd() as libc::id_t,
                            &mut info,
                            libc::WEXITED,
                        );
                        info.si_status()
                    };
                    wake.wake(
                        task,
                        Resume::Value(std::rc::Rc::new(ExitStatus {
                            pid: unsafe { info.si_pid() },
                            code: status,
                        })),
                    );
                }
                None => {}
            }
        }

        Ok(())
    }

    fn has_referenced_watchers(&self) -> bool {
        self.referenced_count > 0
    }
}
