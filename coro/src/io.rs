// Copyright 2025 coro contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Non-blocking I/O operations that transparently suspend the current task
//! until the underlying syscall can complete.
//!
//! Every operation here follows the same shape: set the fd non-blocking,
//! attempt the syscall, and on `EAGAIN`/`EWOULDBLOCK`/`EINPROGRESS` suspend
//! in [`wait_io`] until the reactor reports readiness, then retry.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;

use crate::error::Error;
use crate::ops;
use crate::reactor::Interest;
use crate::scheduler;
use crate::task;

/// Waits for `fd` to become readable (or writable, if `write`) without
/// performing any syscall itself. Used directly by
/// callers that only need readiness, and internally by every operation below
/// on `EAGAIN`.
pub fn wait_io(fd: RawFd, write: bool) -> Result<(), Error> {
    let task = task::current_ref();
    let interest = if write { Interest::WRITABLE } else { Interest::READABLE };
    scheduler::register_io(fd, interest, task.clone()).map_err(Error::Io)?;

    struct IoGuard(RawFd, crate::task::TaskRef);
    impl Drop for IoGuard {
        fn drop(&mut self) {
            scheduler::deregister_io(self.0, &self.1);
        }
    }
    let _guard = IoGuard(fd, task);

    let _ = task::suspend_or_inject();
    Ok(())
}

fn set_nonblocking(fd: RawFd) -> Result<(), Error> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    if flags & libc::O_NONBLOCK == 0 {
        let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
        if rc < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
    }
    Ok(())
}

/// Retries `attempt` until it succeeds or fails with something other than
/// `EAGAIN`/`EWOULDBLOCK`/`EINTR`, suspending on [`wait_io`] in between.
fn retry_on_eagain(fd: RawFd, write: bool, mut attempt: impl FnMut() -> isize) -> Result<usize, Error> {
    loop {
        let rc = attempt();
        if rc >= 0 {
            return Ok(rc as usize);
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EAGAIN) | Some(libc::EWOULDBLOCK) => wait_io(fd, write)?,
            Some(libc::EINTR) => {}
            _ => return Err(Error::Io(err)),
        }
    }
}

fn maybe_snooze() {
    if !ops::snooze_suppressed() {
        ops::snooze();
    }
}

/// Reads up to `buf.len()` bytes. Returns `Ok(None)` on a zero-byte (EOF)
/// read, `Ok(Some(n))` otherwise; a single partial read is not retried.
pub fn read(fd: RawFd, buf: &mut [u8]) -> Result<Option<usize>, Error> {
    set_nonblocking(fd)?;
    let n = retry_on_eagain(fd, false, || unsafe {
        libc::read(fd, buf.as_mut_ptr().cast(), buf.len())
    })?;
    Ok(if n == 0 { None } else { Some(n) })
}

/// Writes the entire buffer, looping over partial writes and yielding
/// fairness between them.
pub fn write(fd: RawFd, buf: &[u8]) -> Result<usize, Error> {
    set_nonblocking(fd)?;
    let mut written = 0;
    while written < buf.len() {
        let n = retry_on_eagain(fd, true, || unsafe {
            libc::write(fd, buf[written..].as_ptr().cast(), buf.len() - written)
        })?;
        written += n;
        if written < buf.len() {
            maybe_snooze();
        }
    }
    Ok(written)
}

/// `send(2)` with `flags`, looping like [`write`] until `buf` is fully sent.
pub fn send(fd: RawFd, buf: &[u8], flags: i32) -> Result<usize, Error> {
    set_nonblocking(fd)?;
    let mut sent = 0;
    while sent < buf.len() {
        let n = retry_on_eagain(fd, true, || unsafe {
            libc::send(fd, buf[sent..].as_ptr().cast(), buf.len() - sent, flags)
        })?;
        sent += n;
        if sent < buf.len() {
            maybe_snooze();
        }
    }
    Ok(sent)
}

/// `recv(2)` with `flags`. Like [`read`], a single partial receive is not
/// retried; `Ok(None)` signals a zero-byte (orderly shutdown) read.
pub fn recv(fd: RawFd, buf: &mut [u8], flags: i32) -> Result<Option<usize>, Error> {
    set_nonblocking(fd)?;
    let n = retry_on_eagain(fd, false, || unsafe {
        libc::recv(fd, buf.as_mut_ptr().cast(), buf.len(), flags)
    })?;
    Ok(if n == 0 { None } else { Some(n) })
}

/// Accepts one connection on a listening socket, returning the new,
/// already-non-blocking fd.
pub fn accept(fd: RawFd) -> Result<OwnedFd, Error> {
    set_nonblocking(fd)?;
    let n = retry_on_eagain(fd, false, || unsafe {
        libc::accept4(fd, ptr::null_mut(), ptr::null_mut(), libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC)
            as isize
    })?;
    Ok(unsafe { OwnedFd::from_raw_fd(n as RawFd) })
}

/// Connects `fd` to `addr`, waiting out `EINPROGRESS` and checking
/// `SO_ERROR` once the socket becomes writable.
pub fn connect(fd: RawFd, addr: &libc::sockaddr, addr_len: libc::socklen_t) -> Result<(), Error> {
    set_nonblocking(fd)?;
    let rc = unsafe { libc::connect(fd, ptr::from_ref(addr), addr_len) };
    if rc == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() != Some(libc::EINPROGRESS) {
        return Err(Error::Io(err));
    }

    wait_io(fd, true)?;

    let mut sock_err: i32 = 0;
    let mut len = std::mem::size_of::<i32>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            ptr::from_mut(&mut sock_err).cast(),
            &mut len,
        )
    };
    if rc < 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    if sock_err != 0 {
        return Err(Error::Io(io::Error::from_raw_os_error(sock_err)));
    }
    Ok(())
}

/// `writev(2)`: writes every buffer in `bufs` in order, looping over partial
/// writes exactly like [`write`].
pub fn writev(fd: RawFd, bufs: &[&[u8]]) -> Result<usize, Error> {
    set_nonblocking(fd)?;
    let mut total = 0usize;
    let whole: usize = bufs.iter().map(|b| b.len()).sum();
    let mut skip = 0usize;
    while total < whole {
        let iovecs: Vec<libc::iovec> = bufs
            .iter()
            .copied()
            .scan(skip, |remaining_skip, b: &[u8]| {
                if *remaining_skip >= b.len() {
                    *remaining_skip -= b.len();
                    Some(libc::iovec { iov_base: ptr::null_mut(), iov_len: 0 })
                } else {
                    let start = *remaining_skip;
                    *remaining_skip = 0;
                    Some(libc::iovec {
                        iov_base: b[start..].as_ptr().cast_mut().cast(),
                        iov_len: b.len() - start,
                    })
                }
            })
            .filter(|iov| iov.iov_len > 0)
            .collect();

        let n = retry_on_eagain(fd, true, || unsafe {
            libc::writev(fd, iovecs.as_ptr(), iovecs.len() as i32)
        })?;
        total += n;
        skip += n;
        if total < whole {
            maybe_snooze();
        }
    }
    Ok(total)
}

/// One `splice(2)` attempt of up to `len` bytes, retrying on `EAGAIN` by
/// waiting on whichever side is expected to block: the destination when
/// moving data *into* a pipe write-end, the source when moving data *out of*
/// a pipe read-end.
fn splice_once(fd_in: RawFd, fd_out: RawFd, len: usize, wait_on_out: bool) -> Result<usize, Error> {
    loop {
        let rc = unsafe {
            libc::splice(
                fd_in,
                ptr::null_mut(),
                fd_out,
                ptr::null_mut(),
                len,
                libc::SPLICE_F_MOVE | libc::SPLICE_F_NONBLOCK,
            )
        };
        if rc >= 0 {
            return Ok(rc as usize);
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EAGAIN) => wait_io(if wait_on_out { fd_out } else { fd_in }, wait_on_out)?,
            Some(libc::EINTR) => {}
            _ => return Err(Error::Io(err)),
        }
    }
}

fn make_pipe() -> Result<(OwnedFd, OwnedFd), Error> {
    let mut fds = [0i32; 2];
    let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
    if rc < 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    Ok((unsafe { OwnedFd::from_raw_fd(fds[0]) }, unsafe { OwnedFd::from_raw_fd(fds[1]) }))
}

/// Zero-copy splice of up to `len` bytes from `src` to `dest` via an
/// intermediate pipe (a plain fd-to-fd `splice` requires one end to already
/// be a pipe). Returns `0` once `src` is at EOF.
pub fn splice(src: RawFd, dest: RawFd, len: usize) -> Result<usize, Error> {
    let (pipe_r, pipe_w) = make_pipe()?;
    let n = splice_once(src, pipe_w.as_raw_fd(), len, false)?;
    let mut remaining = n;
    while remaining > 0 {
        remaining -= splice_once(pipe_r.as_raw_fd(), dest, remaining, true)?;
    }
    Ok(n)
}

/// How to wrap each chunk in [`splice_chunks`]: a fixed buffer, or a
/// function of the chunk's length.
pub enum ChunkWrap<'a> {
    Fixed(&'a [u8]),
    OfLen(Box<dyn Fn(usize) -> Vec<u8> + 'a>),
}

impl ChunkWrap<'_> {
    fn render(&self, len: usize) -> std::borrow::Cow<'_, [u8]> {
        match self {
            ChunkWrap::Fixed(buf) => std::borrow::Cow::Borrowed(buf),
            ChunkWrap::OfLen(f) => std::borrow::Cow::Owned(f(len)),
        }
    }
}

/// Options for [`splice_chunks`], grouped into one struct since every field
/// is optional and several share a type.
#[derive(Default)]
pub struct SpliceChunks<'a> {
    pub prefix: Option<&'a [u8]>,
    pub postfix: Option<&'a [u8]>,
    pub chunk_prefix: Option<ChunkWrap<'a>>,
    pub chunk_postfix: Option<ChunkWrap<'a>>,
}

/// Batches a sequence of zero-copy `splice`s from `src` to `dest` in chunks
/// of at most `chunk_size` bytes, writing an optional `prefix`/`postfix`
/// around the whole transfer and an optional `chunk_prefix`/`chunk_postfix`
/// around each chunk (e.g. for chunked-transfer-encoding framing). Returns
/// the total number of bytes spliced (excluding prefixes/postfixes).
pub fn splice_chunks(
    src: RawFd,
    dest: RawFd,
    chunk_size: usize,
    opts: SpliceChunks<'_>,
) -> Result<usize, Error> {
    let mut total = 0usize;
    if let Some(prefix) = opts.prefix {
        write(dest, prefix)?;
    }

    // Chunk framing (e.g. a hex length prefix) depends on the chunk's
    // length, which is only known once data has actually moved off `src`.
    // Each chunk is staged through one shared pipe (source -> pipe) before
    // its length is known and its prefix/postfix can be written to `dest`,
    // followed by the chunk itself (pipe -> dest).
    let (pipe_r, pipe_w) = make_pipe()?;
    loop {
        let n = splice_once(src, pipe_w.as_raw_fd(), chunk_size, false)?;
        if n == 0 {
            break;
        }
        total += n;
        if let Some(wrap) = &opts.chunk_prefix {
            write(dest, &wrap.render(n))?;
        }
        let mut remaining = n;
        while remaining > 0 {
            remaining -= splice_once(pipe_r.as_raw_fd(), dest, remaining, true)?;
        }
        if let Some(wrap) = &opts.chunk_postfix {
            write(dest, &wrap.render(n))?;
        }
        maybe_snooze();
    }

    if let Some(postfix) = opts.postfix {
        write(dest, postfix)?;
    }
    Ok(total)
}
