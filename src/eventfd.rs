// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Semaphore-mode eventfd notification. Port of rtipc's `ri_eventfd()` in
// lib/unix.c: `eventfd(0, EFD_CLOEXEC | EFD_SEMAPHORE | EFD_NONBLOCK)`.
// The producer writes a one-counter on publish; the consumer reads one
// token per `pop`. Both sides are non-blocking — callers that want to wait
// poll the fd themselves.

use std::io;
use std::mem::size_of;

/// A non-blocking, semaphore-mode eventfd.
pub struct EventFd {
    fd: libc::c_int,
    owns_fd: bool,
}

unsafe impl Send for EventFd {}
unsafe impl Sync for EventFd {}

impl EventFd {
    /// Create a new semaphore-mode eventfd.
    pub fn create() -> io::Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_SEMAPHORE | libc::EFD_NONBLOCK) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { fd, owns_fd: true })
    }

    /// Wrap an fd received from a peer (e.g. via `SCM_RIGHTS`). Forces it
    /// non-blocking in case the sender's flags did not survive the transfer.
    pub fn from_fd(fd: libc::c_int) -> io::Result<Self> {
        set_nonblocking(fd)?;
        Ok(Self { fd, owns_fd: true })
    }

    pub fn fd(&self) -> libc::c_int {
        self.fd
    }

    /// Write one counter. Semaphore mode means each write adds one token;
    /// the consumer drains them one at a time.
    pub fn signal(&self) -> io::Result<()> {
        let one: u64 = 1;
        let n = unsafe {
            libc::write(
                self.fd,
                &one as *const u64 as *const libc::c_void,
                size_of::<u64>(),
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                // Counter saturated: the consumer has fallen far behind.
                // Not itself a correctness issue — the queue is the source
                // of truth, the event-fd is only a wake-up hint.
                return Ok(());
            }
            return Err(err);
        }
        Ok(())
    }

    /// Consume one token, non-blocking. `Ok(true)` if a token was consumed,
    /// `Ok(false)` if none was pending.
    pub fn try_consume(&self) -> io::Result<bool> {
        let mut buf: u64 = 0;
        let n = unsafe {
            libc::read(
                self.fd,
                &mut buf as *mut u64 as *mut libc::c_void,
                size_of::<u64>(),
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(false);
            }
            return Err(err);
        }
        Ok(true)
    }
}

impl Drop for EventFd {
    fn drop(&mut self) {
        if self.owns_fd {
            unsafe {
                libc::close(self.fd);
            }
        }
    }
}

pub(crate) fn set_nonblocking(fd: libc::c_int) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
