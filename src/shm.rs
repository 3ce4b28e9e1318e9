// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Anonymous, sealed shared memory. Port of rtipc's lib/shm.c
// (`ri_shm_anon_new` / `ri_shm_map`) and the one-shot `ri_shmfd_create`
// helper in lib/unix.c. Unlike the POSIX named-`shm_open` handle elsewhere
// in this crate's history, this region has no filesystem name: its only
// handle is the `memfd` fd, passed across the handshake socket.

use std::ffi::CString;
use std::io;
use std::ptr;

/// A mapped region of anonymous shared memory.
///
/// The owner creates one with [`AnonShm::create`] (a sealed `memfd`); the
/// mapper builds one from a received fd with [`AnonShm::from_fd`] (learning
/// the size via `fstat`, trusting the seal rather than re-validating it).
pub struct AnonShm {
    mem: *mut u8,
    size: usize,
    fd: libc::c_int,
    owns_fd: bool,
}

unsafe impl Send for AnonShm {}
unsafe impl Sync for AnonShm {}

impl AnonShm {
    /// Create a new sealed anonymous memfd of `size` bytes and map it
    /// read/write. Sealed against `F_SEAL_GROW | F_SEAL_SHRINK | F_SEAL_SEAL`
    /// so a peer that later maps the same fd can trust its size.
    pub fn create(size: usize) -> io::Result<Self> {
        let name = CString::new("rtipc-region").unwrap();
        let fd = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_ALLOW_SEALING | libc::MFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        if unsafe { libc::ftruncate(fd, size as libc::off_t) } != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err);
        }
        let seals = libc::F_SEAL_GROW | libc::F_SEAL_SHRINK | libc::F_SEAL_SEAL;
        if unsafe { libc::fcntl(fd, libc::F_ADD_SEALS, seals) } != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err);
        }
        Self::map(fd, size, true)
    }

    /// Build a view over a `memfd` received from a peer (e.g. via
    /// `SCM_RIGHTS`). The size is learned from `fstat`, not trusted from the
    /// sender; callers should cross-check it against the parsed header.
    pub fn from_fd(fd: libc::c_int) -> io::Result<Self> {
        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(fd, &mut st) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Self::map(fd, st.st_size as usize, true)
    }

    fn map(fd: libc::c_int, size: usize, owns_fd: bool) -> io::Result<Self> {
        let mem = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if mem == libc::MAP_FAILED {
            let err = io::Error::last_os_error();
            if owns_fd {
                unsafe { libc::close(fd) };
            }
            return Err(err);
        }
        Ok(Self {
            mem: mem as *mut u8,
            size,
            fd,
            owns_fd,
        })
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.mem
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.mem
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// The backing memfd, borrowed. Duplicate it (`dup`) before sending if
    /// the caller needs to keep using it after handing off ownership.
    pub fn fd(&self) -> libc::c_int {
        self.fd
    }
}

impl Drop for AnonShm {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.mem as *mut libc::c_void, self.size);
            if self.owns_fd {
                libc::close(self.fd);
            }
        }
    }
}
