// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Handshake wire format and its raw seqpacket-socket transport. Port of
// rtipc's lib/protocol.c (request reader/writer) and lib/request.c /
// lib/unix.c (the SCM_RIGHTS fd-passing envelope and the two-phase
// MSG_PEEK|MSG_TRUNC receive). Table/count ordering follows SPEC_FULL.md
// §4.4 ("consumers first then producers") rather than the upstream source,
// which is inconsistent with itself about that ordering across revisions.

use std::ffi::CString;
use std::io;
use std::mem::size_of;
use std::os::unix::io::RawFd;

use crate::layout::{MAGIC, VERSION};
use crate::queue::CACHELINE;

/// Maximum number of fds carried in one handshake's ancillary data. Bounds
/// the `SCM_RIGHTS` cmsg buffer; mirrors the upstream `SCM_MAX_FD` guard
/// without needing its exact value (our channel counts are far smaller).
const MAX_FDS: usize = 64;

/// The 8-byte handshake header (distinct from [`crate::layout::Header`],
/// which additionally carries the consumer/producer counts for the shm
/// region itself).
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct WireHeader {
    pub magic: u16,
    pub version: u16,
    pub cacheline_size: u16,
    pub atomic_size: u16,
}

const _: () = assert!(size_of::<WireHeader>() == 8);

impl WireHeader {
    pub fn for_host() -> Self {
        Self {
            magic: MAGIC,
            version: VERSION,
            cacheline_size: CACHELINE as u16,
            atomic_size: size_of::<std::sync::atomic::AtomicU32>() as u16,
        }
    }

    pub fn validate_host(&self) -> Result<(), &'static str> {
        if self.magic != MAGIC {
            return Err("magic mismatch");
        }
        if self.version != VERSION {
            return Err("version mismatch");
        }
        if self.cacheline_size as usize != CACHELINE {
            return Err("cacheline size mismatch");
        }
        if self.atomic_size as usize != size_of::<std::sync::atomic::AtomicU32>() {
            return Err("atomic word width mismatch");
        }
        Ok(())
    }

    fn to_bytes(self) -> [u8; 8] {
        let mut out = [0u8; 8];
        out[0..2].copy_from_slice(&self.magic.to_ne_bytes());
        out[2..4].copy_from_slice(&self.version.to_ne_bytes());
        out[4..6].copy_from_slice(&self.cacheline_size.to_ne_bytes());
        out[6..8].copy_from_slice(&self.atomic_size.to_ne_bytes());
        out
    }

    fn from_bytes(b: &[u8]) -> io::Result<Self> {
        if b.len() < 8 {
            return Err(truncated("handshake header"));
        }
        Ok(Self {
            magic: u16::from_ne_bytes([b[0], b[1]]),
            version: u16::from_ne_bytes([b[2], b[3]]),
            cacheline_size: u16::from_ne_bytes([b[4], b[5]]),
            atomic_size: u16::from_ne_bytes([b[6], b[7]]),
        })
    }
}

/// One channel's negotiated shape, from the sender's point of view.
#[derive(Debug, Clone)]
pub struct ChannelSpec {
    pub add_msgs: u32,
    pub msg_size: u32,
    pub has_eventfd: bool,
    pub info: Vec<u8>,
}

/// The full handshake request: the sender's consumer and producer channel
/// sets plus a session-level info blob. Table order is always consumers
/// then producers (§4.4).
#[derive(Debug, Clone, Default)]
pub struct SessionRequest {
    pub session_info: Vec<u8>,
    pub consumers: Vec<ChannelSpec>,
    pub producers: Vec<ChannelSpec>,
}

struct TableEntry {
    add_msgs: u32,
    msg_size: u32,
    has_eventfd: i32,
    info_size: u32,
}

const TABLE_ENTRY_SIZE: usize = 16;

impl TableEntry {
    fn to_bytes(&self) -> [u8; TABLE_ENTRY_SIZE] {
        let mut out = [0u8; TABLE_ENTRY_SIZE];
        out[0..4].copy_from_slice(&self.add_msgs.to_ne_bytes());
        out[4..8].copy_from_slice(&self.msg_size.to_ne_bytes());
        out[8..12].copy_from_slice(&self.has_eventfd.to_ne_bytes());
        out[12..16].copy_from_slice(&self.info_size.to_ne_bytes());
        out
    }

    fn from_bytes(b: &[u8]) -> io::Result<Self> {
        if b.len() < TABLE_ENTRY_SIZE {
            return Err(truncated("channel table entry"));
        }
        Ok(Self {
            add_msgs: u32::from_ne_bytes(b[0..4].try_into().unwrap()),
            msg_size: u32::from_ne_bytes(b[4..8].try_into().unwrap()),
            has_eventfd: i32::from_ne_bytes(b[8..12].try_into().unwrap()),
            info_size: u32::from_ne_bytes(b[12..16].try_into().unwrap()),
        })
    }
}

fn truncated(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, format!("truncated handshake request: {what}"))
}

impl SessionRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&WireHeader::for_host().to_bytes());
        out.extend_from_slice(&(self.session_info.len() as u32).to_ne_bytes());
        out.extend_from_slice(&(self.consumers.len() as u32).to_ne_bytes());
        out.extend_from_slice(&(self.producers.len() as u32).to_ne_bytes());

        for ch in self.consumers.iter().chain(self.producers.iter()) {
            let entry = TableEntry {
                add_msgs: ch.add_msgs,
                msg_size: ch.msg_size,
                has_eventfd: ch.has_eventfd as i32,
                info_size: ch.info.len() as u32,
            };
            out.extend_from_slice(&entry.to_bytes());
        }

        out.extend_from_slice(&self.session_info);
        for ch in self.consumers.iter().chain(self.producers.iter()) {
            out.extend_from_slice(&ch.info);
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> io::Result<Self> {
        if bytes.len() < 20 {
            return Err(truncated("header+counts"));
        }
        let header = WireHeader::from_bytes(&bytes[0..8])?;
        header.validate_host().map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let session_info_size = u32::from_ne_bytes(bytes[8..12].try_into().unwrap()) as usize;
        let n_consumers = u32::from_ne_bytes(bytes[12..16].try_into().unwrap()) as usize;
        let n_producers = u32::from_ne_bytes(bytes[16..20].try_into().unwrap()) as usize;

        let mut offset = 20usize;
        let mut entries = Vec::with_capacity(n_consumers + n_producers);
        for _ in 0..(n_consumers + n_producers) {
            let end = offset.checked_add(TABLE_ENTRY_SIZE).ok_or_else(|| truncated("table"))?;
            let slice = bytes.get(offset..end).ok_or_else(|| truncated("table"))?;
            entries.push(TableEntry::from_bytes(slice)?);
            offset = end;
        }

        let session_info = bytes
            .get(offset..offset + session_info_size)
            .ok_or_else(|| truncated("session info"))?
            .to_vec();
        offset += session_info_size;

        let mut specs = Vec::with_capacity(entries.len());
        for entry in &entries {
            let info_size = entry.info_size as usize;
            let info = bytes
                .get(offset..offset + info_size)
                .ok_or_else(|| truncated("channel info"))?
                .to_vec();
            offset += info_size;
            specs.push(ChannelSpec {
                add_msgs: entry.add_msgs,
                msg_size: entry.msg_size,
                has_eventfd: entry.has_eventfd != 0,
                info,
            });
        }

        let producers = specs.split_off(n_consumers);
        let consumers = specs;
        Ok(Self {
            session_info,
            consumers,
            producers,
        })
    }

    /// Total file descriptors this request expects to carry: the shm fd
    /// plus one per channel with `has_eventfd` set, in table order.
    pub fn expected_fd_count(&self) -> usize {
        1 + self
            .consumers
            .iter()
            .chain(self.producers.iter())
            .filter(|c| c.has_eventfd)
            .count()
    }
}

// ---------------------------------------------------------------------------
// Transport: AF_UNIX SOCK_SEQPACKET + SCM_RIGHTS, raw libc.
// ---------------------------------------------------------------------------

/// Bind and listen on a filesystem path for `SOCK_SEQPACKET` connections.
pub struct Listener {
    fd: RawFd,
}

impl Listener {
    pub fn bind(path: &str, backlog: i32) -> io::Result<Self> {
        let fd = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_SEQPACKET, 0) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let addr = unix_sockaddr(path)?;
        let rc = unsafe {
            libc::bind(
                fd,
                &addr as *const libc::sockaddr_un as *const libc::sockaddr,
                size_of::<libc::sockaddr_un>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err);
        }
        if unsafe { libc::listen(fd, backlog) } != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err);
        }
        Ok(Self { fd })
    }

    pub fn accept(&self) -> io::Result<Connection> {
        let fd = unsafe { libc::accept(self.fd, std::ptr::null_mut(), std::ptr::null_mut()) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Connection { fd })
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// A connected `SOCK_SEQPACKET` endpoint, either side of a handshake.
pub struct Connection {
    fd: RawFd,
}

impl Connection {
    pub fn connect(path: &str) -> io::Result<Self> {
        let fd = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_SEQPACKET, 0) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let addr = unix_sockaddr(path)?;
        let rc = unsafe {
            libc::connect(
                fd,
                &addr as *const libc::sockaddr_un as *const libc::sockaddr,
                size_of::<libc::sockaddr_un>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err);
        }
        Ok(Self { fd })
    }

    /// Send the request bytes plus its ancillary fds (`SCM_RIGHTS`) in one
    /// `sendmsg`.
    pub fn send_request(&self, bytes: &[u8], fds: &[RawFd]) -> io::Result<()> {
        assert!(fds.len() <= MAX_FDS, "too many fds for one handshake");
        let mut iov = libc::iovec {
            iov_base: bytes.as_ptr() as *mut libc::c_void,
            iov_len: bytes.len(),
        };

        let cmsg_space = unsafe { libc::CMSG_SPACE((fds.len() * size_of::<RawFd>()) as u32) } as usize;
        let mut cmsg_buf = vec![0u8; cmsg_space.max(1)];

        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;

        if !fds.is_empty() {
            msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
            msg.msg_controllen = cmsg_space as _;
            unsafe {
                let cmsg = libc::CMSG_FIRSTHDR(&msg);
                assert!(!cmsg.is_null());
                (*cmsg).cmsg_level = libc::SOL_SOCKET;
                (*cmsg).cmsg_type = libc::SCM_RIGHTS;
                (*cmsg).cmsg_len = libc::CMSG_LEN((fds.len() * size_of::<RawFd>()) as u32) as _;
                std::ptr::copy_nonoverlapping(
                    fds.as_ptr(),
                    libc::CMSG_DATA(cmsg) as *mut RawFd,
                    fds.len(),
                );
            }
        }

        let n = unsafe { libc::sendmsg(self.fd, &msg, 0) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Two-phase receive: first peek the pending datagram's size
    /// (`MSG_PEEK | MSG_TRUNC`), then perform the real `recvmsg` into
    /// exactly-sized buffers. Returns the request bytes and any fds carried
    /// in `SCM_RIGHTS`.
    pub fn recv_request(&self) -> io::Result<(Vec<u8>, Vec<RawFd>)> {
        let mut probe: libc::msghdr = unsafe { std::mem::zeroed() };
        let peeked = unsafe { libc::recvmsg(self.fd, &mut probe, libc::MSG_PEEK | libc::MSG_TRUNC) };
        if peeked < 0 {
            return Err(io::Error::last_os_error());
        }
        let size = peeked as usize;

        let mut buf = vec![0u8; size];
        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: size,
        };
        let cmsg_space = unsafe { libc::CMSG_SPACE((MAX_FDS * size_of::<RawFd>()) as u32) } as usize;
        let mut cmsg_buf = vec![0u8; cmsg_space];

        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = cmsg_space as _;

        let n = unsafe { libc::recvmsg(self.fd, &mut msg, 0) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        if n as usize != size {
            return Err(truncated("datagram size changed between peek and read"));
        }
        buf.truncate(n as usize);

        let mut fds = Vec::new();
        if msg.msg_controllen as usize >= size_of::<libc::cmsghdr>() {
            unsafe {
                let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
                while !cmsg.is_null() {
                    if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                        let data_len = (*cmsg).cmsg_len as usize - cmsg_header_len();
                        let count = data_len / size_of::<RawFd>();
                        let data = libc::CMSG_DATA(cmsg) as *const RawFd;
                        for i in 0..count {
                            fds.push(*data.add(i));
                        }
                    }
                    cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
                }
            }
        }

        Ok((buf, fds))
    }

    /// Send the 4-byte accept(0)/reject(-1) reply, no ancillary data.
    pub fn send_reply(&self, accept: bool) -> io::Result<()> {
        let code: i32 = if accept { 0 } else { -1 };
        let bytes = code.to_ne_bytes();
        let n = unsafe {
            libc::send(
                self.fd,
                bytes.as_ptr() as *const libc::c_void,
                bytes.len(),
                0,
            )
        };
        if n != bytes.len() as isize {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn recv_reply(&self) -> io::Result<bool> {
        let mut bytes = [0u8; 4];
        let n = unsafe {
            libc::recv(
                self.fd,
                bytes.as_mut_ptr() as *mut libc::c_void,
                bytes.len(),
                0,
            )
        };
        if n != 4 {
            return Err(truncated("4-byte reply"));
        }
        Ok(i32::from_ne_bytes(bytes) == 0)
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

fn cmsg_header_len() -> usize {
    unsafe { libc::CMSG_SPACE(0) as usize }
}

fn unix_sockaddr(path: &str) -> io::Result<libc::sockaddr_un> {
    let cpath = CString::new(path).map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL"))?;
    let bytes = cpath.as_bytes_with_nul();
    if bytes.len() > 108 {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "socket path too long"));
    }
    let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
    for (i, b) in bytes.iter().enumerate() {
        addr.sun_path[i] = *b as libc::c_char;
    }
    Ok(addr)
}
