// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Channel endpoints: a producer or consumer handle wrapping a `SlotQueue`,
// with an optional event-fd and, for producers, an optional write-cache.
// Port of rtipc's lib/channel.c (`ri_producer_t`/`ri_consumer_t`, the
// endpoint-wrapping layer — not lib/channel.h's inner queue struct, which
// `crate::queue` already covers).

use std::io;

use crate::error::QueueStatus;
use crate::eventfd::EventFd;
use crate::queue::{Consumer as QueueConsumer, Producer as QueueProducer, QueueGeometry, SlotQueue};

/// Immutable per-channel configuration shared by both endpoints of a
/// connection. `meta` is an opaque blob upper layers may use to describe the
/// payload schema; this crate never interprets it.
#[derive(Debug, Clone)]
pub struct ChannelParam {
    pub msg_size: usize,
    pub add_msgs: u32,
    pub want_eventfd: bool,
    pub meta: Vec<u8>,
}

impl ChannelParam {
    pub fn new(msg_size: usize, add_msgs: u32) -> Self {
        Self {
            msg_size,
            add_msgs,
            want_eventfd: false,
            meta: Vec::new(),
        }
    }

    pub fn with_eventfd(mut self) -> Self {
        self.want_eventfd = true;
        self
    }

    pub fn with_meta(mut self, meta: Vec<u8>) -> Self {
        self.meta = meta;
        self
    }

    pub fn geometry(&self) -> QueueGeometry {
        QueueGeometry::new(self.msg_size, self.add_msgs)
    }
}

/// A producer endpoint: the queue, an optional event-fd, an optional
/// write-cache, and the channel's metadata blob.
pub struct ProducerEndpoint {
    queue: QueueProducer,
    geom: QueueGeometry,
    eventfd: Option<EventFd>,
    cache: Option<Vec<u8>>,
    meta: Vec<u8>,
}

impl ProducerEndpoint {
    pub fn new(slot_queue: SlotQueue, eventfd: Option<EventFd>, meta: Vec<u8>) -> Self {
        let geom = slot_queue.geometry();
        Self {
            queue: QueueProducer::new(slot_queue),
            geom,
            eventfd,
            cache: None,
            meta,
        }
    }

    pub fn meta(&self) -> &[u8] {
        &self.meta
    }

    pub fn has_eventfd(&self) -> bool {
        self.eventfd.is_some()
    }

    pub fn eventfd(&self) -> Option<&EventFd> {
        self.eventfd.as_ref()
    }

    /// Pointer to the cache if enabled, else to the current slot (§4.2 `msg()`).
    pub fn msg(&self) -> *mut u8 {
        match &self.cache {
            Some(c) => c.as_ptr() as *mut u8,
            None => self.queue.current_slot(),
        }
    }

    pub fn msg_size(&self) -> usize {
        self.geom.msg_size
    }

    /// Allocate a write-cache and seed it with the current slot's bytes, so
    /// a read-back immediately after enabling is consistent. No-op if
    /// already enabled.
    pub fn cache_enable(&mut self) {
        if self.cache.is_some() {
            return;
        }
        let mut buf = vec![0u8; self.geom.msg_size];
        unsafe {
            std::ptr::copy_nonoverlapping(self.queue.current_slot(), buf.as_mut_ptr(), self.geom.msg_size);
        }
        self.cache = Some(buf);
    }

    /// Write the cache back into the live slot and free it. No-op if not enabled.
    pub fn cache_disable(&mut self) {
        if let Some(buf) = self.cache.take() {
            unsafe {
                std::ptr::copy_nonoverlapping(buf.as_ptr(), self.queue.current_slot(), self.geom.msg_size);
            }
        }
    }

    fn flush_cache_to_slot(&self) {
        if let Some(buf) = &self.cache {
            unsafe {
                std::ptr::copy_nonoverlapping(buf.as_ptr(), self.queue.current_slot(), self.geom.msg_size);
            }
        }
    }

    fn signal(&self) {
        if let Some(fd) = &self.eventfd {
            // Best-effort: a full semaphore counter means the consumer
            // hasn't drained in a while; the queue itself is the source of
            // truth, so a dropped notification is not a correctness issue.
            let _ = fd.signal();
        }
    }

    /// Publish `current`, never failing. Writes the cache into the slot
    /// first if enabled, then signals the event-fd on success.
    pub fn force_push(&mut self) -> QueueStatus {
        self.flush_cache_to_slot();
        let status = self.queue.force_push();
        if status.is_success() {
            self.signal();
        }
        status
    }

    /// Publish `current` only if it would not require overrunning the
    /// consumer. If a cache is enabled, checked via a dry-run before the
    /// cache is written, so a doomed push never wastes the copy.
    pub fn try_push(&mut self) -> QueueStatus {
        if self.cache.is_some() && !self.queue.would_publish() {
            return QueueStatus::Fail;
        }
        self.flush_cache_to_slot();
        let status = self.queue.try_push();
        if status.is_success() {
            self.signal();
        }
        status
    }
}

/// A consumer endpoint: the queue, an optional event-fd, and the channel's
/// metadata blob.
pub struct ConsumerEndpoint {
    queue: QueueConsumer,
    eventfd: Option<EventFd>,
    meta: Vec<u8>,
}

impl ConsumerEndpoint {
    pub fn new(slot_queue: SlotQueue, eventfd: Option<EventFd>, meta: Vec<u8>) -> Self {
        Self {
            queue: QueueConsumer::new(slot_queue),
            eventfd,
            meta,
        }
    }

    pub fn meta(&self) -> &[u8] {
        &self.meta
    }

    pub fn has_eventfd(&self) -> bool {
        self.eventfd.is_some()
    }

    pub fn eventfd(&self) -> Option<&EventFd> {
        self.eventfd.as_ref()
    }

    pub fn msg(&self) -> Option<*const u8> {
        self.queue.current_slot()
    }

    pub fn msg_size(&self) -> usize {
        self.queue.geometry().msg_size
    }

    /// If an event-fd is present, drain one non-blocking counter first; a
    /// drain that yields nothing is not itself an error (the event-fd may
    /// lag or a caller may poll spuriously) — fall through to the queue to
    /// distinguish NO_UPDATE from NO_MSG.
    pub fn pop(&mut self) -> QueueStatus {
        if let Some(fd) = &self.eventfd {
            if fd.try_consume().is_err() {
                return QueueStatus::Error;
            }
        }
        self.queue.pop()
    }

    /// Drain all pending event-fd counters (so the semaphore count never
    /// drifts ahead of the queue) before jumping to head.
    pub fn flush(&mut self) -> QueueStatus {
        if let Some(fd) = &self.eventfd {
            while matches!(fd.try_consume(), Ok(true)) {}
        }
        self.queue.flush()
    }
}

/// Close an fd that failed to negotiate successfully, so setup failures
/// never leak handles. Used by session construction on the error path.
pub(crate) fn close_fd_best_effort(fd: libc::c_int) {
    if fd >= 0 {
        unsafe {
            libc::close(fd);
        }
    }
}

pub(crate) fn io_err(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::Other, msg)
}
