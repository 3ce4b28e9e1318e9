// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// The lock-free N-slot overwrite queue. Port of rtipc's lib/queue.c,
// lib/producer.c, lib/consumer.c and the inline atomic helpers in
// lib/channel.h (the struct-layer "channel", not the broadcast Route/Channel
// design elsewhere in this crate's history).
//
// One `SlotQueue` is a raw view over a region of shared memory holding the
// tail/head/chain atomic words followed by the slot storage. Producer and
// Consumer hold their own endpoint-local state (current/head/overrun) plus a
// copy of this view; neither owns the memory.

use std::mem::size_of;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::QueueStatus;
use crate::index::{index_of, is_consumed, with_consumed, CONSUMED_FLAG, INDEX_MASK, INVALID};

/// Round `n` up to the next multiple of `align` (`align` must be a power of two).
#[inline]
pub const fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

/// The cacheline size assumed by this implementation. Shared-memory peers
/// must agree on this value; see `crate::layout::Header`.
pub const CACHELINE: usize = 64;

/// Fixed geometry of one channel's queue: slot count and stride.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueGeometry {
    pub n_msgs: u32,
    pub msg_size: usize,
    pub slot_stride: usize,
}

impl QueueGeometry {
    /// `add_msgs` is extra slots beyond the minimum of 3 (see invariant 1).
    pub fn new(msg_size: usize, add_msgs: u32) -> Self {
        assert!(msg_size > 0, "msg_size must be positive");
        let n_msgs = 3u32.checked_add(add_msgs).expect("n_msgs overflow");
        assert!(n_msgs & !INDEX_MASK == 0, "n_msgs exceeds the index width");
        let slot_stride = align_up(msg_size, CACHELINE);
        Self {
            n_msgs,
            msg_size,
            slot_stride,
        }
    }

    /// Bytes occupied by the tail/head/chain atomic words, cacheline-aligned.
    pub fn index_area_size(&self) -> usize {
        let raw = (self.n_msgs as usize + 2) * size_of::<AtomicU32>();
        align_up(raw, CACHELINE)
    }

    pub fn slots_size(&self) -> usize {
        self.n_msgs as usize * self.slot_stride
    }

    /// Total bytes this channel's queue region occupies.
    pub fn total_size(&self) -> usize {
        self.index_area_size() + self.slots_size()
    }
}

/// Raw view over one channel's queue region in shared memory.
///
/// Layout at `base`: `tail: AtomicU32`, `head: AtomicU32`, `chain: [AtomicU32; n_msgs]`
/// (padded to a cacheline), then `n_msgs` slots of `slot_stride` bytes.
///
/// Copyable: it carries only pointers and geometry, never ownership.
#[derive(Clone, Copy)]
pub struct SlotQueue {
    tail: *const AtomicU32,
    head: *const AtomicU32,
    chain: *const AtomicU32,
    msgs: *mut u8,
    geom: QueueGeometry,
}

unsafe impl Send for SlotQueue {}
unsafe impl Sync for SlotQueue {}

impl SlotQueue {
    /// Build a view over an already-initialised (or about-to-be-initialised)
    /// region. `base` must be valid for `geom.total_size()` bytes and must
    /// outlive this view.
    ///
    /// # Safety
    /// `base` must point to a region of at least `geom.total_size()` bytes,
    /// properly aligned for `AtomicU32`, that is not concurrently accessed
    /// except through `SlotQueue`/`Producer`/`Consumer` operations.
    pub unsafe fn from_raw(base: *mut u8, geom: QueueGeometry) -> Self {
        let tail = base as *const AtomicU32;
        let head = base.add(size_of::<AtomicU32>()) as *const AtomicU32;
        let chain = base.add(2 * size_of::<AtomicU32>()) as *const AtomicU32;
        let msgs = base.add(geom.index_area_size());
        Self {
            tail,
            head,
            chain,
            msgs,
            geom,
        }
    }

    pub fn geometry(&self) -> QueueGeometry {
        self.geom
    }

    /// Initialise the index area: `tail = head = INVALID`, `chain[i] = (i+1) mod n_msgs`.
    /// Called once by the owner before any producer/consumer touches the queue.
    pub fn init_shm(&self) {
        self.tail_atomic().store(INVALID, Ordering::Relaxed);
        self.head_atomic().store(INVALID, Ordering::Relaxed);
        for i in 0..self.geom.n_msgs {
            self.chain_atomic(i).store((i + 1) % self.geom.n_msgs, Ordering::Relaxed);
        }
    }

    #[inline]
    fn tail_atomic(&self) -> &AtomicU32 {
        unsafe { &*self.tail }
    }

    #[inline]
    fn head_atomic(&self) -> &AtomicU32 {
        unsafe { &*self.head }
    }

    #[inline]
    fn chain_atomic(&self, idx: u32) -> &AtomicU32 {
        debug_assert!(idx < self.geom.n_msgs);
        unsafe { &*self.chain.add(idx as usize) }
    }

    #[inline]
    fn tail_load(&self) -> u32 {
        self.tail_atomic().load(Ordering::Acquire)
    }

    #[inline]
    fn tail_store(&self, v: u32) {
        self.tail_atomic().store(v, Ordering::Release);
    }

    #[inline]
    fn tail_fetch_or(&self, bits: u32) -> u32 {
        self.tail_atomic().fetch_or(bits, Ordering::AcqRel)
    }

    #[inline]
    fn tail_cas(&self, expected: u32, new: u32) -> Result<u32, u32> {
        self.tail_atomic()
            .compare_exchange(expected, new, Ordering::AcqRel, Ordering::Acquire)
    }

    #[inline]
    fn head_load(&self) -> u32 {
        self.head_atomic().load(Ordering::Acquire)
    }

    #[inline]
    fn head_store(&self, v: u32) {
        self.head_atomic().store(v, Ordering::Release);
    }

    #[inline]
    fn chain_load(&self, idx: u32) -> u32 {
        self.chain_atomic(idx).load(Ordering::Acquire)
    }

    #[inline]
    fn chain_store(&self, idx: u32, v: u32) {
        self.chain_atomic(idx).store(v, Ordering::Release);
    }

    fn valid_index(&self, idx: u32) -> bool {
        idx < self.geom.n_msgs
    }

    /// Pointer to the start of slot `idx`'s bytes. `idx` must be `< n_msgs`.
    pub fn slot_ptr(&self, idx: u32) -> *mut u8 {
        assert!(self.valid_index(idx), "slot index out of range");
        unsafe { self.msgs.add(idx as usize * self.geom.slot_stride) }
    }
}

/// Endpoint-local producer state over a [`SlotQueue`].
pub struct Producer {
    queue: SlotQueue,
    current: u32,
    head: u32,
    overrun: u32,
}

impl Producer {
    /// `current` starts at slot 0 (the owner's initial write target); `head`
    /// and `overrun` start at INVALID.
    pub fn new(queue: SlotQueue) -> Self {
        Self {
            queue,
            current: 0,
            head: INVALID,
            overrun: INVALID,
        }
    }

    pub fn geometry(&self) -> QueueGeometry {
        self.queue.geometry()
    }

    /// Pointer to the slot currently being written.
    pub fn current_slot(&self) -> *mut u8 {
        self.queue.slot_ptr(self.current)
    }

    fn link_current(&mut self) {
        self.queue.chain_store(self.current, INVALID);
        if self.head == INVALID {
            self.queue.tail_store(self.current);
        } else {
            self.queue.chain_store(self.head, self.current);
        }
        self.head = self.current;
        self.queue.head_store(self.head);
    }

    /// CAS `tail: expected -> chain[index_of(expected)]`. Used to advance
    /// `tail` past its current slot when the consumer has not claimed it.
    fn move_tail(&self, expected: u32) -> bool {
        let next = self.queue.chain_load(index_of(expected));
        self.queue.tail_cas(expected, next).is_ok()
    }

    /// Jump the producer over the consumer's currently-held slot.
    /// Returns `true` if the jump happened (one message discarded).
    fn overrun(&mut self, tail: u32) -> bool {
        let tail_idx = index_of(tail);
        let new_current = self.queue.chain_load(tail_idx);
        let new_tail = self.queue.chain_load(new_current);
        match self.queue.tail_cas(tail, new_tail) {
            Ok(_) => {
                self.overrun = tail_idx;
                self.current = new_current;
                true
            }
            Err(_) => {
                // The consumer released the slot between our load and CAS.
                self.current = tail_idx;
                false
            }
        }
    }

    /// Publish `current`, never failing. See the case analysis in
    /// `SPEC_FULL.md` §4.1.
    pub fn force_push(&mut self) -> QueueStatus {
        let current = self.current;
        let next = self.queue.chain_load(current);
        self.link_current();

        let tail = self.queue.tail_load();
        let consumed = is_consumed(tail);
        let full = next == index_of(tail);
        let discarded;

        if self.overrun != INVALID {
            if consumed {
                self.queue.chain_store(self.overrun, next);
                self.current = self.overrun;
                self.overrun = INVALID;
                discarded = false;
            } else if self.move_tail(tail) {
                self.current = index_of(tail);
                discarded = true;
            } else {
                // The consumer released the overran slot between our load and
                // the failed CAS: requeue it, same as the `consumed` arm above.
                self.queue.chain_store(self.overrun, next);
                self.current = self.overrun;
                self.overrun = INVALID;
                discarded = false;
            }
        } else if !full {
            self.current = next;
            discarded = false;
        } else if !consumed {
            if self.move_tail(tail) {
                self.current = next;
                discarded = true;
            } else {
                // The consumer just set CONSUMED on `tail` between our load
                // and the failed CAS; `overrun()` must see that bit to CAS
                // against the live word.
                discarded = self.overrun(tail | CONSUMED_FLAG);
            }
        } else {
            discarded = self.overrun(tail);
        }

        // A concurrently-releasing consumer can make a single overrun() CAS
        // fail; overrun() already resolved to the released slot in that
        // case, so there is nothing further to retry here.
        if discarded {
            QueueStatus::Discarded
        } else {
            QueueStatus::Success
        }
    }

    /// Pure query: would `try_push` succeed right now? Never mutates
    /// anything. Lets callers (e.g. a write-cache) skip work ahead of a
    /// doomed push without paying for a real attempt.
    pub fn would_publish(&self) -> bool {
        let next = self.queue.chain_load(self.current);
        let tail = self.queue.tail_load();
        let consumed = is_consumed(tail);
        let full = next == index_of(tail);
        (self.overrun != INVALID && consumed) || (self.overrun == INVALID && !full)
    }

    /// Publish `current` only if it does not require advancing or overrunning
    /// the consumer. Leaves all state untouched on failure.
    pub fn try_push(&mut self) -> QueueStatus {
        let current = self.current;
        let next = self.queue.chain_load(current);
        let tail = self.queue.tail_load();
        let consumed = is_consumed(tail);
        let full = next == index_of(tail);

        if self.overrun != INVALID && consumed {
            self.link_current();
            self.queue.chain_store(self.overrun, next);
            self.current = self.overrun;
            self.overrun = INVALID;
            QueueStatus::Success
        } else if self.overrun == INVALID && !full {
            self.link_current();
            self.current = next;
            QueueStatus::Success
        } else {
            QueueStatus::Fail
        }
    }
}

/// Endpoint-local consumer state over a [`SlotQueue`].
pub struct Consumer {
    queue: SlotQueue,
    current: u32,
}

impl Consumer {
    pub fn new(queue: SlotQueue) -> Self {
        Self {
            queue,
            current: INVALID,
        }
    }

    pub fn geometry(&self) -> QueueGeometry {
        self.queue.geometry()
    }

    /// Pointer to the slot last landed on by `pop`/`flush`, or `None` before
    /// the first successful receive.
    pub fn current_slot(&self) -> Option<*const u8> {
        if self.current == INVALID {
            None
        } else {
            Some(self.queue.slot_ptr(self.current) as *const u8)
        }
    }

    /// Advance one step. See the case analysis in `SPEC_FULL.md` §4.1.
    pub fn pop(&mut self) -> QueueStatus {
        let old = self.queue.tail_fetch_or(CONSUMED_FLAG);
        if old == INVALID {
            return QueueStatus::NoMessage;
        }
        let old_idx = index_of(old);
        if !self.queue.valid_index(old_idx) {
            return QueueStatus::Error;
        }
        if !is_consumed(old) {
            // CONSUMED clear on a first-ever read means either exactly one
            // message has ever been published (nothing lost: tail still
            // points at the sole, still-terminal slot), or the producer
            // lapped past one or more unread messages before we ever looked.
            // `old_idx == head_idx` with `chain[old_idx] == INVALID` is only
            // true in the single-message case, since the producer always
            // clears a slot's chain link when it becomes head and only
            // relinks it once something newer is published.
            let head_idx = index_of(self.queue.head_load());
            if old_idx == head_idx && self.queue.chain_load(old_idx) == INVALID {
                self.current = old_idx;
                return QueueStatus::Success;
            }
            if !self.queue.valid_index(head_idx) {
                return QueueStatus::Error;
            }
            self.current = head_idx;
            return QueueStatus::Discarded;
        }

        let next = self.queue.chain_load(self.current);
        if next == INVALID {
            return QueueStatus::NoUpdate;
        }
        if !self.queue.valid_index(next) {
            return QueueStatus::Error;
        }
        match self.queue.tail_cas(old, with_consumed(next)) {
            Ok(_) => {
                self.current = next;
                QueueStatus::Success
            }
            Err(_) => {
                let refetched = self.queue.tail_fetch_or(CONSUMED_FLAG);
                self.current = index_of(refetched);
                QueueStatus::Discarded
            }
        }
    }

    /// Jump straight to the most recently published slot.
    pub fn flush(&mut self) -> QueueStatus {
        loop {
            let tail = self.queue.tail_fetch_or(CONSUMED_FLAG);
            if tail == INVALID {
                return QueueStatus::NoMessage;
            }
            let tail_idx = index_of(tail);
            if !self.queue.valid_index(tail_idx) {
                return QueueStatus::Error;
            }
            let head = self.queue.head_load();
            let head_idx = index_of(head);
            if !self.queue.valid_index(head_idx) {
                return QueueStatus::Error;
            }
            match self
                .queue
                .tail_cas(with_consumed(tail_idx), with_consumed(head_idx))
            {
                Ok(_) => {
                    self.current = head_idx;
                    return QueueStatus::Discarded;
                }
                Err(_) => continue,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_queue(add_msgs: u32, msg_size: usize) -> (Vec<u8>, SlotQueue) {
        let geom = QueueGeometry::new(msg_size, add_msgs);
        let mut buf = vec![0u8; geom.total_size()];
        let queue = unsafe { SlotQueue::from_raw(buf.as_mut_ptr(), geom) };
        queue.init_shm();
        (buf, queue)
    }

    fn write_byte(producer: &Producer, b: u8) {
        unsafe {
            std::ptr::write_bytes(producer.current_slot(), b, producer.geometry().msg_size);
        }
    }

    fn read_byte(consumer: &Consumer) -> u8 {
        let ptr = consumer.current_slot().expect("no current slot");
        unsafe { *ptr }
    }

    #[test]
    fn scenario_1_single_push_pop_is_success() {
        let (_buf, queue) = make_queue(0, 8);
        let mut p = Producer::new(queue);
        let mut c = Consumer::new(queue);

        write_byte(&p, 0x01);
        assert_eq!(p.force_push(), QueueStatus::Success);
        assert_eq!(c.pop(), QueueStatus::Success);
        assert_eq!(read_byte(&c), 0x01);
    }

    #[test]
    fn scenario_2_overrun_skips_to_latest_recoverable() {
        let (_buf, queue) = make_queue(0, 8);
        let mut p = Producer::new(queue);
        let mut c = Consumer::new(queue);

        let mut any_discarded = false;
        for b in [b'A', b'B', b'C', b'D'] {
            write_byte(&p, b);
            if p.force_push() == QueueStatus::Discarded {
                any_discarded = true;
            }
        }
        assert!(any_discarded, "n_msgs=3 with 4 publishes must discard at least one");

        let status = c.pop();
        assert_eq!(status, QueueStatus::Discarded);
        assert_eq!(read_byte(&c), b'D', "first pop after a lap must land on the latest message");
    }

    #[test]
    fn boundary_two_pushes_before_first_pop_discards_to_second() {
        let (_buf, queue) = make_queue(0, 8);
        let mut p = Producer::new(queue);
        let mut c = Consumer::new(queue);

        write_byte(&p, b'A');
        assert_eq!(p.force_push(), QueueStatus::Success);
        write_byte(&p, b'B');
        assert_eq!(p.force_push(), QueueStatus::Success);

        assert_eq!(c.pop(), QueueStatus::Discarded);
        assert_eq!(read_byte(&c), b'B', "never land on the first message once a second was published");
    }

    #[test]
    fn boundary_n_msgs_3_stall_discards_third_push() {
        let (_buf, queue) = make_queue(0, 8);
        let mut p = Producer::new(queue);
        let mut c = Consumer::new(queue);

        write_byte(&p, 1);
        assert_eq!(p.force_push(), QueueStatus::Success);
        assert_eq!(c.pop(), QueueStatus::Success); // consumer now holds one slot

        write_byte(&p, 2);
        assert_eq!(p.force_push(), QueueStatus::Success);
        write_byte(&p, 3);
        assert_eq!(p.force_push(), QueueStatus::Discarded);
    }

    #[test]
    fn boundary_repeated_pop_then_no_update_forever() {
        let (_buf, queue) = make_queue(0, 8);
        let mut p = Producer::new(queue);
        let mut c = Consumer::new(queue);

        write_byte(&p, 9);
        assert_eq!(p.force_push(), QueueStatus::Success);
        assert_eq!(c.pop(), QueueStatus::Success);
        assert_eq!(c.pop(), QueueStatus::NoUpdate);
        assert_eq!(c.pop(), QueueStatus::NoUpdate);
    }

    #[test]
    fn boundary_flush_never_written_is_no_message() {
        let (_buf, queue) = make_queue(0, 8);
        let mut c = Consumer::new(queue);
        assert_eq!(c.flush(), QueueStatus::NoMessage);
    }

    #[test]
    fn boundary_flush_lapped_queue_lands_on_head() {
        let (_buf, queue) = make_queue(0, 8);
        let mut p = Producer::new(queue);
        let mut c = Consumer::new(queue);

        for b in [1u8, 2, 3, 4] {
            write_byte(&p, b);
            p.force_push();
        }
        assert_eq!(c.flush(), QueueStatus::Discarded);
        assert_eq!(read_byte(&c), 4);
    }

    #[test]
    fn scenario_4_two_channels_independent_no_pop_stays_success() {
        let (_buf, queue) = make_queue(5, 8);
        let mut p = Producer::new(queue);
        for _ in 0..4 {
            assert_eq!(p.force_push(), QueueStatus::Success);
        }
    }

    #[test]
    fn try_push_fails_without_mutating_state_when_full() {
        let (_buf, queue) = make_queue(0, 8);
        let mut p = Producer::new(queue);
        let mut c = Consumer::new(queue);

        write_byte(&p, 1);
        assert_eq!(p.force_push(), QueueStatus::Success);
        assert_eq!(c.pop(), QueueStatus::Success); // consumer holds a slot
        write_byte(&p, 2);
        assert_eq!(p.force_push(), QueueStatus::Success); // fills remaining free slot

        let before = p.current;
        assert_eq!(p.try_push(), QueueStatus::Fail);
        assert_eq!(p.current, before, "try_push must not mutate current on failure");
    }

    #[test]
    fn invariant_indices_stay_in_range_or_invalid() {
        let (_buf, queue) = make_queue(2, 16);
        let n = queue.geometry().n_msgs;
        let mut p = Producer::new(queue);
        let mut c = Consumer::new(queue);
        for i in 0..50u8 {
            write_byte(&p, i);
            p.force_push();
            assert!(p.current < n);
            if i % 3 == 0 {
                let status = c.pop();
                if status != QueueStatus::NoMessage {
                    assert!(c.current < n || c.current == INVALID);
                }
            }
        }
    }
}
