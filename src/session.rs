// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Session vector: the set of producer/consumer endpoints carved out of one
// shared-memory region, plus the region itself. Port of rtipc's
// lib/vector.c (`ri_vector_t`), split here into an owner-side constructor
// (creates and initializes the region) and a mapper-side one (maps a
// region someone else already initialized).

use std::io;

use crate::endpoint::{ChannelParam, ConsumerEndpoint, ProducerEndpoint};
use crate::eventfd::EventFd;
use crate::layout::{ChannelDescriptor, Header, RegionLayout};
use crate::queue::SlotQueue;
use crate::shm::AnonShm;

/// The region plus its live endpoints. Endpoints are taken out one at a
/// time via [`SessionVector::take_producer`]/[`take_consumer`]; a taken slot
/// becomes `None` so a double-take is a programming error that surfaces as
/// an empty option rather than aliased state.
pub struct SessionVector {
    _shm: AnonShm,
    producers: Vec<Option<ProducerEndpoint>>,
    consumers: Vec<Option<ConsumerEndpoint>>,
    session_info: Vec<u8>,
}

impl SessionVector {
    /// Owner-side construction: compute the region size, create a fresh
    /// sealed anonymous memfd, write the header and descriptor table, and
    /// `init_shm` every channel's index area before anyone else can observe
    /// it. Eventfds are created locally for any channel that asked for one.
    pub fn create(
        consumers: &[ChannelParam],
        producers: &[ChannelParam],
        session_info: &[u8],
    ) -> io::Result<Self> {
        let consumer_descs: Vec<ChannelDescriptor> = consumers
            .iter()
            .map(|p| ChannelDescriptor {
                msg_size: p.msg_size as u32,
                add_msgs: p.add_msgs,
            })
            .collect();
        let producer_descs: Vec<ChannelDescriptor> = producers
            .iter()
            .map(|p| ChannelDescriptor {
                msg_size: p.msg_size as u32,
                add_msgs: p.add_msgs,
            })
            .collect();

        let layout = RegionLayout::compute(&consumer_descs, &producer_descs);
        let shm = AnonShm::create(layout.total_size)?;

        unsafe {
            let header = Header::for_host(consumers.len() as u32, producers.len() as u32);
            (shm.as_mut_ptr().add(layout.header_offset) as *mut Header).write(header);

            let table_ptr = shm.as_mut_ptr().add(layout.table_offset) as *mut ChannelDescriptor;
            for (i, d) in consumer_descs.iter().chain(producer_descs.iter()).enumerate() {
                table_ptr.add(i).write(*d);
            }
        }

        let mut consumer_endpoints = Vec::with_capacity(consumers.len());
        for (i, param) in consumers.iter().enumerate() {
            let base = unsafe { shm.as_mut_ptr().add(layout.channel_offsets[i]) };
            let queue = unsafe { SlotQueue::from_raw(base, param.geometry()) };
            queue.init_shm();
            let eventfd = if param.want_eventfd {
                Some(EventFd::create()?)
            } else {
                None
            };
            consumer_endpoints.push(Some(ConsumerEndpoint::new(queue, eventfd, param.meta.clone())));
        }

        let mut producer_endpoints = Vec::with_capacity(producers.len());
        for (i, param) in producers.iter().enumerate() {
            let offset = layout.channel_offsets[consumers.len() + i];
            let base = unsafe { shm.as_mut_ptr().add(offset) };
            let queue = unsafe { SlotQueue::from_raw(base, param.geometry()) };
            queue.init_shm();
            let eventfd = if param.want_eventfd {
                Some(EventFd::create()?)
            } else {
                None
            };
            producer_endpoints.push(Some(ProducerEndpoint::new(queue, eventfd, param.meta.clone())));
        }

        Ok(Self {
            _shm: shm,
            producers: producer_endpoints,
            consumers: consumer_endpoints,
            session_info: session_info.to_vec(),
        })
    }

    /// Mapper-side construction: map a region received from a peer, validate
    /// its header against this host's constants, and build endpoints over
    /// its already-initialized queues. `init_shm` is never called here — a
    /// second initialization would race the owner's first messages.
    ///
    /// `owner_consumer_descs`/`owner_producer_descs` are the descriptor
    /// table as parsed from the handshake request, in the owner's own
    /// terms (table order always consumers then producers, matching the
    /// region's physical layout). Each channel is single-producer,
    /// single-consumer, so the mapper necessarily takes the opposite role
    /// from the owner on every channel: the owner's consumer channels
    /// become this side's [`ProducerEndpoint`]s, and the owner's producer
    /// channels become this side's [`ConsumerEndpoint`]s.
    pub fn map(
        shm_fd: libc::c_int,
        owner_consumer_descs: &[ChannelDescriptor],
        owner_producer_descs: &[ChannelDescriptor],
        session_info: Vec<u8>,
        consumer_metas: Vec<Vec<u8>>,
        producer_metas: Vec<Vec<u8>>,
        consumer_eventfds: Vec<Option<libc::c_int>>,
        producer_eventfds: Vec<Option<libc::c_int>>,
    ) -> io::Result<Self> {
        let shm = AnonShm::from_fd(shm_fd)?;

        let header = unsafe { *(shm.as_ptr() as *const Header) };
        header
            .validate_host()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        if header.num_consumers as usize != owner_consumer_descs.len()
            || header.num_producers as usize != owner_producer_descs.len()
        {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "header channel counts do not match handshake table",
            ));
        }

        let layout = RegionLayout::compute(owner_consumer_descs, owner_producer_descs);
        if layout.total_size > shm.size() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "region too small for its own descriptor table",
            ));
        }

        // Owner's consumer channels: this side produces into them.
        let mut producer_endpoints = Vec::with_capacity(owner_consumer_descs.len());
        for (i, desc) in owner_consumer_descs.iter().enumerate() {
            let base = unsafe { shm.as_mut_ptr().add(layout.channel_offsets[i]) };
            let queue = unsafe { SlotQueue::from_raw(base, desc.geometry()) };
            let eventfd = match consumer_eventfds[i] {
                Some(fd) => Some(EventFd::from_fd(fd)?),
                None => None,
            };
            producer_endpoints.push(Some(ProducerEndpoint::new(
                queue,
                eventfd,
                consumer_metas[i].clone(),
            )));
        }

        // Owner's producer channels: this side consumes from them.
        let mut consumer_endpoints = Vec::with_capacity(owner_producer_descs.len());
        for (i, desc) in owner_producer_descs.iter().enumerate() {
            let offset = layout.channel_offsets[owner_consumer_descs.len() + i];
            let base = unsafe { shm.as_mut_ptr().add(offset) };
            let queue = unsafe { SlotQueue::from_raw(base, desc.geometry()) };
            let eventfd = match producer_eventfds[i] {
                Some(fd) => Some(EventFd::from_fd(fd)?),
                None => None,
            };
            consumer_endpoints.push(Some(ConsumerEndpoint::new(
                queue,
                eventfd,
                producer_metas[i].clone(),
            )));
        }

        Ok(Self {
            _shm: shm,
            producers: producer_endpoints,
            consumers: consumer_endpoints,
            session_info,
        })
    }

    /// Borrow the backing memfd. Duplicate it before sending over a
    /// handshake socket, since `SessionVector` still owns and will
    /// eventually close the original.
    pub fn shm_fd(&self) -> libc::c_int {
        self._shm.fd()
    }

    /// The session info blob: locally supplied on the owner side, the
    /// peer's handshake request value on the mapper side.
    pub fn session_info(&self) -> &[u8] {
        &self.session_info
    }

    pub fn num_producers(&self) -> usize {
        self.producers.len()
    }

    pub fn num_consumers(&self) -> usize {
        self.consumers.len()
    }

    /// Take ownership of producer `i`. `None` if out of range or already taken.
    pub fn take_producer(&mut self, i: usize) -> Option<ProducerEndpoint> {
        self.producers.get_mut(i).and_then(|slot| slot.take())
    }

    /// Take ownership of consumer `i`. `None` if out of range or already taken.
    pub fn take_consumer(&mut self, i: usize) -> Option<ConsumerEndpoint> {
        self.consumers.get_mut(i).and_then(|slot| slot.take())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::QueueStatus;

    #[test]
    fn owner_create_then_take_round_trip() {
        let consumers = vec![ChannelParam::new(16, 0)];
        let producers = vec![ChannelParam::new(16, 0)];
        let mut session = SessionVector::create(&consumers, &producers, b"owner").expect("create");
        assert_eq!(session.session_info(), b"owner");

        let mut producer = session.take_producer(0).expect("producer");
        let mut consumer = session.take_consumer(0).expect("consumer");
        assert!(session.take_producer(0).is_none(), "second take must fail");

        unsafe {
            std::ptr::write_bytes(producer.msg(), 7, producer.msg_size());
        }
        assert_eq!(producer.force_push(), QueueStatus::Success);
        assert_eq!(consumer.pop(), QueueStatus::Success);
    }

    #[test]
    fn create_rejects_nothing_but_map_rejects_mismatched_header() {
        let consumers = vec![ChannelParam::new(16, 0)];
        let producers: Vec<ChannelParam> = vec![];
        let session = SessionVector::create(&consumers, &producers, b"").expect("create");
        let fd = unsafe { libc::dup(session._shm.fd()) };
        assert!(fd >= 0);

        // Wrong producer count in the caller-supplied descriptor table.
        let bad_producer_descs = vec![ChannelDescriptor { msg_size: 16, add_msgs: 0 }];
        let err = SessionVector::map(
            fd,
            &[ChannelDescriptor { msg_size: 16, add_msgs: 0 }],
            &bad_producer_descs,
            b"peer".to_vec(),
            vec![vec![]],
            vec![],
            vec![None],
            vec![],
        )
        .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn mapper_gets_opposite_role_from_owner() {
        // Owner has one consumer channel ("mapper -> owner") and one
        // producer channel ("owner -> mapper").
        let owner_consumers = vec![ChannelParam::new(16, 0)];
        let owner_producers = vec![ChannelParam::new(16, 0)];
        let mut owner =
            SessionVector::create(&owner_consumers, &owner_producers, b"owner").expect("create");
        let fd = unsafe { libc::dup(owner._shm.fd()) };
        assert!(fd >= 0);

        let consumer_descs = vec![ChannelDescriptor { msg_size: 16, add_msgs: 0 }];
        let producer_descs = vec![ChannelDescriptor { msg_size: 16, add_msgs: 0 }];
        let mut mapper = SessionVector::map(
            fd,
            &consumer_descs,
            &producer_descs,
            b"owner".to_vec(),
            vec![vec![]],
            vec![vec![]],
            vec![None],
            vec![None],
        )
        .expect("map");
        assert_eq!(mapper.session_info(), b"owner");

        // Owner -> mapper: owner holds the producer, mapper holds the consumer.
        let mut owner_producer = owner.take_producer(0).expect("owner producer");
        let mut mapper_consumer = mapper.take_consumer(0).expect("mapper consumer");
        unsafe {
            std::ptr::write_bytes(owner_producer.msg(), 0xAB, owner_producer.msg_size());
        }
        assert_eq!(owner_producer.force_push(), QueueStatus::Success);
        assert_eq!(mapper_consumer.pop(), QueueStatus::Success);

        // Mapper -> owner: mapper holds the producer, owner holds the consumer.
        let mut mapper_producer = mapper.take_producer(0).expect("mapper producer");
        let mut owner_consumer = owner.take_consumer(0).expect("owner consumer");
        unsafe {
            std::ptr::write_bytes(mapper_producer.msg(), 0xCD, mapper_producer.msg_size());
        }
        assert_eq!(mapper_producer.force_push(), QueueStatus::Success);
        assert_eq!(owner_consumer.pop(), QueueStatus::Success);
    }
}
