// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// End-to-end test: owner creates a session, hands it off over a real
// AF_UNIX SOCK_SEQPACKET socket, mapper receives and maps it, and a
// message makes it all the way from the owner's producer to the mapper's
// consumer.

use std::ffi::CString;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use rtipc::endpoint::ChannelParam;
use rtipc::handshake::{ChannelSpec, Connection, Listener, SessionRequest};
use rtipc::layout::ChannelDescriptor;
use rtipc::session::SessionVector;
use rtipc::QueueStatus;

static COUNTER: AtomicUsize = AtomicUsize::new(0);

fn unique_socket_path() -> String {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("/tmp/rtipc-test-{}-{}.sock", std::process::id(), n)
}

#[test]
fn owner_to_mapper_round_trip_over_real_socket() {
    let path = unique_socket_path();
    let cpath = CString::new(path.clone()).unwrap();
    unsafe {
        libc::unlink(cpath.as_ptr());
    }

    let listener = Listener::bind(&path, 1).expect("bind");

    let server = thread::spawn(move || {
        let conn = listener.accept().expect("accept");
        let (bytes, mut fds) = conn.recv_request().expect("recv_request");
        let request = SessionRequest::decode(&bytes).expect("decode");
        assert_eq!(fds.len(), request.expected_fd_count());

        let shm_fd = fds.remove(0);
        let mut fds = fds.into_iter();
        let owner_consumer_descs: Vec<ChannelDescriptor> = request
            .consumers
            .iter()
            .map(|c| ChannelDescriptor { msg_size: c.msg_size, add_msgs: c.add_msgs })
            .collect();
        let owner_producer_descs: Vec<ChannelDescriptor> = request
            .producers
            .iter()
            .map(|c| ChannelDescriptor { msg_size: c.msg_size, add_msgs: c.add_msgs })
            .collect();
        let consumer_eventfds: Vec<Option<libc::c_int>> = request
            .consumers
            .iter()
            .map(|c| if c.has_eventfd { fds.next() } else { None })
            .collect();
        let producer_eventfds: Vec<Option<libc::c_int>> = request
            .producers
            .iter()
            .map(|c| if c.has_eventfd { fds.next() } else { None })
            .collect();

        let mut session = SessionVector::map(
            shm_fd,
            &owner_consumer_descs,
            &owner_producer_descs,
            request.session_info.clone(),
            request.consumers.iter().map(|c| c.info.clone()).collect(),
            request.producers.iter().map(|c| c.info.clone()).collect(),
            consumer_eventfds,
            producer_eventfds,
        )
        .expect("map");
        assert_eq!(session.session_info(), b"test");
        conn.send_reply(true).expect("send_reply");

        let mut consumer = session.take_consumer(0).expect("mapper consumer");
        loop {
            match consumer.pop() {
                QueueStatus::Success => break,
                QueueStatus::NoMessage | QueueStatus::NoUpdate => continue,
                other => panic!("unexpected status: {other}"),
            }
        }
        let ptr = consumer.msg().expect("slot present");
        unsafe { *ptr }
    });

    let producer_param = ChannelParam::new(32, 0).with_eventfd().with_meta(b"demo".to_vec());
    let mut owner = SessionVector::create(&[], &[producer_param.clone()], b"test").expect("create");
    let mut producer = owner.take_producer(0).expect("owner producer");

    let request = SessionRequest {
        session_info: b"test".to_vec(),
        consumers: vec![],
        producers: vec![ChannelSpec {
            add_msgs: producer_param.add_msgs,
            msg_size: producer_param.msg_size as u32,
            has_eventfd: true,
            info: producer_param.meta.clone(),
        }],
    };
    let bytes = request.encode();

    let conn = Connection::connect(&path).expect("connect");
    let shm_fd = unsafe { libc::dup(owner.shm_fd()) };
    let eventfd_fd = unsafe { libc::dup(producer.eventfd().unwrap().fd()) };
    conn.send_request(&bytes, &[shm_fd, eventfd_fd]).expect("send_request");
    unsafe {
        libc::close(shm_fd);
        libc::close(eventfd_fd);
    }
    assert!(conn.recv_reply().expect("recv_reply"));

    unsafe {
        std::ptr::write_bytes(producer.msg(), 0x5A, producer.msg_size());
    }
    assert_eq!(producer.force_push(), QueueStatus::Success);

    let received = server.join().expect("server thread");
    assert_eq!(received, 0x5A);

    unsafe {
        libc::unlink(cpath.as_ptr());
    }
}
