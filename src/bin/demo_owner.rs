// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Owner-side demo: creates a shared-memory region with one producer
// channel, hands it to a waiting mapper over a well-known socket path, and
// publishes a handful of messages.

use std::{thread, time::Duration};

use rtipc::endpoint::ChannelParam;
use rtipc::handshake::{ChannelSpec, Connection, SessionRequest};
use rtipc::session::SessionVector;

const SOCKET_PATH: &str = "/tmp/rtipc-demo.sock";

fn main() -> std::io::Result<()> {
    let producer_param = ChannelParam::new(64, 5).with_eventfd().with_meta(b"ticks".to_vec());
    let mut session = SessionVector::create(&[], &[producer_param.clone()], b"demo-owner")?;

    let request = SessionRequest {
        session_info: session.session_info().to_vec(),
        consumers: vec![],
        producers: vec![ChannelSpec {
            add_msgs: producer_param.add_msgs,
            msg_size: producer_param.msg_size as u32,
            has_eventfd: true,
            info: producer_param.meta.clone(),
        }],
    };
    let bytes = request.encode();

    let mut producer = session.take_producer(0).expect("producer endpoint");
    let shm_fd = unsafe { libc::dup(session.shm_fd()) };
    let eventfd_fd = unsafe { libc::dup(producer.eventfd().expect("eventfd").fd()) };

    let conn = Connection::connect(SOCKET_PATH)?;
    conn.send_request(&bytes, &[shm_fd, eventfd_fd])?;
    unsafe {
        libc::close(shm_fd);
        libc::close(eventfd_fd);
    }
    if !conn.recv_reply()? {
        eprintln!("mapper rejected the session");
        return Ok(());
    }

    for i in 0u8..10 {
        unsafe {
            std::ptr::write_bytes(producer.msg(), i, producer.msg_size());
        }
        let status = producer.force_push();
        eprintln!("published {i} -> {status}");
        thread::sleep(Duration::from_millis(50));
    }
    Ok(())
}
