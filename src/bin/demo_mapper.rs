// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Mapper-side demo: listens on a well-known socket path, accepts one
// handshake, maps the owner's shared-memory region, and prints every
// message the owner's producer channel publishes.

use std::ffi::CString;

use rtipc::handshake::{Listener, SessionRequest};
use rtipc::layout::ChannelDescriptor;
use rtipc::session::SessionVector;

const SOCKET_PATH: &str = "/tmp/rtipc-demo.sock";

fn main() -> std::io::Result<()> {
    let cpath = CString::new(SOCKET_PATH).unwrap();
    unsafe {
        libc::unlink(cpath.as_ptr());
    }

    let listener = Listener::bind(SOCKET_PATH, 1)?;
    eprintln!("waiting for owner on {SOCKET_PATH}");
    let conn = listener.accept()?;

    let (bytes, mut fds) = conn.recv_request()?;
    let request = SessionRequest::decode(&bytes)
        .map_err(|e| { let _ = conn.send_reply(false); e })?;

    if fds.len() != request.expected_fd_count() {
        conn.send_reply(false)?;
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "fd count mismatch"));
    }

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

    let consumer_metas: Vec<Vec<u8>> = request.consumers.iter().map(|c| c.info.clone()).collect();
    let producer_metas: Vec<Vec<u8>> = request.producers.iter().map(|c| c.info.clone()).collect();
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
        consumer_metas,
        producer_metas,
        consumer_eventfds,
        producer_eventfds,
    )
    .map_err(|e| { let _ = conn.send_reply(false); e })?;

    eprintln!("owner's session info: {:?}", String::from_utf8_lossy(session.session_info()));
    conn.send_reply(true)?;

    let mut consumer = session.take_consumer(0).expect("consumer endpoint for owner's producer channel");
    loop {
        match consumer.pop() {
            rtipc::QueueStatus::Success | rtipc::QueueStatus::Discarded => {
                let ptr = consumer.msg().expect("slot present after a successful pop");
                let byte = unsafe { *ptr };
                eprintln!("received {byte}");
            }
            rtipc::QueueStatus::NoMessage | rtipc::QueueStatus::NoUpdate => {
                std::thread::sleep(std::time::Duration::from_millis(10));
            }
            status => {
                eprintln!("consumer error: {status}");
                break;
            }
        }
    }
    Ok(())
}
