// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use rtipc::queue::{Consumer, Producer, QueueGeometry, SlotQueue};

fn make_queue(add_msgs: u32, msg_size: usize) -> (Vec<u8>, SlotQueue) {
    let geom = QueueGeometry::new(msg_size, add_msgs);
    let mut buf = vec![0u8; geom.total_size()];
    let queue = unsafe { SlotQueue::from_raw(buf.as_mut_ptr(), geom) };
    queue.init_shm();
    (buf, queue)
}

fn bench_force_push(c: &mut Criterion) {
    let mut group = c.benchmark_group("force_push");
    for add_msgs in [0u32, 5, 32] {
        group.bench_with_input(BenchmarkId::from_parameter(add_msgs), &add_msgs, |b, &add_msgs| {
            let (_buf, queue) = make_queue(add_msgs, 64);
            let mut producer = Producer::new(queue);
            b.iter(|| producer.force_push());
        });
    }
    group.finish();
}

fn bench_push_pop_pair(c: &mut Criterion) {
    c.bench_function("push_then_pop", |b| {
        let (_buf, queue) = make_queue(5, 64);
        let mut producer = Producer::new(queue);
        let mut consumer = Consumer::new(queue);
        b.iter(|| {
            producer.force_push();
            consumer.pop()
        });
    });
}

criterion_group!(benches, bench_force_push, bench_push_pop_pair);
criterion_main!(benches);
