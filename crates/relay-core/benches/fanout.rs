//! Fan-out benchmarks for the Relay hub.
//!
//! These benchmarks measure routing and broadcast cost as the number of
//! receiving sessions grows.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use relay_core::{Hub, MemoryStore, SessionHandle, UserId};
use relay_protocol::{codec, OutgoingFrame, Payload};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use uuid::Uuid;

fn connect(hub: &Hub, user: UserId, sessions: usize) -> Vec<mpsc::Receiver<Payload>> {
    (0..sessions)
        .map(|_| {
            let (handle, rx) = SessionHandle::new(user, 256);
            hub.register(handle);
            rx
        })
        .collect()
}

fn drain(receivers: &mut [mpsc::Receiver<Payload>]) {
    for rx in receivers {
        while rx.try_recv().is_ok() {}
    }
}

/// Benchmark broadcast of a pre-encoded event.
fn bench_broadcast(c: &mut Criterion) {
    let mut group = c.benchmark_group("broadcast");

    for sessions in [1usize, 4, 16] {
        let hub = Hub::new(Arc::new(MemoryStore::new()));
        let (alice, bob) = (UserId::random(), UserId::random());
        let mut receivers = connect(&hub, alice, sessions);
        receivers.extend(connect(&hub, bob, sessions));

        let payload = codec::encode(&OutgoingFrame::message_deleted(Uuid::new_v4())).unwrap();

        group.throughput(Throughput::Elements((sessions * 2) as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(sessions),
            &sessions,
            |b, _| {
                b.iter(|| {
                    let delivered = hub.broadcast_to_users(black_box(&[alice, bob]), &payload);
                    drain(&mut receivers);
                    delivered
                });
            },
        );
    }

    group.finish();
}

/// Benchmark routing a direct message, including the in-memory store write.
fn bench_route(c: &mut Criterion) {
    let mut group = c.benchmark_group("route_direct_message");
    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap();

    for sessions in [1usize, 4, 16] {
        group.throughput(Throughput::Elements(sessions as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(sessions),
            &sessions,
            |b, &sessions| {
                b.iter_custom(|iters| {
                    let hub = Hub::new(Arc::new(MemoryStore::new()));
                    let (alice, bob) = (UserId::random(), UserId::random());
                    let mut receivers = connect(&hub, bob, sessions);
                    let raw = serde_json::json!({
                        "type": "direct_message",
                        "to": bob,
                        "content": "benchmark message",
                    })
                    .to_string();

                    let start = Instant::now();
                    for _ in 0..iters {
                        runtime.block_on(hub.route_direct_message(&alice, raw.as_bytes()));
                        drain(&mut receivers);
                    }
                    start.elapsed()
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_broadcast, bench_route);
criterion_main!(benches);
