// benches/routing_bench.rs

//! Routing hot-path benchmarks: slot hashing and the hash-tag / vnode-ring
//! lookups a connection handler does for every key-bearing command before
//! it ever reaches the store.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use hypercache::core::cluster::membership::{Node, NodeCapabilities, NodeStatus};
use hypercache::core::cluster::routing::Router;
use hypercache::core::cluster::slot::key_slot;
use std::collections::HashMap;
use std::time::Instant;

fn bench_key_slot(c: &mut Criterion) {
    let mut group = c.benchmark_group("key_slot");
    group.bench_function("plain_key", |b| {
        b.iter(|| key_slot(std::hint::black_box(b"user:1000:profile")))
    });
    group.bench_function("hash_tagged_key", |b| {
        b.iter(|| key_slot(std::hint::black_box(b"{user:1000}:profile")))
    });
    group.finish();
}

fn ring_of(size: usize) -> Router {
    let router = Router::new("n0".to_string());
    let snapshot: HashMap<String, Node> = (0..size)
        .map(|i| {
            let node_id = format!("n{i}");
            (
                node_id.clone(),
                Node {
                    node_id,
                    address: "127.0.0.1".to_string(),
                    gossip_port: 7000 + i as u16,
                    resp_port: 6400 + i as u16,
                    status: NodeStatus::Alive,
                    load: 0.0,
                    last_seen: Instant::now(),
                    capabilities: NodeCapabilities::empty(),
                    metadata: HashMap::new(),
                },
            )
        })
        .collect();
    router.rebuild(&snapshot);
    router
}

fn bench_route(c: &mut Criterion) {
    let mut group = c.benchmark_group("route_single_key");
    for &size in &[3usize, 10, 50] {
        let router = ring_of(size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            let mut i = 0u64;
            b.iter(|| {
                i = i.wrapping_add(1);
                let key = format!("key:{i}");
                router.route(std::hint::black_box(key.as_bytes()))
            })
        });
    }
    group.finish();
}

fn bench_route_for_keys(c: &mut Criterion) {
    let router = ring_of(10);
    let keys: Vec<bytes::Bytes> = (0..8)
        .map(|i| bytes::Bytes::from(format!("{{tag}}:{i}")))
        .collect();
    c.bench_function("route_for_keys_same_tag", |b| {
        b.iter(|| router.route_for_keys(std::hint::black_box(&keys)))
    });
}

criterion_group!(benches, bench_key_slot, bench_route, bench_route_for_keys);
criterion_main!(benches);
