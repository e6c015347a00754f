use std::hint::black_box;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion};
use serde_json::{json, Value};
use tabletop_sync::{
    chunk_batch, find_deletions, flatten, unflatten, DeltaBatch, Dispatcher, FlatMap,
    LocalMirror, MemoryStore, QueueConfig, RemoteStore,
};

/// A world with `count` pieces of two faces each.
fn world(count: usize) -> Value {
    let pieces: serde_json::Map<String, Value> = (0..count)
        .map(|i| {
            (
                i.to_string(),
                json!({
                    "faces": [format!("https://example.org/{i}/front.png"),
                              format!("https://example.org/{i}/back.png")],
                    "x": i * 10,
                    "y": 20.5,
                    "orientation": 90,
                    "lock": 0,
                }),
            )
        })
        .collect();
    json!({ "__new": 1, "pieces": pieces })
}

fn bench_flatten_piece(c: &mut Criterion) {
    let piece = json!({"pieces": {"3": {"x": 10, "y": 20, "faces": ["a.png"], "client": "me"}}});

    c.bench_function("flatten_single_piece", |b| {
        b.iter(|| black_box(flatten(black_box(&piece))))
    });
}

fn bench_flatten_world_1000(c: &mut Criterion) {
    let world = world(1000);

    c.bench_function("flatten_world_1000_pieces", |b| {
        b.iter(|| black_box(flatten(black_box(&world))))
    });
}

fn bench_unflatten_world_1000(c: &mut Criterion) {
    let flat = flatten(&world(1000));

    c.bench_function("unflatten_world_1000_pieces", |b| {
        b.iter(|| black_box(unflatten(black_box(&flat))))
    });
}

fn bench_find_deletions(c: &mut Criterion) {
    let mirror = LocalMirror::from_snapshot(flatten(&world(1000)));
    let mut update = FlatMap::new();
    for i in (0..1000).step_by(10) {
        update.insert(format!("pieces|{i}"), "_NULL_".to_string());
    }

    c.bench_function("find_deletions_100_of_1000", |b| {
        b.iter(|| black_box(find_deletions(black_box(&update), &mirror)))
    });
}

fn bench_chunk_large_batch(c: &mut Criterion) {
    let batch = DeltaBatch::new(flatten(&world(50)), Vec::new());
    let config = QueueConfig::default();

    c.bench_function("chunk_batch_50_pieces", |b| {
        b.iter(|| black_box(chunk_batch(black_box(batch.clone()), &config).unwrap()))
    });
}

fn bench_dispatch_snapshot(c: &mut Criterion) {
    let decoded = unflatten(&flatten(&world(1000))).value;

    c.bench_function("dispatch_reset_1000_pieces", |b| {
        b.iter(|| {
            let mut dispatcher = Dispatcher::new();
            black_box(dispatcher.execute_world_update(black_box(&decoded)));
        })
    });
}

fn bench_store_fanout(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let update = flatten(&json!({"pieces": {"0": {"x": 1, "y": 2, "client": "me"}}}));

    c.bench_function("memory_store_submit_100_subscribers", |b| {
        b.iter(|| {
            rt.block_on(async {
                let store = Arc::new(MemoryStore::new(64));
                let receivers: Vec<_> = (0..100).map(|_| store.subscribe()).collect();
                store.submit_delta(black_box(update.clone()), Vec::new()).unwrap();
                black_box(receivers);
            });
        })
    });
}

criterion_group!(
    benches,
    bench_flatten_piece,
    bench_flatten_world_1000,
    bench_unflatten_world_1000,
    bench_find_deletions,
    bench_chunk_large_batch,
    bench_dispatch_snapshot,
    bench_store_fanout,
);
criterion_main!(benches);
