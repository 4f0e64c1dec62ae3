//! Benchmarks for the mutation pipeline and structural diffing.
//!
//! Run with: cargo bench -p keel-runtime --bench pipeline_bench

use std::hint::black_box;
use std::rc::Rc;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use keel_runtime::{PersistTo, StoreConfig, StoreContext, TracingPlugin};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Board {
    title: String,
    cards: Vec<u64>,
}

fn board(len: usize) -> Board {
    Board {
        title: "board".into(),
        cards: (0..len as u64).collect(),
    }
}

/// Nested object with `width` keys per level, `depth` levels deep.
fn tree(width: usize, depth: usize, seed: u64) -> Value {
    if depth == 0 {
        return json!(seed);
    }
    let map = (0..width)
        .map(|i| (format!("k{i}"), tree(width, depth - 1, seed + i as u64)))
        .collect::<serde_json::Map<_, _>>();
    Value::Object(map)
}

fn bench_mutate(c: &mut Criterion) {
    let mut group = c.benchmark_group("pipeline/mutate");

    for len in [16_usize, 256, 4096] {
        group.throughput(Throughput::Elements(1));

        let ctx = StoreContext::new();
        let bare = ctx
            .create_store(StoreConfig::new(format!("bare-{len}")), move || board(len))
            .unwrap();
        group.bench_with_input(BenchmarkId::new("bare", len), &len, |b, _| {
            b.iter(|| black_box(bare.patch("push", |s| s.cards[0] += 1).unwrap()))
        });

        let full = ctx
            .create_store(
                StoreConfig::<Board>::new(format!("full-{len}"))
                    .persist_to(PersistTo::Session)
                    .plugin(Rc::new(TracingPlugin))
                    .enable_recording(true),
                move || board(len),
            )
            .unwrap();
        group.bench_with_input(BenchmarkId::new("persist_record_plugin", len), &len, |b, _| {
            b.iter(|| black_box(full.patch("push", |s| s.cards[0] += 1).unwrap()))
        });

        group.bench_with_input(BenchmarkId::new("dedup", len), &len, |b, _| {
            b.iter(|| black_box(bare.patch("noop", |_| {}).unwrap()))
        });
    }

    group.finish();
}

fn bench_diff(c: &mut Criterion) {
    let mut group = c.benchmark_group("diff/tree");

    for (width, depth) in [(4_usize, 3_usize), (8, 3), (4, 5)] {
        let prev = tree(width, depth, 0);
        let same = prev.clone();
        let next = tree(width, depth, 1);
        let label = format!("{width}x{depth}");
        group.bench_with_input(BenchmarkId::new("identical", &label), &(), |b, _| {
            b.iter(|| black_box(keel_core::diff(&prev, &same)))
        });
        group.bench_with_input(BenchmarkId::new("all_changed", &label), &(), |b, _| {
            b.iter(|| black_box(keel_core::diff(&prev, &next)))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_mutate, bench_diff);
criterion_main!(benches);
