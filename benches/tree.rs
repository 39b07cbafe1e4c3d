// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Benchmarks for supervision tree loading, insertion and snapshot I/O.
//!
//! Run with: `cargo bench --bench tree`

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::{json, Value};
use std::hint::black_box;
use tempfile::TempDir;

use swarmer::tree::{AgentNode, LoadPolicy, SupervisionTree};

/// Root with `fanout` supervisors, each owning `fanout` workers.
fn directive(fanout: usize) -> Value {
    let children: Vec<Value> = (0..fanout)
        .map(|i| {
            let workers: Vec<Value> = (0..fanout)
                .map(|j| json!({ "id": format!("worker-{}-{}", i, j), "type": "redis_watchdog" }))
                .collect();
            json!({ "id": format!("sup-{}", i), "type": "supervisor", "children": workers })
        })
        .collect();
    json!({ "id": "matrix", "type": "orchestrator", "children": children })
}

fn bench_load(c: &mut Criterion) {
    let mut group = c.benchmark_group("tree_load");

    for fanout in [4usize, 16, 32] {
        let value = directive(fanout);
        group.throughput(Throughput::Elements((1 + fanout + fanout * fanout) as u64));
        group.bench_with_input(BenchmarkId::new("lenient", fanout), &value, |b, value| {
            b.iter(|| SupervisionTree::load(black_box(value.clone()), LoadPolicy::Lenient));
        });
    }

    // Half the workers are clones that the pre-scan must strip.
    let mut noisy = directive(16);
    if let Some(children) = noisy["children"].as_array_mut() {
        let clones: Vec<Value> = children.iter().take(8).cloned().collect();
        children.extend(clones);
    }
    group.bench_function("with_duplicates", |b| {
        b.iter(|| SupervisionTree::load(black_box(noisy.clone()), LoadPolicy::Lenient));
    });

    group.finish();
}

fn bench_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("tree_insert");
    let (base, _) = SupervisionTree::load(directive(16), LoadPolicy::Lenient).unwrap();

    group.bench_function("insert_leaf", |b| {
        b.iter(|| {
            let mut tree = base.clone();
            tree.insert(black_box(AgentNode::new("fresh", "probe")), "sup-3")
        });
    });

    group.bench_function("reject_collision", |b| {
        let colliding = AgentNode::new("fresh", "supervisor")
            .with_child(AgentNode::new("worker-2-2", "redis_watchdog"));
        b.iter(|| {
            let mut tree = base.clone();
            tree.insert(black_box(colliding.clone()), "matrix")
        });
    });

    group.bench_function("cascade", |b| {
        b.iter(|| base.cascade(black_box("sup-7")));
    });

    group.finish();
}

fn bench_snapshot(c: &mut Criterion) {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("agent_tree_master.json");
    let (tree, _) = SupervisionTree::load(directive(16), LoadPolicy::Lenient).unwrap();
    tree.save(&path).unwrap();

    let mut group = c.benchmark_group("tree_snapshot");
    group.bench_function("save_atomic", |b| {
        b.iter(|| tree.save(black_box(&path)));
    });
    group.bench_function("load_file", |b| {
        b.iter(|| SupervisionTree::load_file(black_box(&path), LoadPolicy::Lenient));
    });
    group.finish();
}

criterion_group!(benches, bench_load, bench_insert, bench_snapshot);

criterion_main!(benches);
