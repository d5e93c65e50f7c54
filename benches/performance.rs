//! Performance benchmarks for the tabular store.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use tessera::{MergeableStore, Store};

/// Benchmark transaction commit with varying write counts
fn bench_transaction_commit(c: &mut Criterion) {
    let mut group = c.benchmark_group("transaction_commit");

    for writes in [1u64, 10, 100, 1000] {
        group.bench_with_input(BenchmarkId::new("writes", writes), &writes, |b, &writes| {
            let mut store = Store::new();
            let mut tick = 0u64;
            b.iter(|| {
                tick += 1;
                store.transaction(|s| {
                    for i in 0..writes {
                        s.set_cell("bench", &i.to_string(), "n", (tick + i) as i64);
                    }
                });
            });
        });
    }

    group.finish();
}

/// Benchmark broadcast with varying listener counts
fn bench_listener_broadcast(c: &mut Criterion) {
    let mut group = c.benchmark_group("listener_broadcast");

    for listeners in [1, 10, 100] {
        group.bench_with_input(
            BenchmarkId::new("listeners", listeners),
            &listeners,
            |b, &listeners| {
                let mut store = Store::new();
                for _ in 0..listeners {
                    store.add_cell_listener(None, None, None, |_, _, _, _, _, _| {}, false);
                }
                let mut tick = 0i64;
                b.iter(|| {
                    tick += 1;
                    store.set_cell("bench", "row", "n", tick);
                });
            },
        );
    }

    group.finish();
}

/// Benchmark single-leaf restamping against growing table sizes; the
/// incremental hash path should stay flat
fn bench_mergeable_restamp(c: &mut Criterion) {
    let mut group = c.benchmark_group("mergeable_restamp");

    for rows in [10, 100, 1000] {
        group.bench_with_input(BenchmarkId::new("rows", rows), &rows, |b, &rows| {
            let mut store = MergeableStore::with_id(format!("bench-{}", rows));
            store.transaction(|s| {
                for i in 0..rows {
                    s.set_cell("big", &i.to_string(), "n", i as i64);
                }
            });
            let mut tick = 0i64;
            b.iter(|| {
                tick += 1;
                store.set_cell("big", "0", "n", black_box(tick));
            });
        });
    }

    group.finish();
}

/// Benchmark full bilateral merge of two diverged stores
fn bench_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge");

    for cells in [10, 100] {
        group.bench_with_input(BenchmarkId::new("cells", cells), &cells, |b, &cells| {
            b.iter(|| {
                let mut a = MergeableStore::with_id("bench-a");
                let mut x = MergeableStore::with_id("bench-x");
                for i in 0..cells {
                    a.set_cell("left", &i.to_string(), "n", i as i64);
                    x.set_cell("right", &i.to_string(), "n", i as i64);
                }
                a.merge(&mut x);
                black_box(a.get_mergeable_content_hashes());
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_transaction_commit,
    bench_listener_broadcast,
    bench_mergeable_restamp,
    bench_merge
);
criterion_main!(benches);
