//! Benchmarks for tsdbe storage operations
//!
//! Run with: cargo bench

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use std::thread;
use std::time::Duration;
use tsdbe::{DataPoint, Row, StorageBuilder, TimestampPrecision};

fn metric_rows(metric: &str, start: i64, count: usize) -> Vec<Row> {
    (0..count)
        .map(|i| Row::new(metric, DataPoint::new(start + i as i64, i as f64)))
        .collect()
}

/// Benchmark storage insertions
fn bench_insert_rows(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert_rows");

    for size in [1, 10, 100, 1000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let storage = StorageBuilder::new()
                .with_timestamp_precision(TimestampPrecision::Seconds)
                .build()
                .unwrap();
            let rows = metric_rows("bench_metric", 1600000000, size);

            b.iter(|| {
                storage.insert_rows(black_box(&rows)).unwrap();
            });
        });
    }

    group.finish();
}

/// Benchmark selecting across many rotated partitions
fn bench_select_across_partitions(c: &mut Criterion) {
    let mut group = c.benchmark_group("select_across_partitions");

    for partitions in [1i64, 10, 100].iter() {
        let storage = StorageBuilder::new()
            .with_partition_duration(Duration::from_millis(1000))
            .build()
            .unwrap();
        // 1001 points span exactly one partition duration and seal the head.
        for p in 0..*partitions {
            storage
                .insert_rows(&metric_rows("cpu", p * 1001, 1001))
                .unwrap();
        }
        let end = partitions * 1001;

        group.bench_with_input(
            BenchmarkId::from_parameter(partitions),
            &end,
            |b, &end| {
                b.iter(|| {
                    black_box(storage.select_rows("cpu", 0, end));
                });
            },
        );
    }

    group.finish();
}

/// Benchmark concurrent insertions
fn bench_concurrent_insertions(c: &mut Criterion) {
    c.bench_function("concurrent_insert_10_threads", |b| {
        b.iter(|| {
            let storage = StorageBuilder::new()
                .with_timestamp_precision(TimestampPrecision::Seconds)
                .build()
                .unwrap();

            let mut handles = vec![];
            for thread_id in 0..10 {
                let storage = storage.clone();
                handles.push(thread::spawn(move || {
                    for i in 0..100 {
                        let row = Row::new(
                            "concurrent",
                            DataPoint::new(1600000000 + (thread_id * 100 + i) as i64, i as f64),
                        );
                        storage.insert_rows(&[row]).unwrap();
                    }
                }));
            }

            for handle in handles {
                handle.join().unwrap();
            }
        });
    });
}

/// Benchmark a flush pass that persists one ready partition
fn bench_flush(c: &mut Criterion) {
    c.bench_function("flush_ready_partition", |b| {
        b.iter_with_setup(
            || {
                let temp_dir = tempfile::tempdir().unwrap();
                let storage = StorageBuilder::new()
                    .with_data_path(temp_dir.path())
                    .with_partition_duration(Duration::from_millis(1000))
                    .build()
                    .unwrap();
                storage
                    .insert_rows(&metric_rows("flush_metric", 0, 1001))
                    .unwrap();
                (temp_dir, storage)
            },
            |(_temp_dir, storage)| {
                storage.flush_rows().unwrap();
            },
        );
    });
}

/// Benchmark memory vs WAL-backed storage
fn bench_storage_modes(c: &mut Criterion) {
    let mut group = c.benchmark_group("storage_modes");
    let rows = metric_rows("mode_metric", 1600000000, 100);

    group.bench_function("in_memory", |b| {
        let storage = StorageBuilder::new().build().unwrap();
        b.iter(|| {
            storage.insert_rows(black_box(rows.as_slice())).unwrap();
        });
    });

    group.bench_function("persistent", |b| {
        let temp_dir = tempfile::tempdir().unwrap();
        let storage = StorageBuilder::new()
            .with_data_path(temp_dir.path())
            .build()
            .unwrap();
        b.iter(|| {
            storage.insert_rows(black_box(rows.as_slice())).unwrap();
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_insert_rows,
    bench_select_across_partitions,
    bench_concurrent_insertions,
    bench_flush,
    bench_storage_modes
);

criterion_main!(benches);
