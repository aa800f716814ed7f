use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tempfile::TempDir;
use tokio::runtime::Runtime;

use relkv::backend::BackendConfig;
use relkv::{prefix_pattern, Dialect, NewRevision, ReadMode, SqlLog, StoreConfig};

fn open_store(rt: &Runtime, dir: &TempDir, read_mode: ReadMode) -> Arc<SqlLog> {
    let config = StoreConfig {
        backend: BackendConfig {
            dialect: Dialect::Sqlite,
            endpoint: dir.path().join("bench.db").display().to_string(),
            busy_timeout: Duration::from_secs(5),
        },
        read_mode,
        operation_timeout: None,
    };
    Arc::new(rt.block_on(SqlLog::open(config)).unwrap())
}

fn seed(rt: &Runtime, store: &SqlLog, keys: usize) {
    rt.block_on(async {
        for i in 0..keys {
            store
                .insert(&NewRevision::create(
                    format!("/registry/items/{:06}", i),
                    b"value".to_vec(),
                    0,
                    0,
                ))
                .await
                .unwrap();
        }
    });
}

// ============================================================================
// Benchmark: Insert Operations
// ============================================================================

fn bench_insert(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("insert_operations");
    group.sample_size(50);
    group.measurement_time(Duration::from_secs(10));

    for read_mode in [ReadMode::Log, ReadMode::Projection] {
        let dir = TempDir::new().unwrap();
        let store = open_store(&rt, &dir, read_mode);
        let counter = AtomicI64::new(0);
        let (store, counter) = (&store, &counter);

        group.bench_function(BenchmarkId::new("create", read_mode), |b| {
            b.to_async(&rt).iter(|| async move {
                let n = counter.fetch_add(1, Ordering::Relaxed);
                store
                    .insert(&NewRevision::create(
                        format!("/bench/key{}", n),
                        black_box(b"value".to_vec()),
                        0,
                        0,
                    ))
                    .await
                    .unwrap()
            })
        });
    }

    // Insert with varying value sizes
    let dir = TempDir::new().unwrap();
    let store = open_store(&rt, &dir, ReadMode::Log);
    let counter = AtomicI64::new(0);
    let (store, counter) = (&store, &counter);
    for size in [100usize, 1000, 10000] {
        group.throughput(Throughput::Bytes(size as u64));
        let value = black_box(vec![b'x'; size]);
        let value = &value;
        group.bench_with_input(BenchmarkId::new("value_size", size), &size, |b, _| {
            b.to_async(&rt).iter(|| async move {
                let n = counter.fetch_add(1, Ordering::Relaxed);
                store
                    .insert(&NewRevision::create(
                        format!("/sized/key{}", n),
                        value.clone(),
                        0,
                        0,
                    ))
                    .await
                    .unwrap()
            })
        });
    }

    group.finish();
}

// ============================================================================
// Benchmark: Listing Operations
// ============================================================================

fn bench_list(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("list_operations");
    group.sample_size(50);
    group.measurement_time(Duration::from_secs(10));

    let pattern = prefix_pattern("/registry/items/");
    for read_mode in [ReadMode::Log, ReadMode::Projection] {
        let dir = TempDir::new().unwrap();
        let store = open_store(&rt, &dir, read_mode);
        seed(&rt, &store, 1000);
        let (store, pattern) = (&store, &pattern);

        for limit in [10i64, 100, 1000] {
            group.throughput(Throughput::Elements(limit as u64));
            group.bench_with_input(
                BenchmarkId::new(format!("current_{}", read_mode), limit),
                &limit,
                |b, &limit| {
                    b.to_async(&rt).iter(|| async move {
                        store.current(pattern, false, Some(limit)).await.unwrap()
                    })
                },
            );
        }

        group.bench_function(BenchmarkId::new("count", read_mode), |b| {
            b.to_async(&rt)
                .iter(|| async move { store.count(pattern, false).await.unwrap() })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_insert, bench_list);
criterion_main!(benches);
