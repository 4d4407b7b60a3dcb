//! Session throughput benchmarks
//!
//! Measures the journal-then-index commit path:
//! - single-update sessions (one journal record each)
//! - units of work (begin, N records, end)
//! - committed reads through `Store::read`

use brokerstore_core::{MessageRecord, QueueDescriptor, QueueRecord};
use brokerstore_engine::{Store, StoreConfig};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tempfile::TempDir;

fn open_store(dir: &TempDir) -> Store {
    let config = StoreConfig::for_testing(dir.path()).with_journal_max_file_length(8 * 1024 * 1024);
    Store::open_with(config).unwrap()
}

fn bench_single_update_sessions(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    let mut group = c.benchmark_group("single_update");
    group.throughput(Throughput::Elements(1));
    group.bench_function("map_entry_put", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let key = format!("key_{i}");
            let result = store.execute(|s| s.map_entry_put("bench", &key, b"value".to_vec()), None);
            black_box(result.unwrap());
            i += 1;
        });
    });
    group.finish();
}

fn bench_unit_of_work(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    store
        .execute(|s| s.queue_add(QueueDescriptor::new("Q")), None)
        .unwrap();

    let mut group = c.benchmark_group("unit_of_work");
    for batch in [2usize, 10, 50] {
        group.throughput(Throughput::Elements(batch as u64));
        group.bench_with_input(BenchmarkId::new("enqueue", batch), &batch, |b, &batch| {
            let mut next = 0i64;
            b.iter(|| {
                store
                    .execute(
                        |s| {
                            for _ in 0..batch / 2 {
                                s.message_add(MessageRecord::new(next, format!("m{next}"), vec![0u8; 64]))?;
                                s.queue_add_message("Q", QueueRecord::new(next, next, 64))?;
                                next += 1;
                            }
                            Ok(())
                        },
                        None,
                    )
                    .unwrap();
            });
        });
    }
    group.finish();
}

fn bench_reads(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    store
        .execute(
            |s| {
                for i in 0..1000 {
                    s.map_entry_put("reads", &format!("key_{i:04}"), vec![1u8; 32])?;
                }
                Ok(())
            },
            None,
        )
        .unwrap();

    c.bench_function("map_entry_get", |b| {
        let mut i = 0usize;
        b.iter(|| {
            let key = format!("key_{:04}", i % 1000);
            black_box(store.read(|r| r.map_entry_get("reads", &key)).unwrap());
            i += 1;
        });
    });
}

criterion_group!(
    benches,
    bench_single_update_sessions,
    bench_unit_of_work,
    bench_reads
);
criterion_main!(benches);
