use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;
use vermeer::mempool::{SegmentLayout, TieredPool};
use vermeer::relative_ptr::SegmentRegistry;
use vermeer::PoolEntry;

fn make_pool(entries: &[PoolEntry]) -> (TieredPool, Vec<u64>) {
    let layout = SegmentLayout::compute(entries).unwrap();
    let mut backing = vec![0u64; layout.total_size / 8 + 8];
    let registry = Arc::new(SegmentRegistry::new());
    registry
        .register(1, backing.as_mut_ptr() as *mut u8, layout.total_size)
        .unwrap();
    let pool = unsafe {
        TieredPool::create_in(backing.as_mut_ptr() as *mut u8, 1, entries, registry).unwrap()
    };
    (pool, backing)
}

fn benchmark_loan_release(c: &mut Criterion) {
    let mut group = c.benchmark_group("TieredPool");

    for payload_size in [64usize, 256, 1024, 4096].iter() {
        group.bench_with_input(
            BenchmarkId::new("loan_release", payload_size),
            payload_size,
            |b, &payload_size| {
                let (pool, _backing) = make_pool(&[
                    PoolEntry::new(256, 64),
                    PoolEntry::new(1024, 64),
                    PoolEntry::new(8192, 64),
                ]);

                b.iter(|| {
                    let chunk = pool.loan(payload_size, 8).unwrap();
                    criterion::black_box(&chunk);
                    drop(chunk);
                });
            },
        );
    }

    group.finish();
}

fn benchmark_clone_release(c: &mut Criterion) {
    let mut group = c.benchmark_group("SharedChunk");

    group.bench_function("clone_release", |b| {
        let (pool, _backing) = make_pool(&[PoolEntry::new(256, 8)]);
        let chunk = pool.loan(128, 8).unwrap();

        b.iter(|| {
            let copy = chunk.clone();
            criterion::black_box(&copy);
            drop(copy);
        });
    });

    group.finish();
}

criterion_group!(benches, benchmark_loan_release, benchmark_clone_release);
criterion_main!(benches);
