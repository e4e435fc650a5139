use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;

use fastpool::{Allocator, CacheWarmup};

const OPS: u64 = 100_000;

/// fastpool alloc/free throughput, master lists only.
fn fastpool_malloc_free(pool: &Allocator, size: usize) {
    for _ in 0..OPS {
        let ptr = pool.alloc(size, 16);
        black_box(ptr);
        unsafe { pool.free(ptr) };
    }
}

/// libc alloc/free throughput.
fn libc_malloc_free(size: usize) {
    for _ in 0..OPS {
        unsafe {
            let ptr = libc::malloc(size);
            black_box(ptr);
            libc::free(ptr);
        }
    }
}

fn benchmark_malloc_throughput(c: &mut Criterion) {
    let pool = Allocator::new(64, 4 * 1024 * 1024).unwrap();
    let mut group = c.benchmark_group("malloc_throughput");

    for size in [16, 64, 256, 1024] {
        group.throughput(Throughput::Elements(OPS));

        group.bench_with_input(BenchmarkId::new("fastpool", size), &size, |b, &size| {
            b.iter(|| fastpool_malloc_free(&pool, size))
        });

        group.bench_with_input(BenchmarkId::new("libc", size), &size, |b, &size| {
            b.iter(|| libc_malloc_free(size))
        });
    }

    group.finish();
}

fn benchmark_thread_cache(c: &mut Criterion) {
    let pool = Allocator::new(64, 4 * 1024 * 1024).unwrap();
    pool.create_thread_cache(CacheWarmup::Hot, 64 * 1024);

    let mut group = c.benchmark_group("thread_cache");

    for size in [16, 64, 256] {
        group.throughput(Throughput::Elements(OPS));

        group.bench_with_input(BenchmarkId::new("fastpool_hot", size), &size, |b, &size| {
            b.iter(|| fastpool_malloc_free(&pool, size))
        });
    }

    group.finish();
    pool.destroy_thread_cache();
}

criterion_group!(benches, benchmark_malloc_throughput, benchmark_thread_cache);
criterion_main!(benches);
