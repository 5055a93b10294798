use chrono::{Duration as ChronoDuration, Utc};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use orchestrator_core::dedup::{fingerprint, DedupCache};
use uuid::Uuid;

fn bench_fingerprint(c: &mut Criterion) {
    let mut group = c.benchmark_group("fingerprint");
    for size in [32usize, 512, 4096] {
        let body = vec![b'a'; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &body, |b, body| {
            b.iter(|| fingerprint(black_box("download"), black_box(body)))
        });
    }
    group.finish();
}

fn bench_check_and_insert_unique(c: &mut Criterion) {
    let cache = DedupCache::new(10_000, ChronoDuration::seconds(3600));
    let now = Utc::now();

    c.bench_function("check_and_insert_unique", |b| {
        b.iter(|| {
            let key = Uuid::new_v4().to_string();
            black_box(cache.check_and_insert(black_box(&key), now))
        })
    });
}

fn bench_check_and_insert_repeat(c: &mut Criterion) {
    let cache = DedupCache::new(10_000, ChronoDuration::seconds(3600));
    let now = Utc::now();
    cache.check_and_insert("repeat-me", now);

    c.bench_function("check_and_insert_repeat", |b| {
        b.iter(|| black_box(cache.check_and_insert(black_box("repeat-me"), now)))
    });
}

fn bench_check_and_insert_at_capacity(c: &mut Criterion) {
    let mut group = c.benchmark_group("check_and_insert_at_capacity");
    for capacity in [64usize, 1024, 8192] {
        let cache = DedupCache::new(capacity, ChronoDuration::seconds(3600));
        let now = Utc::now();
        for i in 0..capacity {
            cache.check_and_insert(&format!("seed-{i}"), now);
        }

        group.bench_with_input(BenchmarkId::from_parameter(capacity), &capacity, |b, _| {
            b.iter(|| {
                let key = Uuid::new_v4().to_string();
                black_box(cache.check_and_insert(black_box(&key), now))
            })
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_fingerprint,
    bench_check_and_insert_unique,
    bench_check_and_insert_repeat,
    bench_check_and_insert_at_capacity
);
criterion_main!(benches);
