//! Benchmarks for the name-similarity search.
//!
//! `best_identity` is a full scan over every variant in the registry, so its
//! cost grows with registry size; these numbers track that growth.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::hint::black_box;
use std::time::Duration;

use canondir::similarity::{compare_names, suggest_homes, SimilarityPolicy};
use canondir::linkage::LinkagePipeline;
use canondir::source::FieldNameExtractor;
use canondir::test_support::{generate_records, generate_registry};

fn bench_compare_names(c: &mut Criterion) {
    let mut group = c.benchmark_group("compare_names");
    group.bench_function("near_pair", |b| {
        b.iter(|| compare_names(black_box("JOHN Q SMITH JR"), black_box("SMITH, JOHN")))
    });
    group.finish();
}

fn bench_best_identity(c: &mut Criterion) {
    let mut group = c.benchmark_group("best_identity");
    group.sample_size(30);
    group.warm_up_time(Duration::from_millis(500));
    let policy = SimilarityPolicy::default();

    for &count in &[100usize, 1_000, 10_000] {
        let registry = generate_registry(count, 0.3, 42);
        group.throughput(Throughput::Elements(registry.alias_count() as u64));
        group.bench_with_input(BenchmarkId::new("scan", count), &registry, |b, registry| {
            b.iter(|| policy.best_identity(registry, black_box("Mary Jones 00042")))
        });
    }
    group.finish();
}

fn bench_suggest_homes(c: &mut Criterion) {
    let mut group = c.benchmark_group("suggest_homes");
    group.sample_size(20);
    let registry = generate_registry(2_000, 0.5, 7);
    group.bench_function("edit_distance_2000", |b| {
        b.iter(|| suggest_homes(&registry, black_box("Robrt Wilson 00100"), &[], 5))
    });
    group.finish();
}

fn bench_linkage(c: &mut Criterion) {
    let mut group = c.benchmark_group("linkage");
    group.sample_size(10);
    let sources = generate_records(1_000, 0.2, 1);
    let targets = generate_records(1_000, 0.2, 2);
    let extractor = FieldNameExtractor::default();
    group.throughput(Throughput::Elements(sources.len() as u64));
    group.bench_function("run_1000x1000", |b| {
        b.iter(|| {
            LinkagePipeline::new(&extractor, SimilarityPolicy::default()).run(black_box(&sources), black_box(&targets))
        })
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_compare_names,
    bench_best_identity,
    bench_suggest_homes,
    bench_linkage
);
criterion_main!(benches);
