#![allow(clippy::expect_used, clippy::unwrap_used, missing_docs)]
//! Benchmark for the host reference multiplication and verification.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use matmul_validator::prelude::*;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::hint::black_box;

fn inputs(size: usize) -> (MatrixDims, HostBuffers) {
    let dims = MatrixDims::new(size, size, size).unwrap();
    let mut host = HostBuffers::allocate(dims, 64).unwrap();
    host.fill_random(&mut StdRng::seed_from_u64(1));
    (dims, host)
}

fn reference_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("reference_matmul");

    for size in [16, 64, 128, 256] {
        let (dims, mut host) = inputs(size);

        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| {
                let (lhs, rhs) = (black_box(host.a.as_slice()), black_box(host.b.as_slice()));
                reference_matmul(lhs, rhs, &mut host.c_accel, dims).unwrap();
            });
        });
    }

    group.finish();
}

fn verify_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("verify");

    for size in [64, 256, 1024] {
        let dims = MatrixDims::new(size, size, 1).unwrap();
        let reference: Vec<Element> = (0..dims.c_len()).map(|i| (i % 97) as Element).collect();
        let actual = reference.clone();

        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| verify(black_box(&reference), black_box(&actual), dims, TOLERANCE).unwrap());
        });
    }

    group.finish();
}

criterion_group!(benches, reference_benchmark, verify_benchmark);
criterion_main!(benches);
