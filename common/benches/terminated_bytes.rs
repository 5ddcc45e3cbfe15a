//! Benchmarks for the escaped, terminated byte-string encoding used in keys.
//!
//! Inputs range from plain ASCII (no escaping) to inputs made entirely of
//! bytes that need escaping, which doubles their encoded size.

use bytes::BytesMut;
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use common::serde::terminated_bytes;

const LENGTHS: &[usize] = &[8, 64, 512];

fn inputs(len: usize) -> Vec<(&'static str, Vec<u8>)> {
    vec![
        ("ascii", vec![b'a'; len]),
        ("mixed", (0..len).map(|i| (i % 4) as u8).collect()),
        ("escaped", vec![0x00; len]),
    ]
}

fn bench_serialize(c: &mut Criterion) {
    let mut group = c.benchmark_group("terminated_bytes/serialize");

    for &len in LENGTHS {
        for (kind, value) in inputs(len) {
            group.throughput(Throughput::Bytes(len as u64));
            group.bench_with_input(
                BenchmarkId::new(kind, len),
                &value,
                |b, value| {
                    let mut buf = BytesMut::with_capacity(len * 2 + 1);
                    b.iter(|| {
                        buf.clear();
                        terminated_bytes::serialize(black_box(value), &mut buf);
                        black_box(&buf);
                    });
                },
            );
        }
    }

    group.finish();
}

fn bench_prefix_upper_bound(c: &mut Criterion) {
    let mut group = c.benchmark_group("terminated_bytes/prefix_upper_bound");

    for &len in LENGTHS {
        let mut encoded = BytesMut::new();
        terminated_bytes::serialize(&vec![b'k'; len], &mut encoded);
        let encoded_bytes = encoded.freeze();

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(
            BenchmarkId::from_parameter(len),
            &encoded_bytes,
            |b, encoded| {
                b.iter(|| black_box(terminated_bytes::prefix_upper_bound(black_box(encoded))));
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_serialize, bench_prefix_upper_bound);
criterion_main!(benches);
