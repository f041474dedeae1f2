//! Benchmarks for the send-path hot spots: ack collapsing, work-request
//! id encoding and the ring contiguity predicate.

use std::hint::black_box;

use criterion::{Criterion, criterion_group, criterion_main};

use dualring::{AckRing, is_contiguous};
use tsbuild::transport::{RequestKind, encode_wr_id, wr_id_connection, wr_id_timeslice};

fn bench_ack_ring(c: &mut Criterion) {
    c.bench_function("ack_ring_in_order", |b| {
        b.iter(|| {
            let mut ack = AckRing::with_capacity(1024);
            for ts in 0..1024u64 {
                ack.mark(black_box(ts));
            }
            black_box(ack.low_water())
        })
    });

    c.bench_function("ack_ring_out_of_order", |b| {
        b.iter(|| {
            let mut ack = AckRing::with_capacity(1024);
            // pairwise swapped completion order
            for pair in 0..512u64 {
                ack.mark(black_box(pair * 2 + 1));
                ack.mark(black_box(pair * 2));
            }
            black_box(ack.low_water())
        })
    });
}

fn bench_wr_id_codec(c: &mut Criterion) {
    c.bench_function("wr_id_roundtrip", |b| {
        b.iter(|| {
            let mut sum = 0u64;
            for ts in 0..1000u64 {
                let wr_id = encode_wr_id(RequestKind::WriteDesc, 3, black_box(ts));
                sum += wr_id_timeslice(wr_id) + wr_id_connection(wr_id) as u64;
            }
            black_box(sum)
        })
    });
}

fn bench_contiguity(c: &mut Criterion) {
    c.bench_function("ring_contiguity", |b| {
        b.iter(|| {
            let mut wraps = 0u32;
            for offset in (0..(1u64 << 20)).step_by(4096) {
                if !is_contiguous(black_box(offset), 10_100, (1 << 16) - 1) {
                    wraps += 1;
                }
            }
            black_box(wraps)
        })
    });
}

criterion_group!(benches, bench_ack_ring, bench_wr_id_codec, bench_contiguity);
criterion_main!(benches);
