//! Performance benchmarks for the FastDFS protocol hot path
//!
//! These benchmarks measure the codec operations every request passes
//! through: header encode/decode, metadata encoding, filename stem packing
//! and binlog record formatting.
//!
//! Run benchmarks with:
//! ```bash
//! cargo bench
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::collections::HashMap;

use fastdfs::protocol;
use fastdfs::storage::{BinlogOp, BinlogRecord};

/// Benchmark header encoding and decoding
///
/// The 10-byte header is produced and parsed for every frame in the system,
/// so this is the hottest codec path of all three roles.
fn bench_header(c: &mut Criterion) {
    c.bench_function("encode_header", |b| {
        b.iter(|| protocol::encode_header(black_box(1024), black_box(11), black_box(0)));
    });

    let encoded = protocol::encode_header(1024, 11, 0);
    c.bench_function("decode_header", |b| {
        b.iter(|| protocol::decode_header(black_box(&encoded)).unwrap());
    });
}

/// Benchmark metadata encoding at growing map sizes
fn bench_metadata(c: &mut Criterion) {
    let mut group = c.benchmark_group("metadata");
    for size in [1usize, 8, 64] {
        let mut metadata = HashMap::new();
        for i in 0..size {
            metadata.insert(format!("key-{}", i), format!("value-{}", i));
        }
        group.bench_with_input(BenchmarkId::new("encode", size), &metadata, |b, m| {
            b.iter(|| protocol::encode_metadata(black_box(m)));
        });
        let encoded = protocol::encode_metadata(&metadata);
        group.bench_with_input(BenchmarkId::new("decode", size), &encoded, |b, e| {
            b.iter(|| protocol::decode_metadata(black_box(e)).unwrap());
        });
    }
    group.finish();
}

/// Benchmark the filename stem contract
///
/// Every upload packs creation facts into the stem, and routing decisions
/// unpack them again.
fn bench_file_meta(c: &mut Criterion) {
    c.bench_function("encode_file_meta", |b| {
        b.iter(|| {
            protocol::encode_file_meta(
                black_box("192.168.1.10"),
                black_box(1700000000),
                black_box(4096),
                black_box(7),
                black_box(0xCAFE),
                black_box(false),
            )
        });
    });

    let stem = protocol::encode_file_meta("192.168.1.10", 1700000000, 4096, 7, 0xCAFE, false);
    let remote = format!("M00/1a/2b/{}.jpg", stem);
    c.bench_function("decode_file_meta", |b| {
        b.iter(|| protocol::decode_file_meta(black_box(&remote)).unwrap());
    });
}

/// Benchmark binlog record formatting and parsing
///
/// The storage write path formats one line per mutation; every per-peer
/// sender parses them back while tailing.
fn bench_binlog_record(c: &mut Criterion) {
    let record = BinlogRecord {
        timestamp: 1700000000,
        op: BinlogOp::Create,
        source_id: "192.168.1.10".to_string(),
        filename: "M00/1a/2b/wKgBClkT2pVAYWZhAAAADDbnJyc866.jpg".to_string(),
    };

    c.bench_function("binlog_format_line", |b| {
        b.iter(|| black_box(&record).format_line());
    });

    let line = record.format_line();
    c.bench_function("binlog_parse_line", |b| {
        b.iter(|| BinlogRecord::parse_line(black_box(&line)).unwrap());
    });
}

/// Benchmark file ID splitting
fn bench_file_id(c: &mut Criterion) {
    let file_id = "group1/M00/1a/2b/wKgBClkT2pVAYWZhAAAADDbnJyc866.jpg";
    c.bench_function("split_file_id", |b| {
        b.iter(|| protocol::split_file_id(black_box(file_id)).unwrap());
    });
}

criterion_group!(
    benches,
    bench_header,
    bench_metadata,
    bench_file_meta,
    bench_binlog_record,
    bench_file_id
);
criterion_main!(benches);
