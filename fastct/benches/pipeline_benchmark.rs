//! Benchmarks for the daemon-side per-batch and control paths.
//!
//! These benchmarks measure:
//! - Verdict encoding for an echoed batch
//! - Control command parsing
//! - Rendering a full table dump through the control protocol
//!
//! Run with: cargo bench -p fastct --bench pipeline_benchmark

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use fastct::control::protocol::{render_reply, Command};
use fastct::worker::verdict;
use fastct_core::packet::builder::FrameBuilder;
use fastct_core::{ConnTable, ConntrackConfig, ExecuteOptions, L3Type, ManualClock, Packet};
use std::sync::Arc;

fn populated_table(conns: u16) -> ConnTable {
    let config = ConntrackConfig {
        hash_seed: Some(1),
        ..ConntrackConfig::default()
    };
    let table = ConnTable::new(&config, Arc::new(ManualClock::new(0))).unwrap();
    let mut batch: Vec<Packet> = (0..conns)
        .map(|i| {
            let frame =
                FrameBuilder::udp4([10, 0, (i >> 8) as u8, i as u8], [10, 1, 0, 1], 1024 + i, 53)
                    .build();
            Packet::from_ethernet(frame)
        })
        .collect();
    table.execute(&mut batch, L3Type::Ipv4, &ExecuteOptions::commit(0));
    table
}

/// Benchmark verdict encoding for one echoed batch
fn bench_verdict_encode(c: &mut Criterion) {
    let table = populated_table(32);
    let mut batch: Vec<Packet> = (0..32u16)
        .map(|i| {
            let frame =
                FrameBuilder::udp4([10, 0, 0, i as u8], [10, 1, 0, 1], 1024 + i, 53).build();
            Packet::from_ethernet(frame)
        })
        .collect();
    table.execute(&mut batch, L3Type::Ipv4, &ExecuteOptions::commit(0));

    let mut group = c.benchmark_group("verdict");
    group.throughput(Throughput::Elements(32));
    group.bench_function("encode_32", |b| {
        b.iter(|| {
            batch
                .iter()
                .map(|p| verdict::encode(black_box(&p.md))[0] as usize)
                .sum::<usize>()
        })
    });
    group.finish();
}

/// Benchmark control command parsing
fn bench_command_parse(c: &mut Criterion) {
    c.bench_function("parse_dump_command", |b| {
        b.iter(|| black_box("dump zone=12 verbose stats").parse::<Command>())
    });
}

/// Benchmark rendering a full dump reply
fn bench_dump_render(c: &mut Criterion) {
    let table = populated_table(10_000);
    let cmd: Command = "dump stats".parse().unwrap();

    let mut group = c.benchmark_group("dump");
    group.throughput(Throughput::Elements(10_000));
    group.sample_size(20);
    group.bench_function("render_10k", |b| {
        b.iter(|| render_reply(&cmd.execute(&table).map_err(|e| e.to_string())).len())
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_verdict_encode,
    bench_command_parse,
    bench_dump_render
);
criterion_main!(benches);
