//! Benchmarks for checkpoint backends
//!
//! Run with: cargo bench --package spraid-storage --bench storage

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use spraid_core::{RaidGroupId, RebuildCheckpoint, DEFAULT_CHUNK_SIZE_BLOCKS};
use spraid_storage::{CheckpointBackend, MemoryBackend, PersistedRaidGroup, SledBackend};
use tempfile::TempDir;

const EXTENT: u64 = 0x100_0000;

/// Benchmark per-chunk checkpoint updates (the rebuild hot path)
fn bench_update_position(c: &mut Criterion) {
    let temp_dir = TempDir::new().unwrap();
    let sled = SledBackend::open(temp_dir.path()).unwrap();
    let memory = MemoryBackend::new();

    let mut group = c.benchmark_group("update_position");

    for width in [3usize, 6, 16] {
        let rg = RaidGroupId(width as u32);
        sled.ensure(PersistedRaidGroup::new(rg, EXTENT, width)).unwrap();
        memory.ensure(PersistedRaidGroup::new(rg, EXTENT, width)).unwrap();

        group.bench_with_input(BenchmarkId::new("sled", width), &rg, |b, rg| {
            let mut lba = 0u64;
            b.iter(|| {
                lba = (lba + DEFAULT_CHUNK_SIZE_BLOCKS) % EXTENT;
                sled.update_position(*rg, 0, black_box(RebuildCheckpoint::new(lba)), true, 1)
                    .unwrap()
            })
        });

        group.bench_with_input(BenchmarkId::new("memory", width), &rg, |b, rg| {
            let mut lba = 0u64;
            b.iter(|| {
                lba = (lba + DEFAULT_CHUNK_SIZE_BLOCKS) % EXTENT;
                memory
                    .update_position(*rg, 0, black_box(RebuildCheckpoint::new(lba)), true, 1)
                    .unwrap()
            })
        });
    }

    group.finish();
}

/// Benchmark record loads (recovery path)
fn bench_load(c: &mut Criterion) {
    let temp_dir = TempDir::new().unwrap();
    let sled = SledBackend::open(temp_dir.path()).unwrap();
    for id in 0..64u32 {
        sled.ensure(PersistedRaidGroup::new(RaidGroupId(id), EXTENT, 16))
            .unwrap();
    }

    c.bench_function("sled_load_record", |b| {
        let mut id = 0u32;
        b.iter(|| {
            id = (id + 1) % 64;
            sled.load(black_box(RaidGroupId(id))).unwrap()
        })
    });
}

criterion_group!(benches, bench_update_position, bench_load);
criterion_main!(benches);
