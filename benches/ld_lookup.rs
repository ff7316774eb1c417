// ========================================================================================
//
//                     TRIOGEN LD MATRIX LOOKUP BENCHMARK
//
// ========================================================================================
//
// Measures point lookups against one memory-mapped LD matrix, single-threaded and from
// a rayon pool hammering the same reader.
//
// ========================================================================================

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use std::sync::Arc;
use tempfile::TempDir;
use triogen::{LdMatrixReader, LdMatrixWriter, VariantRegistry};

// --- Benchmark Tuning Parameters ---

/// Variants in the synthetic matrix.
const NUM_VARIANTS: u32 = 20_000;
/// Lookups per measured iteration.
const LOOKUPS: usize = 1_000;
/// Partners per block.
const PARTNER_COUNTS: [u32; 3] = [10, 100, 1_000];

fn build_matrix(dir: &TempDir, partners_per_block: u32) -> LdMatrixReader {
    let path = dir.path().join(format!("bench_{partners_per_block}.tld"));
    let registry = Arc::new(VariantRegistry::new());
    for i in 0..NUM_VARIANTS {
        registry.ordinal(&format!("var_{i}"), None).unwrap();
    }

    let mut rng = StdRng::seed_from_u64(u64::from(partners_per_block));
    let mut writer = LdMatrixWriter::create(&path, Arc::clone(&registry)).unwrap();
    for source in 0..NUM_VARIANTS {
        let partners: Vec<u32> = (1..=partners_per_block)
            .map(|offset| (source + offset) % NUM_VARIANTS)
            .collect();
        let r2: Vec<f64> = partners.iter().map(|_| rng.gen_range(0.0..1.0)).collect();
        writer.add_block(source, &partners, &r2).unwrap();
    }
    writer.close().unwrap();
    LdMatrixReader::open(&path).unwrap()
}

fn bench_lookups(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let mut group = c.benchmark_group("get_r2");
    group.throughput(Throughput::Elements(LOOKUPS as u64));

    for partners in PARTNER_COUNTS {
        let reader = build_matrix(&dir, partners);
        let mut rng = StdRng::seed_from_u64(42);
        let ids: Vec<String> = (0..LOOKUPS)
            .map(|_| format!("var_{}", rng.gen_range(0..NUM_VARIANTS)))
            .collect();

        group.bench_with_input(BenchmarkId::new("serial", partners), &ids, |b, ids| {
            b.iter(|| {
                for id in ids {
                    black_box(reader.get_r2(id).unwrap());
                }
            })
        });
        group.bench_with_input(BenchmarkId::new("parallel", partners), &ids, |b, ids| {
            b.iter(|| {
                ids.par_iter().for_each(|id| {
                    black_box(reader.get_r2(id).unwrap());
                })
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_lookups);
criterion_main!(benches);
