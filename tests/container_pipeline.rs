use approx::assert_relative_eq;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread;
use tempfile::tempdir;
use triogen::config::LdSettings;
use triogen::container::{ContainerStream, ContainerWriter, VariantIndex, default_sidecar_path};
use triogen::pipeline::{compute_ld_matrix, r_squared};
use triogen::window::{BufferedGenotypeWindow, GenotypeRecord, WindowSettings};
use triogen::{LdMatrixReader, VariantInformation};

const N_SAMPLES: usize = 40;
const N_VARIANTS: u32 = 60;
const SPACING: u32 = 100;

// --- Helper: a cohort with random diploid calls, a few missing samples and one
// monomorphic site ---
fn write_cohort(path: &Path, seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    let samples = (0..N_SAMPLES).map(|i| format!("sample_{i}")).collect();
    let mut writer = ContainerWriter::create(path, samples).unwrap();
    for i in 0..N_VARIANTS {
        let frequency = rng.gen_range(0.1..0.5);
        let calls: Vec<Vec<u16>> = (0..N_SAMPLES)
            .map(|_| {
                if i == 7 {
                    return vec![0, 0];
                }
                if rng.gen_bool(0.05) {
                    return Vec::new();
                }
                (0..2).map(|_| u16::from(rng.gen_bool(frequency))).collect()
            })
            .collect();
        let variant = VariantInformation::new(
            String::new(),
            format!("rs{}", 1000 + i),
            "22".to_string(),
            (i + 1) * SPACING,
            vec!["A".to_string(), "G".to_string()],
        );
        writer.add_variant(variant, &calls).unwrap();
    }
    writer.finish().unwrap();
}

#[test]
fn ld_matrix_matches_pairwise_correlations() {
    let dir = tempdir().unwrap();
    let container = dir.path().join("chr22.bgen");
    let matrix = dir.path().join("chr22.tld");
    write_cohort(&container, 5);

    let settings = LdSettings {
        max_distance: 450,
        min_r2: 0.0,
        threads: 4,
        batch_size: 8,
        ..LdSettings::default()
    };
    let stream = ContainerStream::open(&container, None).unwrap();
    let summary = compute_ld_matrix(stream, &matrix, &settings).unwrap();
    assert_eq!(summary.variants, N_VARIANTS as usize);

    // Brute force over the decoded dosages.
    let decoder = ContainerStream::open(&container, None).unwrap();
    let variants: Vec<_> = (0..N_VARIANTS as usize)
        .map(|i| decoder.read_variant(i).unwrap())
        .collect();
    let reader = LdMatrixReader::open(&matrix).unwrap();
    let mut pairs = 0u64;
    for a in &variants {
        let found = reader.get_r2(a.variant_id()).unwrap().unwrap_or_default();
        let mut expected = 0;
        for b in &variants {
            if a.variant_id() == b.variant_id()
                || a.position().abs_diff(b.position()) > settings.max_distance
            {
                assert!(!found.contains_key(b.variant_id()));
                continue;
            }
            match r_squared(&a.dosages, &b.dosages) {
                Some(r2) => {
                    expected += 1;
                    assert_relative_eq!(found[b.variant_id()], r2, epsilon = 1e-12);
                }
                None => assert!(!found.contains_key(b.variant_id())),
            }
        }
        assert_eq!(found.len(), expected);
        pairs += expected as u64;
    }
    assert_eq!(summary.pairs, pairs);

    let monomorphic = &variants[7];
    assert!(reader.get_r2(monomorphic.variant_id()).unwrap().is_none());
    assert_eq!(
        reader.alias(variants[0].variant_id()),
        Some("rs1000")
    );
}

#[test]
fn window_over_container_delivers_every_variant_once() {
    let dir = tempdir().unwrap();
    let container = dir.path().join("chr22.bgen");
    write_cohort(&container, 9);

    let stream = ContainerStream::open(&container, None).unwrap();
    let window = BufferedGenotypeWindow::new(
        stream,
        WindowSettings::new(250, 250).with_batch_size(3),
    )
    .unwrap();
    let seen = Mutex::new(Vec::new());
    thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                while let Some(item) = window.next().unwrap() {
                    let neighbours = window
                        .records_in_range(
                            item.contig(),
                            item.position().saturating_sub(250),
                            item.position() + 250,
                        )
                        .unwrap();
                    assert!(neighbours.iter().any(|n| Arc::ptr_eq(n, item.record())));
                    seen.lock().unwrap().push(item.variant_id().to_string());
                }
            });
        }
    });

    let seen = seen.into_inner().unwrap();
    let unique: HashSet<_> = seen.iter().collect();
    assert_eq!(seen.len(), N_VARIANTS as usize);
    assert_eq!(unique.len(), N_VARIANTS as usize);
}

#[test]
fn stale_sidecar_is_replaced_before_streaming() {
    let dir = tempdir().unwrap();
    let container = dir.path().join("chr22.bgen");
    write_cohort(&container, 13);
    let sidecar = default_sidecar_path(&container);
    std::fs::write(&sidecar, b"# TrioGen_bgen_index_v.1.0.1\n").unwrap();

    let stream = ContainerStream::open(&container, None).unwrap();
    assert_eq!(stream.index().len(), N_VARIANTS as usize);
    assert_eq!(
        VariantIndex::load(&sidecar).unwrap(),
        VariantIndex::build(&container).unwrap()
    );
}

#[test]
fn records_sharing_an_id_do_not_abort_the_run() {
    let dir = tempdir().unwrap();
    let container = dir.path().join("dup.bgen");
    let matrix = dir.path().join("dup.tld");
    let dosages: [(&str, u32, [u16; 8]); 4] = [
        ("rs1", 10, [0, 1, 2, 1, 0, 2, 1, 0]),
        (".", 20, [2, 1, 0, 1, 2, 0, 1, 2]),
        (".", 30, [0, 0, 1, 1, 2, 2, 0, 1]),
        ("rs4", 40, [1, 2, 0, 0, 1, 1, 2, 0]),
    ];
    let samples = (0..8).map(|i| format!("sample_{i}")).collect();
    let mut writer = ContainerWriter::create(&container, samples).unwrap();
    for (id, position, row) in dosages {
        let calls: Vec<Vec<u16>> = row
            .iter()
            .map(|&d| vec![u16::from(d == 2), u16::from(d >= 1)])
            .collect();
        let variant = VariantInformation::new(
            id.to_string(),
            String::new(),
            "22".to_string(),
            position,
            vec!["A".to_string(), "G".to_string()],
        );
        writer.add_variant(variant, &calls).unwrap();
    }
    writer.finish().unwrap();

    let settings = LdSettings {
        max_distance: 100,
        min_r2: 0.0,
        threads: 2,
        ..LdSettings::default()
    };
    let stream = ContainerStream::open(&container, None).unwrap();
    assert_eq!(stream.index().len(), 4);
    let summary = compute_ld_matrix(stream, &matrix, &settings).unwrap();
    assert_eq!(summary.variants, 3);
    assert_eq!(summary.pairs, 6);

    let reader = LdMatrixReader::open(&matrix).unwrap();
    let rs1 = reader.get_r2("rs1").unwrap().unwrap();
    assert_relative_eq!(rs1["."], 1.0, epsilon = 1e-9);
    let placeholder = reader.get_r2(".").unwrap().unwrap();
    assert!(!placeholder.contains_key("."));
    assert_eq!(placeholder.len(), 2);
}
