// ========================================================================================
//                        Greedy LD pruning of association results
// ========================================================================================

use crate::format::LdMatrixError;
use crate::reader::{LdMatrixReader, LdMatrixSet};
use crate::types::compare_contigs;
use ahash::{AHashMap, AHashSet};
use csv::{ReaderBuilder, StringRecord, WriterBuilder};
use flate2::Compression;
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use log::{info, warn};
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::time::Instant;
use thiserror::Error;

// Rows without a phenotype column are pruned as one group.
const SINGLE_PHENOTYPE: &str = "";

#[derive(Debug, Error)]
pub enum PruneError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Table {
        path: String,
        #[source]
        source: csv::Error,
    },
    #[error("column '{column}' not found in {path}")]
    MissingColumn { column: String, path: String },
    #[error("p-value '{value}' at line {line} of {path} is not a number")]
    InvalidPValue {
        value: String,
        line: u64,
        path: String,
    },
    #[error("LD lookup failed on contig {contig}: {source}")]
    Matrix {
        contig: String,
        #[source]
        source: LdMatrixError,
    },
}

/// Columns and thresholds of a pruning run.
#[derive(Debug, Clone, PartialEq)]
pub struct PruneSettings {
    /// Two hits are in LD when their r² is at least this.
    pub min_r2: f64,
    /// Rows with a larger p-value are dropped before pruning.
    pub max_p: f64,
    pub id_column: String,
    pub contig_column: String,
    pub p_column: String,
    /// Hits are pruned separately per phenotype when set.
    pub phenotype_column: Option<String>,
    pub delimiter: u8,
}

impl Default for PruneSettings {
    fn default() -> Self {
        Self {
            min_r2: 0.05,
            max_p: 1e-6,
            id_column: "variantId".to_string(),
            contig_column: "contig".to_string(),
            p_column: "h.intercept.p".to_string(),
            phenotype_column: None,
            delimiter: b'\t',
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PruneSummary {
    pub rows: u64,
    pub hits: usize,
    pub kept: usize,
    pub skipped_contigs: usize,
}

#[derive(Debug, Clone)]
struct Hit {
    p: f64,
    id: String,
    row: StringRecord,
}

struct Columns {
    id: usize,
    contig: usize,
    p: usize,
    phenotype: Option<usize>,
}

impl Columns {
    fn locate(
        headers: &StringRecord,
        settings: &PruneSettings,
        path: &Path,
    ) -> Result<Self, PruneError> {
        let find = |column: &str| {
            headers
                .iter()
                .position(|header| header == column)
                .ok_or_else(|| PruneError::MissingColumn {
                    column: column.to_string(),
                    path: path.display().to_string(),
                })
        };
        Ok(Self {
            id: find(&settings.id_column)?,
            contig: find(&settings.contig_column)?,
            p: find(&settings.p_column)?,
            phenotype: settings
                .phenotype_column
                .as_deref()
                .map(find)
                .transpose()?,
        })
    }
}

type HitsByPhenotype = BTreeMap<String, Vec<Hit>>;

fn is_gzip(path: &Path) -> bool {
    path.extension().is_some_and(|extension| extension == "gz")
}

/// Prunes the association hits of `results` against the per-contig LD matrices of
/// `matrices` and writes the kept rows, under the original header, to `destination`.
/// Gzip is read and written when the file name ends in `.gz`.
pub fn prune_results(
    results: &Path,
    matrices: &LdMatrixSet,
    destination: &Path,
    settings: &PruneSettings,
) -> Result<PruneSummary, PruneError> {
    let started = Instant::now();
    let (headers, by_contig, rows) = read_hits(results, settings)?;
    let hits: usize = by_contig
        .values()
        .flat_map(|phenotypes| phenotypes.values())
        .map(Vec::len)
        .sum();
    info!(
        "Read {rows} rows from {}; {hits} hits with p <= {} on {} contigs",
        results.display(),
        settings.max_p,
        by_contig.len()
    );

    let mut pruned = by_contig
        .into_iter()
        .collect::<Vec<_>>()
        .into_par_iter()
        .map(|(contig, phenotypes)| -> Result<_, PruneError> {
            let reader = matrices
                .reader(&contig)
                .map_err(|source| PruneError::Matrix {
                    contig: contig.clone(),
                    source,
                })?;
            let Some(reader) = reader else {
                warn!(
                    "Skipping {} phenotype groups on contig {contig} without an LD matrix",
                    phenotypes.len()
                );
                return Ok((contig, None));
            };
            let mut kept = Vec::new();
            for (_, hits) in phenotypes {
                kept.extend(prune_hits(hits, &reader, settings.min_r2).map_err(|source| {
                    PruneError::Matrix {
                        contig: contig.clone(),
                        source,
                    }
                })?);
            }
            Ok((contig, Some(kept)))
        })
        .collect::<Result<Vec<_>, PruneError>>()?;
    pruned.sort_by(|(a, _), (b, _)| compare_contigs(a, b));

    let mut summary = PruneSummary {
        rows,
        hits,
        ..PruneSummary::default()
    };
    let io_err = |source| PruneError::Io {
        path: destination.display().to_string(),
        source,
    };
    let file = BufWriter::new(File::create(destination).map_err(io_err)?);
    let file = if is_gzip(destination) {
        let encoder = GzEncoder::new(file, Compression::default());
        let encoder = write_kept(encoder, destination, &headers, &pruned, settings, &mut summary)?;
        // The gzip trailer is only written by `finish`.
        encoder.finish().map_err(io_err)?
    } else {
        write_kept(file, destination, &headers, &pruned, settings, &mut summary)?
    };
    file.into_inner().map_err(|e| io_err(e.into_error()))?;

    info!(
        "Kept {} of {} hits in {} ({:.2?})",
        summary.kept,
        summary.hits,
        destination.display(),
        started.elapsed()
    );
    Ok(summary)
}

fn write_kept<W: Write>(
    sink: W,
    destination: &Path,
    headers: &StringRecord,
    pruned: &[(String, Option<Vec<Hit>>)],
    settings: &PruneSettings,
    summary: &mut PruneSummary,
) -> Result<W, PruneError> {
    let table_err = |source| PruneError::Table {
        path: destination.display().to_string(),
        source,
    };
    let mut writer = WriterBuilder::new()
        .delimiter(settings.delimiter)
        .from_writer(sink);
    writer.write_record(headers).map_err(table_err)?;
    for (_, kept) in pruned {
        let Some(kept) = kept else {
            summary.skipped_contigs += 1;
            continue;
        };
        for hit in kept {
            writer.write_record(&hit.row).map_err(table_err)?;
        }
        summary.kept += kept.len();
    }
    writer.into_inner().map_err(|e| PruneError::Io {
        path: destination.display().to_string(),
        source: e.into_error(),
    })
}

fn read_hits(
    results: &Path,
    settings: &PruneSettings,
) -> Result<(StringRecord, AHashMap<String, HitsByPhenotype>, u64), PruneError> {
    let path_name = results.display().to_string();
    let table_err = |source| PruneError::Table {
        path: path_name.clone(),
        source,
    };
    let file = File::open(results).map_err(|source| PruneError::Io {
        path: path_name.clone(),
        source,
    })?;
    let source: Box<dyn Read> = if is_gzip(results) {
        Box::new(MultiGzDecoder::new(BufReader::new(file)))
    } else {
        Box::new(BufReader::new(file))
    };
    let mut reader = ReaderBuilder::new()
        .delimiter(settings.delimiter)
        .has_headers(true)
        .from_reader(source);

    let headers = reader.headers().map_err(table_err)?.clone();
    let columns = Columns::locate(&headers, settings, results)?;

    let mut by_contig: AHashMap<String, HitsByPhenotype> = AHashMap::new();
    let mut rows = 0u64;
    for row in reader.records() {
        let row = row.map_err(table_err)?;
        rows += 1;
        let line = row.position().map_or(rows + 1, |position| position.line());
        let field = |index: usize| row.get(index).unwrap_or("");

        let raw_p = field(columns.p);
        let p = raw_p
            .trim()
            .parse::<f64>()
            .map_err(|_| PruneError::InvalidPValue {
                value: raw_p.to_string(),
                line,
                path: path_name.clone(),
            })?;
        if p.is_nan() || p > settings.max_p {
            continue;
        }

        let phenotype = columns.phenotype.map_or(SINGLE_PHENOTYPE, field);
        let hit = Hit {
            p,
            id: field(columns.id).to_string(),
            row: row.clone(),
        };
        by_contig
            .entry(field(columns.contig).to_string())
            .or_default()
            .entry(phenotype.to_string())
            .or_default()
            .push(hit);
    }
    Ok((headers, by_contig, rows))
}

/// Walks hits by increasing p-value, ties by id, keeping each hit that is not in LD with
/// an already kept one.
fn prune_hits(
    mut hits: Vec<Hit>,
    reader: &LdMatrixReader,
    min_r2: f64,
) -> Result<Vec<Hit>, LdMatrixError> {
    hits.sort_by(|a, b| a.p.total_cmp(&b.p).then_with(|| a.id.cmp(&b.id)));

    let mut linked: AHashSet<String> = AHashSet::new();
    let mut kept = Vec::new();
    for hit in hits {
        if linked.contains(&hit.id) {
            continue;
        }
        linked.insert(hit.id.clone());
        if let Some(partners) = reader.partners(&hit.id)? {
            for partner in partners.iter().filter(|partner| partner.r2 >= min_r2) {
                let partner_id = &reader.variant_ids()[partner.ordinal as usize];
                if let Some(alias) = reader.alias(partner_id) {
                    linked.insert(alias.to_string());
                }
                linked.insert(partner_id.clone());
            }
        }
        kept.push(hit);
    }
    Ok(kept)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::VariantRegistry;
    use crate::writer::LdMatrixWriter;
    use std::fs;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn write_matrix(path: &Path, blocks: &[(&str, &[(&str, f64)])]) {
        let registry = Arc::new(VariantRegistry::new());
        let mut writer = LdMatrixWriter::create(path, Arc::clone(&registry)).unwrap();
        for (source, partners) in blocks {
            let source = registry.ordinal(source, None).unwrap();
            let ordinals: Vec<u32> = partners
                .iter()
                .map(|(id, _)| registry.ordinal(id, None).unwrap())
                .collect();
            let r2: Vec<f64> = partners.iter().map(|(_, r2)| *r2).collect();
            writer.add_block(source, &ordinals, &r2).unwrap();
        }
        writer.close().unwrap();
    }

    fn settings() -> PruneSettings {
        PruneSettings {
            max_p: 0.01,
            id_column: "id".to_string(),
            p_column: "p".to_string(),
            ..PruneSettings::default()
        }
    }

    #[test]
    fn weaker_hits_in_ld_with_kept_hits_are_dropped() {
        let dir = tempdir().unwrap();
        write_matrix(
            &dir.path().join("ld_1.tld"),
            &[
                ("a", &[("b", 0.8), ("c", 0.01)]),
                ("b", &[("a", 0.8)]),
                ("c", &[("a", 0.01)]),
            ],
        );
        let results = dir.path().join("results.tsv");
        fs::write(
            &results,
            "id\tcontig\tp\n\
             b\t1\t1e-8\n\
             a\t1\t1e-5\n\
             c\t1\t1e-4\n\
             d\t1\t0.5\n\
             x\t2\t1e-9\n",
        )
        .unwrap();
        let destination = dir.path().join("pruned.tsv");
        let template = dir.path().join("ld_{contig}.tld");

        let summary = prune_results(
            &results,
            &LdMatrixSet::new(template.display().to_string()),
            &destination,
            &settings(),
        )
        .unwrap();

        assert_eq!(
            fs::read_to_string(&destination).unwrap(),
            "id\tcontig\tp\nb\t1\t1e-8\nc\t1\t1e-4\n"
        );
        assert_eq!(
            summary,
            PruneSummary {
                rows: 5,
                hits: 4,
                kept: 2,
                skipped_contigs: 1,
            }
        );
    }

    #[test]
    fn phenotypes_are_pruned_independently() {
        let dir = tempdir().unwrap();
        write_matrix(
            &dir.path().join("ld_7.tld"),
            &[("a", &[("b", 0.9)]), ("b", &[("a", 0.9)])],
        );
        let results = dir.path().join("results.tsv.gz");
        let mut encoder = GzEncoder::new(File::create(&results).unwrap(), Compression::default());
        encoder
            .write_all(b"pheno\tid\tcontig\tp\nbw\ta\t7\t1e-9\nbw\tb\t7\t1e-8\nlen\tb\t7\t1e-7\n")
            .unwrap();
        encoder.finish().unwrap();
        let destination = dir.path().join("pruned.tsv");
        let settings = PruneSettings {
            phenotype_column: Some("pheno".to_string()),
            ..settings()
        };

        let summary = prune_results(
            &results,
            &LdMatrixSet::new(dir.path().join("ld_{contig}.tld").display().to_string()),
            &destination,
            &settings,
        )
        .unwrap();

        assert_eq!(summary.kept, 2);
        assert_eq!(
            fs::read_to_string(&destination).unwrap(),
            "pheno\tid\tcontig\tp\nbw\ta\t7\t1e-9\nlen\tb\t7\t1e-7\n"
        );
    }

    #[test]
    fn gzip_output_is_a_complete_stream() {
        let dir = tempdir().unwrap();
        write_matrix(
            &dir.path().join("ld_7.tld"),
            &[("a", &[("b", 0.9)]), ("b", &[("a", 0.9)])],
        );
        let results = dir.path().join("results.tsv");
        fs::write(&results, "id\tcontig\tp\na\t7\t1e-9\nb\t7\t1e-8\nc\t7\t0.5\n").unwrap();
        let destination = dir.path().join("pruned.tsv.gz");

        let summary = prune_results(
            &results,
            &LdMatrixSet::new(dir.path().join("ld_{contig}.tld").display().to_string()),
            &destination,
            &settings(),
        )
        .unwrap();

        assert_eq!(summary.kept, 1);
        let mut text = String::new();
        MultiGzDecoder::new(File::open(&destination).unwrap())
            .read_to_string(&mut text)
            .unwrap();
        assert_eq!(text, "id\tcontig\tp\na\t7\t1e-9\n");
    }

    #[test]
    fn missing_column_and_bad_p_value_are_reported() {
        let dir = tempdir().unwrap();
        let matrices = LdMatrixSet::new(dir.path().join("{contig}.tld").display().to_string());
        let destination = dir.path().join("out.tsv");

        let results = dir.path().join("no_p.tsv");
        fs::write(&results, "id\tcontig\n a\t1\n").unwrap();
        assert!(matches!(
            prune_results(&results, &matrices, &destination, &settings()),
            Err(PruneError::MissingColumn { ref column, .. }) if column == "p"
        ));

        let results = dir.path().join("bad_p.tsv");
        fs::write(&results, "id\tcontig\tp\na\t1\tNA?\n").unwrap();
        assert!(matches!(
            prune_results(&results, &matrices, &destination, &settings()),
            Err(PruneError::InvalidPValue { line: 2, .. })
        ));
    }
}
