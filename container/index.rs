// ========================================================================================
//                      Variant index of a genotype container
// ========================================================================================

use super::ContainerError;
use super::header::{
    ContainerHeader, read_sample_ids, read_u16, read_u16_string, read_u32, read_u32_string,
};
use crate::types::VariantInformation;
use flate2::Compression;
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use log::{info, warn};
use std::ffi::OsString;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

/// First line of every sidecar. A sidecar with any other first line is rebuilt.
pub const SIDECAR_VERSION_LINE: &str = "# triogen_variant_index_v3";
const SIDECAR_SUFFIX: &str = ".index.gz";
const SIDECAR_COLUMNS: [&str; 8] = [
    "variant_id",
    "alias",
    "contig",
    "position",
    "n_alleles",
    "alleles",
    "offset",
    "block_length",
];
const ALLELE_SEPARATOR: &str = ",";
// `%` is escaped first on write and last on read so that literal "%2C" survives.
const ESCAPES: [(&str, &str); 2] = [("%", "%25"), (ALLELE_SEPARATOR, "%2C")];
// id, alias and contig lengths (u16 each), position, allele count, block length and the
// uncompressed length that every genotype block starts with.
const MIN_RECORD_LEN: u64 = 2 + 2 + 2 + 4 + 2 + 4 + 4;
// Rows reserved up front when loading a sidecar, whatever count it declares.
const MAX_RESERVED_ROWS: usize = 1 << 16;

/// `<container>.index.gz`
pub fn default_sidecar_path(container: &Path) -> PathBuf {
    let mut name = OsString::from(container.as_os_str());
    name.push(SIDECAR_SUFFIX);
    PathBuf::from(name)
}

/// Per-variant byte offsets of a genotype container, with the cohort's sample ids.
///
/// All per-variant vectors share one ordinal. `offsets[i]` points at the uncompressed
/// length field of variant `i`'s genotype block and `block_lengths[i]` counts that field
/// plus the compressed payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VariantIndex {
    pub variant_ids: Vec<String>,
    pub variants: Vec<VariantInformation>,
    pub offsets: Vec<u64>,
    pub block_lengths: Vec<u32>,
    pub sample_ids: Vec<String>,
    pub compression: u32,
}

impl VariantIndex {
    pub fn len(&self) -> usize {
        self.variant_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variant_ids.is_empty()
    }

    pub fn n_samples(&self) -> usize {
        self.sample_ids.len()
    }

    /// Scans the container once, reading identity fields and skipping genotype payloads.
    pub fn build(container: &Path) -> Result<Self, ContainerError> {
        let started = Instant::now();
        let file = File::open(container).map_err(ContainerError::io(container))?;
        let mut reader = BufReader::with_capacity(1 << 20, file);

        let header = ContainerHeader::read_from(&mut reader)?;
        reader
            .seek(SeekFrom::Start(header.sample_block_position()))
            .map_err(ContainerError::io(container))?;
        let sample_ids = read_sample_ids(&mut reader, &header)?;
        reader
            .seek(SeekFrom::Start(header.first_variant_position()))
            .map_err(ContainerError::io(container))?;

        let file_len = reader
            .get_ref()
            .metadata()
            .map_err(ContainerError::io(container))?
            .len();
        let n_variants = header.n_variants as usize;
        // The declared count is untrusted; no more records than the file can hold are reserved.
        let room = file_len.saturating_sub(header.first_variant_position()) / MIN_RECORD_LEN;
        let reserve = n_variants.min(usize::try_from(room).unwrap_or(usize::MAX));
        let mut variant_ids = Vec::with_capacity(reserve);
        let mut variants = Vec::with_capacity(reserve);
        let mut offsets = Vec::with_capacity(reserve);
        let mut block_lengths = Vec::with_capacity(reserve);

        for _ in 0..n_variants {
            let variant = read_variant_identity(&mut reader)?;
            let block_length = read_u32(&mut reader)?;
            if block_length < 4 {
                return Err(ContainerError::InvalidVariant {
                    id: variant.id,
                    message: format!("genotype block of {block_length} bytes"),
                });
            }
            let offset = reader
                .stream_position()
                .map_err(ContainerError::io(container))?;
            reader
                .seek_relative(i64::from(block_length))
                .map_err(ContainerError::io(container))?;

            variant_ids.push(variant.id.clone());
            variants.push(variant);
            offsets.push(offset);
            block_lengths.push(block_length);
        }

        if let (Some(&offset), Some(&length)) = (offsets.last(), block_lengths.last()) {
            if offset + u64::from(length) > file_len {
                return Err(ContainerError::Read(std::io::ErrorKind::UnexpectedEof.into()));
            }
        }

        info!(
            "Indexed {} variants and {} samples of {} in {:.2?}",
            variant_ids.len(),
            sample_ids.len(),
            container.display(),
            started.elapsed()
        );
        Ok(Self {
            variant_ids,
            variants,
            offsets,
            block_lengths,
            sample_ids,
            compression: header.compression(),
        })
    }

    /// Writes the gzip-compressed textual sidecar.
    pub fn persist(&self, sidecar: &Path) -> Result<(), ContainerError> {
        let io_err = ContainerError::io(sidecar);
        let file = File::create(sidecar).map_err(ContainerError::io(sidecar))?;
        let mut writer = BufWriter::new(GzEncoder::new(file, Compression::default()));

        let samples: Vec<&str> = self.sample_ids.iter().map(String::as_str).collect();
        let mut text = String::new();
        text.push_str(SIDECAR_VERSION_LINE);
        text.push('\n');
        text.push_str(&format!("# compression\t{}\n", self.compression));
        text.push_str("# samples\n");
        text.push_str(&sidecar_row(sidecar, &samples)?);
        text.push('\n');
        text.push_str(&format!("# variants\t{}\n", self.len()));
        text.push_str(&SIDECAR_COLUMNS.join("\t"));
        text.push('\n');
        writer.write_all(text.as_bytes()).map_err(io_err)?;

        for (((id, variant), offset), length) in self
            .variant_ids
            .iter()
            .zip(&self.variants)
            .zip(&self.offsets)
            .zip(&self.block_lengths)
        {
            let alleles = join_alleles(&variant.alleles);
            let n_alleles = variant.alleles.len().to_string();
            let position = variant.position.to_string();
            let offset = offset.to_string();
            let length = length.to_string();
            let row = sidecar_row(
                sidecar,
                &[
                    id.as_str(),
                    variant.alias.as_deref().unwrap_or(""),
                    variant.contig.as_str(),
                    position.as_str(),
                    n_alleles.as_str(),
                    alleles.as_str(),
                    offset.as_str(),
                    length.as_str(),
                ],
            )?;
            writeln!(writer, "{row}").map_err(ContainerError::io(sidecar))?;
        }

        let encoder = writer
            .into_inner()
            .map_err(|e| ContainerError::io(sidecar)(e.into_error()))?;
        encoder
            .finish()
            .and_then(|file| file.sync_all())
            .map_err(ContainerError::io(sidecar))?;
        Ok(())
    }

    /// Parses a sidecar written by [`VariantIndex::persist`] without touching the container.
    pub fn load(sidecar: &Path) -> Result<Self, ContainerError> {
        let file = File::open(sidecar).map_err(ContainerError::io(sidecar))?;
        let mut lines = BufReader::new(MultiGzDecoder::new(BufReader::new(file))).lines();
        let mut line_no = 0usize;
        let malformed = |line: usize, message: String| ContainerError::Sidecar {
            path: sidecar.display().to_string(),
            line,
            message,
        };
        let mut next_line = |what: &str| -> Result<String, ContainerError> {
            line_no += 1;
            match lines.next() {
                Some(Ok(line)) => Ok(line),
                Some(Err(e)) => Err(ContainerError::io(sidecar)(e)),
                None => Err(ContainerError::Sidecar {
                    path: sidecar.display().to_string(),
                    line: line_no,
                    message: format!("missing {what}"),
                }),
            }
        };

        let version = next_line("version line")?;
        if version != SIDECAR_VERSION_LINE {
            return Err(ContainerError::SidecarVersion {
                path: sidecar.display().to_string(),
                found: version,
                expected: SIDECAR_VERSION_LINE,
            });
        }

        let compression = next_line("compression line")?;
        let compression = tagged_value(&compression, "# compression")
            .and_then(|value| value.parse::<u32>().ok())
            .ok_or_else(|| malformed(2, format!("expected '# compression', found {compression:?}")))?;

        let samples_tag = next_line("samples tag")?;
        if samples_tag != "# samples" {
            return Err(malformed(3, format!("expected '# samples', found {samples_tag:?}")));
        }
        let samples = next_line("sample identifiers")?;
        let sample_ids: Vec<String> = if samples.is_empty() {
            Vec::new()
        } else {
            samples.split('\t').map(str::to_string).collect()
        };

        let count = next_line("variant count")?;
        let n_variants = tagged_value(&count, "# variants")
            .and_then(|value| value.parse::<usize>().ok())
            .ok_or_else(|| malformed(5, format!("expected '# variants', found {count:?}")))?;
        next_line("column header")?;

        let mut index = Self {
            variant_ids: Vec::with_capacity(n_variants.min(MAX_RESERVED_ROWS)),
            variants: Vec::with_capacity(n_variants.min(MAX_RESERVED_ROWS)),
            offsets: Vec::with_capacity(n_variants.min(MAX_RESERVED_ROWS)),
            block_lengths: Vec::with_capacity(n_variants.min(MAX_RESERVED_ROWS)),
            sample_ids,
            compression,
        };

        let mut row_no = 6usize;
        for line in lines {
            row_no += 1;
            let line = line.map_err(ContainerError::io(sidecar))?;
            if line.is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split('\t').collect();
            let &[id, alias, contig, position, n_alleles, alleles, offset, length] =
                fields.as_slice()
            else {
                return Err(malformed(
                    row_no,
                    format!("expected {} fields, found {}", SIDECAR_COLUMNS.len(), fields.len()),
                ));
            };
            let number_err = |field: &str, value: &str| {
                malformed(row_no, format!("invalid {field} {value:?}"))
            };
            let position = position
                .parse::<u32>()
                .map_err(|_| number_err("position", position))?;
            let offset = offset
                .parse::<u64>()
                .map_err(|_| number_err("offset", offset))?;
            let length = length
                .parse::<u32>()
                .map_err(|_| number_err("block length", length))?;
            let n_alleles = n_alleles
                .parse::<usize>()
                .map_err(|_| number_err("allele count", n_alleles))?;
            let alleles = split_alleles(n_alleles, alleles).ok_or_else(|| {
                malformed(row_no, format!("expected {n_alleles} alleles in {alleles:?}"))
            })?;

            let variant = VariantInformation::new(
                id.to_string(),
                alias.to_string(),
                contig.to_string(),
                position,
                alleles,
            );
            index.variant_ids.push(variant.id.clone());
            index.variants.push(variant);
            index.offsets.push(offset);
            index.block_lengths.push(length);
        }

        if index.len() != n_variants {
            return Err(malformed(
                row_no,
                format!("declared {n_variants} variants but found {}", index.len()),
            ));
        }
        Ok(index)
    }

    /// Loads the sidecar of `container`, rebuilding and re-persisting it when it is
    /// missing, unreadable, of another version, or disagrees with the container header.
    pub fn open_or_build(container: &Path, sidecar: Option<&Path>) -> Result<Self, ContainerError> {
        let sidecar = sidecar
            .map(Path::to_path_buf)
            .unwrap_or_else(|| default_sidecar_path(container));

        if sidecar.exists() {
            match Self::load(&sidecar) {
                Ok(index) => match index.matches_container(container) {
                    Ok(true) => return Ok(index),
                    Ok(false) => warn!(
                        "Sidecar {} does not match {}; rebuilding",
                        sidecar.display(),
                        container.display()
                    ),
                    Err(e) => return Err(e),
                },
                Err(e) => warn!("Could not use sidecar {}: {e}; rebuilding", sidecar.display()),
            }
        } else {
            info!("No index found for {}; building {}", container.display(), sidecar.display());
        }

        let index = Self::build(container)?;
        if let Err(e) = index.persist(&sidecar) {
            warn!("Failed to save index {}: {e}", sidecar.display());
        }
        Ok(index)
    }

    fn matches_container(&self, container: &Path) -> Result<bool, ContainerError> {
        let file = File::open(container).map_err(ContainerError::io(container))?;
        let header = ContainerHeader::read_from(&mut BufReader::new(file))?;
        Ok(header.n_variants as usize == self.len()
            && header.n_samples as usize == self.n_samples()
            && header.compression() == self.compression)
    }
}

fn sidecar_row(sidecar: &Path, values: &[&str]) -> Result<String, ContainerError> {
    if let Some(bad) = values.iter().find(|v| v.contains(['\t', '\n', '\r'])) {
        return Err(ContainerError::Sidecar {
            path: sidecar.display().to_string(),
            line: 0,
            message: format!("field {bad:?} contains a tab or line break"),
        });
    }
    Ok(values.join("\t"))
}

fn join_alleles(alleles: &[String]) -> String {
    let escaped: Vec<String> = alleles
        .iter()
        .map(|allele| {
            ESCAPES
                .iter()
                .fold(allele.clone(), |text, (raw, code)| text.replace(raw, code))
        })
        .collect();
    escaped.join(ALLELE_SEPARATOR)
}

/// Inverse of [`join_alleles`]; `None` when the field does not hold `n` alleles.
fn split_alleles(n: usize, joined: &str) -> Option<Vec<String>> {
    if n == 0 {
        return joined.is_empty().then(Vec::new);
    }
    let alleles: Vec<String> = joined
        .split(ALLELE_SEPARATOR)
        .map(|allele| {
            ESCAPES
                .iter()
                .rev()
                .fold(allele.to_string(), |text, (raw, code)| text.replace(code, raw))
        })
        .collect();
    (alleles.len() == n).then_some(alleles)
}

fn tagged_value<'a>(line: &'a str, tag: &str) -> Option<&'a str> {
    let (found, value) = line.split_once('\t')?;
    (found == tag).then_some(value)
}

/// Reads the identity fields of one variant record, leaving the reader at its block size.
pub(crate) fn read_variant_identity<R: std::io::Read>(
    reader: &mut R,
) -> Result<VariantInformation, ContainerError> {
    let id = read_u16_string(reader, "variant id")?;
    let alias = read_u16_string(reader, "variant alias")?;
    let contig = read_u16_string(reader, "contig")?;
    let position = read_u32(reader)?;
    let n_alleles = read_u16(reader)?;
    let alleles = (0..n_alleles)
        .map(|_| read_u32_string(reader, "allele"))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(VariantInformation::new(id, alias, contig, position, alleles))
}
