// ========================================================================================
//                  Streaming decoded dosages out of a genotype container
// ========================================================================================

use super::ContainerError;
use super::index::VariantIndex;
use crate::shared::codec::{BlockCodec, decompress_exact};
use crate::shared::files::MappedRegion;
use crate::types::VariantInformation;
use crate::window::{GenotypeRecord, GenotypeStream, StreamError};
use ahash::AHashSet;
use byteorder::{ByteOrder, LittleEndian};
use log::debug;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const PLOIDY_MASK: u8 = 0b0011_1111;
const MISSING_FLAG: u8 = 0b1000_0000;
// n_samples u32 | n_alleles u16 | min ploidy u8 | max ploidy u8
const PAYLOAD_PREAMBLE_LEN: usize = 8;

/// One variant with its per-sample alternate-allele dosages. Missing samples are `NaN`.
#[derive(Debug, Clone, PartialEq)]
pub struct VariantGenotypes {
    pub info: VariantInformation,
    pub dosages: Vec<f32>,
    pub ploidies: Vec<u8>,
}

impl VariantGenotypes {
    pub fn n_observed(&self) -> usize {
        self.dosages.iter().filter(|d| !d.is_nan()).count()
    }

    /// Frequency of the non-reference alleles among observed haplotypes.
    pub fn alternate_allele_frequency(&self) -> Option<f64> {
        let (dosage, haplotypes) = self
            .dosages
            .iter()
            .zip(&self.ploidies)
            .filter(|(d, _)| !d.is_nan())
            .fold((0.0f64, 0u64), |(sum, n), (&d, &p)| {
                (sum + f64::from(d), n + u64::from(p))
            });
        (haplotypes > 0).then(|| dosage / haplotypes as f64)
    }

    pub fn minor_allele_frequency(&self) -> Option<f64> {
        self.alternate_allele_frequency().map(|f| f.min(1.0 - f))
    }
}

impl GenotypeRecord for VariantGenotypes {
    fn contig(&self) -> &str {
        &self.info.contig
    }

    fn position(&self) -> u32 {
        self.info.position
    }

    fn variant_id(&self) -> &str {
        &self.info.id
    }
}

/// Walks a container in file order through its variant index, decoding each genotype
/// block from one memory mapping of the file.
#[derive(Debug)]
pub struct ContainerStream {
    path: PathBuf,
    region: MappedRegion,
    index: Arc<VariantIndex>,
    next: usize,
    last: Option<(String, u32)>,
    finished_contigs: AHashSet<String>,
    closed: bool,
}

impl ContainerStream {
    /// Opens `container`, loading or rebuilding its sidecar index.
    pub fn open(container: &Path, sidecar: Option<&Path>) -> Result<Self, ContainerError> {
        let index = VariantIndex::open_or_build(container, sidecar)?;
        Self::with_index(container, Arc::new(index))
    }

    pub fn with_index(container: &Path, index: Arc<VariantIndex>) -> Result<Self, ContainerError> {
        let file_len = fs::metadata(container)
            .map_err(ContainerError::io(container))?
            .len();
        let region = MappedRegion::open(container, 0, file_len)?;
        Ok(Self {
            path: container.to_path_buf(),
            region,
            index,
            next: 0,
            last: None,
            finished_contigs: AHashSet::new(),
            closed: false,
        })
    }

    pub fn index(&self) -> &Arc<VariantIndex> {
        &self.index
    }

    pub fn sample_ids(&self) -> &[String] {
        &self.index.sample_ids
    }

    /// Decodes the variant at `ordinal` without moving the stream.
    pub fn read_variant(&self, ordinal: usize) -> Result<VariantGenotypes, ContainerError> {
        let len = self.index.len();
        let (Some(info), Some(&offset), Some(&block_length)) = (
            self.index.variants.get(ordinal),
            self.index.offsets.get(ordinal),
            self.index.block_lengths.get(ordinal),
        ) else {
            return Err(ContainerError::OrdinalOutOfRange { ordinal, len });
        };

        let mut cursor = self.region.cursor_at(offset)?;
        let expected_len = LittleEndian::read_u32(cursor.take(4)?) as usize;
        let compressed_len = block_length.checked_sub(4).ok_or_else(|| {
            ContainerError::InvalidVariant {
                id: info.id.clone(),
                message: format!("genotype block of {block_length} bytes"),
            }
        })?;
        let compressed = cursor.take(compressed_len as usize)?;
        let payload = decompress_exact(BlockCodec::Zlib, compressed, expected_len)?;

        let (dosages, ploidies) = decode_phased_dosages(&payload, info, self.index.n_samples())?;
        Ok(VariantGenotypes {
            info: info.clone(),
            dosages,
            ploidies,
        })
    }

    fn malformed(&self, index: usize, message: String) -> StreamError {
        StreamError::Malformed {
            source_name: self.path.display().to_string(),
            index,
            message,
        }
    }

    fn check_order(&mut self, record: &VariantGenotypes) -> Result<(), StreamError> {
        let contig = record.contig();
        let position = record.position();
        match self.last.take() {
            Some((last_contig, last_position)) if last_contig == contig => {
                if position < last_position {
                    return Err(self.malformed(
                        self.next,
                        format!("position {position} follows {last_position} on contig {contig}"),
                    ));
                }
            }
            Some((last_contig, _)) => {
                self.finished_contigs.insert(last_contig);
                if self.finished_contigs.contains(contig) {
                    return Err(self.malformed(
                        self.next,
                        format!("contig {contig} appears in more than one run"),
                    ));
                }
            }
            None => {}
        }
        self.last = Some((contig.to_string(), position));
        Ok(())
    }
}

impl GenotypeStream for ContainerStream {
    type Record = VariantGenotypes;

    fn next_record(&mut self) -> Result<Option<VariantGenotypes>, StreamError> {
        if self.closed {
            return Err(StreamError::Closed(self.path.display().to_string()));
        }
        if self.next >= self.index.len() {
            return Ok(None);
        }
        let record = self
            .read_variant(self.next)
            .map_err(|e| self.malformed(self.next, e.to_string()))?;
        self.check_order(&record)?;
        self.next += 1;
        Ok(Some(record))
    }

    fn is_finished(&self) -> bool {
        self.next >= self.index.len()
    }

    fn record_count(&self) -> usize {
        self.next
    }

    fn len_hint(&self) -> Option<usize> {
        Some(self.index.len())
    }

    fn close(&mut self) -> Result<(), StreamError> {
        if !self.closed {
            debug!(
                "Closing {} after {} of {} variants",
                self.path.display(),
                self.next,
                self.index.len()
            );
        }
        self.closed = true;
        Ok(())
    }
}

/// Sums `1 - P(reference)` over the haplotypes of each sample.
fn decode_phased_dosages(
    payload: &[u8],
    info: &VariantInformation,
    n_samples: usize,
) -> Result<(Vec<f32>, Vec<u8>), ContainerError> {
    let unsupported = |message: String| ContainerError::UnsupportedPayload {
        id: info.id.clone(),
        message,
    };
    let truncated = || unsupported(format!("payload of {} bytes is truncated", payload.len()));

    if payload.len() < PAYLOAD_PREAMBLE_LEN {
        return Err(truncated());
    }
    let stored_samples = LittleEndian::read_u32(&payload[0..4]) as usize;
    let n_alleles = usize::from(LittleEndian::read_u16(&payload[4..6]));
    if stored_samples != n_samples {
        return Err(unsupported(format!(
            "payload holds {stored_samples} samples, index lists {n_samples}"
        )));
    }
    if n_alleles != info.alleles.len() || n_alleles == 0 {
        return Err(unsupported(format!(
            "payload holds {n_alleles} alleles, record lists {}",
            info.alleles.len()
        )));
    }

    let ploidy_end = PAYLOAD_PREAMBLE_LEN + n_samples;
    let ploidy_bytes = payload
        .get(PAYLOAD_PREAMBLE_LEN..ploidy_end)
        .ok_or_else(truncated)?;
    let &[phased, bits] = payload.get(ploidy_end..ploidy_end + 2).ok_or_else(truncated)? else {
        return Err(truncated());
    };
    if phased != 1 {
        return Err(unsupported("unphased genotypes".to_string()));
    }
    if bits != 8 {
        return Err(unsupported(format!("{bits}-bit probabilities")));
    }

    let per_haplotype = n_alleles - 1;
    let mut probabilities = &payload[ploidy_end + 2..];
    let mut dosages = Vec::with_capacity(n_samples);
    let mut ploidies = Vec::with_capacity(n_samples);
    for &byte in ploidy_bytes {
        let ploidy = byte & PLOIDY_MASK;
        let width = usize::from(ploidy) * per_haplotype;
        if probabilities.len() < width {
            return Err(truncated());
        }
        let (sample, rest) = probabilities.split_at(width);
        probabilities = rest;

        if byte & MISSING_FLAG != 0 || ploidy == 0 {
            dosages.push(f32::NAN);
            ploidies.push(0);
            continue;
        }
        let dosage = if per_haplotype == 0 {
            // A monomorphic site carries only the reference allele.
            0.0
        } else {
            sample
                .chunks_exact(per_haplotype)
                .map(|haplotype| 1.0 - f32::from(haplotype[0]) / 255.0)
                .sum()
        };
        dosages.push(dosage);
        ploidies.push(ploidy);
    }
    if !probabilities.is_empty() {
        return Err(unsupported(format!(
            "{} trailing bytes after the probabilities",
            probabilities.len()
        )));
    }
    Ok((dosages, ploidies))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::ContainerWriter;
    use approx::assert_abs_diff_eq;
    use tempfile::tempdir;

    fn variant(contig: &str, position: u32, alleles: &[&str]) -> VariantInformation {
        VariantInformation::new(
            String::new(),
            String::new(),
            contig.to_string(),
            position,
            alleles.iter().map(|a| a.to_string()).collect(),
        )
    }

    #[test]
    fn dosages_follow_the_written_calls() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("trio.bgen");
        let samples = vec!["kid".to_string(), "mom".to_string(), "dad".to_string()];
        let mut writer = ContainerWriter::create(&path, samples).unwrap();
        writer
            .add_variant(variant("1", 10, &["A", "G"]), &[vec![0, 1], vec![1, 1], vec![]])
            .unwrap();
        writer
            .add_variant(variant("1", 20, &["C", "T", "TT"]), &[vec![2, 0], vec![0, 0], vec![1]])
            .unwrap();
        writer.finish().unwrap();

        let mut stream = ContainerStream::open(&path, None).unwrap();
        assert_eq!(stream.sample_ids(), ["kid", "mom", "dad"]);

        let first = stream.next_record().unwrap().unwrap();
        assert_eq!(first.variant_id(), "1_10_A_G");
        assert_abs_diff_eq!(first.dosages[0], 1.0);
        assert_abs_diff_eq!(first.dosages[1], 2.0);
        assert!(first.dosages[2].is_nan());
        assert_eq!(first.n_observed(), 2);
        assert_abs_diff_eq!(first.alternate_allele_frequency().unwrap(), 0.75);
        assert_abs_diff_eq!(first.minor_allele_frequency().unwrap(), 0.25);

        let second = stream.next_record().unwrap().unwrap();
        assert_eq!(second.ploidies, vec![2, 2, 1]);
        assert_abs_diff_eq!(second.dosages[0], 1.0);
        assert_abs_diff_eq!(second.dosages[1], 0.0);
        assert_abs_diff_eq!(second.dosages[2], 1.0);

        assert!(stream.next_record().unwrap().is_none());
        assert!(stream.is_finished());
        assert_eq!(stream.record_count(), 2);
        stream.close().unwrap();
        assert!(matches!(stream.next_record(), Err(StreamError::Closed(_))));
    }

    #[test]
    fn random_access_does_not_move_the_stream() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("trio.bgen");
        let mut writer = ContainerWriter::create(&path, vec!["s".to_string()]).unwrap();
        for position in [5, 6, 7] {
            writer
                .add_variant(variant("2", position, &["A", "C"]), &[vec![0, 1]])
                .unwrap();
        }
        let index = Arc::new(writer.finish().unwrap());

        let stream = ContainerStream::with_index(&path, index).unwrap();
        assert_eq!(stream.read_variant(2).unwrap().info.position, 7);
        assert_eq!(stream.record_count(), 0);
        assert!(matches!(
            stream.read_variant(3),
            Err(ContainerError::OrdinalOutOfRange { ordinal: 3, len: 3 })
        ));
    }

    #[test]
    fn unsorted_positions_are_malformed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("unsorted.bgen");
        let mut writer = ContainerWriter::create(&path, vec!["s".to_string()]).unwrap();
        writer
            .add_variant(variant("3", 50, &["A", "C"]), &[vec![0, 0]])
            .unwrap();
        writer
            .add_variant(variant("3", 40, &["A", "C"]), &[vec![1, 0]])
            .unwrap();
        writer.finish().unwrap();

        let mut stream = ContainerStream::open(&path, None).unwrap();
        stream.next_record().unwrap();
        assert!(matches!(
            stream.next_record(),
            Err(StreamError::Malformed { index: 1, .. })
        ));
    }

    #[test]
    fn unphased_payload_is_unsupported() {
        let info = variant("1", 1, &["A", "G"]);
        let mut payload = Vec::new();
        payload.extend_from_slice(&1u32.to_le_bytes());
        payload.extend_from_slice(&2u16.to_le_bytes());
        payload.extend_from_slice(&[2, 2, 2, 0, 8, 255, 0]);
        assert!(matches!(
            decode_phased_dosages(&payload, &info, 1),
            Err(ContainerError::UnsupportedPayload { .. })
        ));

        payload[9] = 1;
        payload[10] = 16;
        assert!(matches!(
            decode_phased_dosages(&payload, &info, 1),
            Err(ContainerError::UnsupportedPayload { .. })
        ));
    }
}
