// ========================================================================================
//                     Writing phased hard calls into a genotype container
// ========================================================================================

use super::ContainerError;
use super::header::{ContainerHeader, encode_sample_ids, write_u16_string, write_u32_string};
use super::index::{VariantIndex, default_sidecar_path};
use crate::shared::codec::{BlockCodec, checked_u32, compress};
use crate::types::VariantInformation;
use byteorder::{LittleEndian, WriteBytesExt};
use log::{info, warn};
use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Bits per stored probability.
pub const PROBABILITY_BITS: u8 = 8;
pub const MAX_PLOIDY: usize = 63;
pub const MISSING_PLOIDY_FLAG: u8 = 0b1000_0000;
const PHASED: u8 = 1;
const FULL_PROBABILITY: u8 = u8::MAX;
// Byte offset of the variant count inside the header.
const N_VARIANTS_POSITION: u64 = 8;

/// Writes a container of phased hard calls and the sidecar index describing it.
///
/// Each sample's genotype is given as one allele index per haplotype; an empty list marks
/// the sample as missing. The index recorded while writing is persisted by
/// [`ContainerWriter::finish`] and is identical to what [`VariantIndex::build`] reads back.
#[derive(Debug)]
pub struct ContainerWriter {
    path: PathBuf,
    sidecar: PathBuf,
    file: Option<BufWriter<File>>,
    position: u64,
    index: VariantIndex,
}

impl ContainerWriter {
    pub fn create(path: &Path, samples: Vec<String>) -> Result<Self, ContainerError> {
        Self::create_with_sidecar(path, &default_sidecar_path(path), samples)
    }

    pub fn create_with_sidecar(
        path: &Path,
        sidecar: &Path,
        samples: Vec<String>,
    ) -> Result<Self, ContainerError> {
        let sample_block = encode_sample_ids(&samples)?;
        let header = ContainerHeader::for_samples(
            checked_u32(samples.len())?,
            checked_u32(sample_block.len())?,
        );

        let file = File::create(path).map_err(ContainerError::io(path))?;
        let mut file = BufWriter::with_capacity(1 << 20, file);
        (|| {
            header.write_to(&mut file)?;
            file.write_all(&sample_block)
        })()
        .map_err(ContainerError::io(path))?;

        Ok(Self {
            path: path.to_path_buf(),
            sidecar: sidecar.to_path_buf(),
            file: Some(file),
            position: header.first_variant_position(),
            index: VariantIndex {
                sample_ids: samples,
                compression: header.compression(),
                ..VariantIndex::default()
            },
        })
    }

    pub fn n_variants(&self) -> usize {
        self.index.len()
    }

    /// Appends one variant. `haplotypes[sample]` lists the allele index carried on each
    /// haplotype of that sample.
    pub fn add_variant(
        &mut self,
        variant: VariantInformation,
        haplotypes: &[Vec<u16>],
    ) -> Result<(), ContainerError> {
        let invalid = |message: String| ContainerError::InvalidVariant {
            id: variant.id.clone(),
            message,
        };
        if haplotypes.len() != self.index.n_samples() {
            return Err(invalid(format!(
                "{} genotypes for {} samples",
                haplotypes.len(),
                self.index.n_samples()
            )));
        }
        let n_alleles = u16::try_from(variant.alleles.len())
            .map_err(|_| invalid(format!("{} alleles", variant.alleles.len())))?;
        if n_alleles == 0 {
            return Err(invalid("no alleles".to_string()));
        }

        let mut record = Vec::with_capacity(64);
        write_u16_string(&mut record, &variant.id, "variant id")?;
        write_u16_string(&mut record, variant.alias.as_deref().unwrap_or(""), "variant alias")?;
        write_u16_string(&mut record, &variant.contig, "contig")?;
        record.extend_from_slice(&variant.position.to_le_bytes());
        record.extend_from_slice(&n_alleles.to_le_bytes());
        for allele in &variant.alleles {
            write_u32_string(&mut record, allele)?;
        }

        let payload = encode_phased_calls(haplotypes, n_alleles).map_err(invalid)?;
        let compressed = compress(BlockCodec::Zlib, &payload)?;
        let block_length = checked_u32(compressed.len() + 4)?;
        record.extend_from_slice(&block_length.to_le_bytes());
        let offset = self.position + record.len() as u64;
        record.extend_from_slice(&checked_u32(payload.len())?.to_le_bytes());
        record.extend_from_slice(&compressed);

        let Some(file) = self.file.as_mut() else {
            return Err(ContainerError::Io {
                path: self.path.display().to_string(),
                source: std::io::Error::other("container writer already finished"),
            });
        };
        file.write_all(&record)
            .map_err(ContainerError::io(&self.path))?;
        self.position += record.len() as u64;

        self.index.variant_ids.push(variant.id.clone());
        self.index.variants.push(variant);
        self.index.offsets.push(offset);
        self.index.block_lengths.push(block_length);
        Ok(())
    }

    /// Patches the variant count, flushes the container and persists the sidecar.
    pub fn finish(mut self) -> Result<VariantIndex, ContainerError> {
        self.finalize()?;
        Ok(std::mem::take(&mut self.index))
    }

    fn finalize(&mut self) -> Result<(), ContainerError> {
        let Some(mut file) = self.file.take() else {
            return Ok(());
        };
        let n_variants = checked_u32(self.index.len())?;
        (|| {
            file.seek(SeekFrom::Start(N_VARIANTS_POSITION))?;
            file.write_u32::<LittleEndian>(n_variants)?;
            file.flush()?;
            file.get_ref().sync_all()
        })()
        .map_err(ContainerError::io(&self.path))?;

        self.index.persist(&self.sidecar)?;
        info!(
            "Wrote {} variants for {} samples to {} (index {})",
            self.index.len(),
            self.index.n_samples(),
            self.path.display(),
            self.sidecar.display()
        );
        Ok(())
    }
}

impl Drop for ContainerWriter {
    fn drop(&mut self) {
        if self.file.is_some() {
            warn!(
                "Container writer for {} dropped without finish; finalizing",
                self.path.display()
            );
            if let Err(e) = self.finalize() {
                warn!("Failed to finalize {}: {e}", self.path.display());
            }
        }
    }
}

/// Layout-2 probability data for phased hard calls at 8 bits per probability.
fn encode_phased_calls(haplotypes: &[Vec<u16>], n_alleles: u16) -> Result<Vec<u8>, String> {
    let mut min_ploidy = usize::MAX;
    let mut max_ploidy = 0usize;
    let mut n_probabilities = 0usize;
    for calls in haplotypes {
        if calls.len() > MAX_PLOIDY {
            return Err(format!("ploidy {} exceeds {MAX_PLOIDY}", calls.len()));
        }
        if let Some(&allele) = calls.iter().find(|&&allele| allele >= n_alleles) {
            return Err(format!("allele index {allele} with {n_alleles} alleles"));
        }
        min_ploidy = min_ploidy.min(calls.len());
        max_ploidy = max_ploidy.max(calls.len());
        n_probabilities += calls.len() * (usize::from(n_alleles) - 1);
    }
    if haplotypes.is_empty() {
        min_ploidy = 0;
    }

    let n_samples = u32::try_from(haplotypes.len()).map_err(|_| "too many samples".to_string())?;
    let mut payload = Vec::with_capacity(10 + haplotypes.len() + n_probabilities);
    payload.extend_from_slice(&n_samples.to_le_bytes());
    payload.extend_from_slice(&n_alleles.to_le_bytes());
    payload.push(min_ploidy as u8);
    payload.push(max_ploidy as u8);
    for calls in haplotypes {
        payload.push(if calls.is_empty() {
            MISSING_PLOIDY_FLAG
        } else {
            calls.len() as u8
        });
    }
    payload.push(PHASED);
    payload.push(PROBABILITY_BITS);
    for &allele in haplotypes.iter().flatten() {
        // The probability of the last allele is implied.
        for k in 0..n_alleles - 1 {
            payload.push(if allele == k { FULL_PROBABILITY } else { 0 });
        }
    }
    Ok(payload)
}
