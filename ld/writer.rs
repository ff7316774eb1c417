use crate::format::{Footer, HEADER_LEN, LdMatrixError, MAGIC, encode_pairs};
use crate::registry::VariantRegistry;
use crate::shared::codec::{BlockCodec, checked_u32, compress, write_framed};
use byteorder::{BigEndian, WriteBytesExt};
use log::{info, warn};
use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const WRITE_BUFFER_SIZE: usize = 1 << 20;

/// What a closed LD matrix file holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LdMatrixSummary {
    pub path: PathBuf,
    pub n_variants: usize,
    pub n_blocks: usize,
    pub file_len: u64,
}

/// Append-only writer of one sparse LD matrix file.
///
/// `add_block` takes `&mut self`, so a writer has exactly one producer at a time; share
/// it across threads by moving it into a dedicated writer thread. The header carries a
/// zero footer offset until [`LdMatrixWriter::close`] patches it, so a file whose writer
/// never closed is rejected by the reader.
#[derive(Debug)]
pub struct LdMatrixWriter {
    path: PathBuf,
    file: Option<BufWriter<File>>,
    registry: Arc<VariantRegistry>,
    body_len: u64,
    blocks: Vec<(u32, u64)>,
    written: Vec<bool>,
    scratch: Vec<u8>,
    failed: bool,
}

impl LdMatrixWriter {
    pub fn create(path: &Path, registry: Arc<VariantRegistry>) -> Result<Self, LdMatrixError> {
        let file = File::create(path).map_err(LdMatrixError::io(path))?;
        let mut file = BufWriter::with_capacity(WRITE_BUFFER_SIZE, file);
        write_header(&mut file, 0).map_err(LdMatrixError::io(path))?;

        Ok(Self {
            path: path.to_path_buf(),
            file: Some(file),
            registry,
            body_len: 0,
            blocks: Vec::new(),
            written: Vec::new(),
            scratch: Vec::new(),
            failed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn registry(&self) -> &Arc<VariantRegistry> {
        &self.registry
    }

    pub fn n_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Appends the LD block of `source`. Sources may arrive in any order. A block with no
    /// partners writes nothing, so the source reads back as having no LD data. Returns
    /// whether a block was written.
    pub fn add_block(
        &mut self,
        source: u32,
        partners: &[u32],
        r2: &[f64],
    ) -> Result<bool, LdMatrixError> {
        if partners.len() != r2.len() {
            return Err(LdMatrixError::LengthMismatch {
                source_ordinal: source,
                partners: partners.len(),
                values: r2.len(),
            });
        }
        let registered = self.registry.len();
        if let Some(&ordinal) = std::iter::once(&source)
            .chain(partners)
            .find(|&&ordinal| ordinal as usize >= registered)
        {
            return Err(LdMatrixError::UnknownOrdinal {
                ordinal,
                len: registered,
            });
        }
        if self.written.get(source as usize).copied().unwrap_or(false) {
            return Err(LdMatrixError::DuplicateBlock(source));
        }
        if partners.is_empty() {
            return Ok(false);
        }

        let Some(file) = self.file.as_mut() else {
            return Err(self.unavailable());
        };

        encode_pairs(partners, r2, &mut self.scratch);
        let compressed = compress(BlockCodec::Deflate, &self.scratch)?;
        let count = checked_u32(partners.len())?;
        let compressed_len = checked_u32(compressed.len())?;

        let written = (|| {
            file.write_u32::<BigEndian>(count)?;
            file.write_u32::<BigEndian>(compressed_len)?;
            file.write_all(&compressed)
        })();
        if let Err(source) = written {
            // Part of the block may be on disk, so no footer can describe the body.
            self.abandon();
            return Err(LdMatrixError::io(&self.path)(source));
        }

        self.blocks.push((source, self.body_len));
        self.body_len += 8 + compressed.len() as u64;
        if self.written.len() <= source as usize {
            self.written.resize(source as usize + 1, false);
        }
        self.written[source as usize] = true;
        Ok(true)
    }

    /// Writes the footer and patches the header. Always call this; dropping an unclosed
    /// writer finalizes on a best-effort basis.
    pub fn close(mut self) -> Result<LdMatrixSummary, LdMatrixError> {
        self.finalize()
    }

    fn unavailable(&self) -> LdMatrixError {
        let path = self.path.display().to_string();
        if self.failed {
            LdMatrixError::Poisoned(path)
        } else {
            LdMatrixError::Closed(path)
        }
    }

    /// Drops the file without flushing what is still buffered. The header keeps its zero
    /// footer offset, so readers reject the file.
    fn abandon(&mut self) {
        self.failed = true;
        if let Some(file) = self.file.take() {
            drop(file.into_parts());
        }
        warn!(
            "Abandoned LD matrix {} after a failed write",
            self.path.display()
        );
    }

    fn finalize(&mut self) -> Result<LdMatrixSummary, LdMatrixError> {
        let Some(mut file) = self.file.take() else {
            return Err(self.unavailable());
        };

        let (ids, aliases) = self.registry.snapshot();
        let n_variants = ids.len();
        let footer = Footer {
            ids,
            aliases,
            blocks: std::mem::take(&mut self.blocks),
        };
        let payload = footer.encode()?;
        let footer_offset = HEADER_LEN + self.body_len;
        let footer_len = write_framed(&mut file, BlockCodec::Deflate, &payload)?;

        let io_err = LdMatrixError::io(&self.path);
        (|| {
            file.seek(SeekFrom::Start(0))?;
            write_header(&mut file, footer_offset)?;
            file.flush()?;
            file.get_ref().sync_all()
        })()
        .map_err(io_err)?;

        let summary = LdMatrixSummary {
            path: self.path.clone(),
            n_variants,
            n_blocks: footer.blocks.len(),
            file_len: footer_offset + footer_len,
        };
        info!(
            "Closed LD matrix {} ({} blocks over {} variants, {} bytes)",
            summary.path.display(),
            summary.n_blocks,
            summary.n_variants,
            summary.file_len
        );
        Ok(summary)
    }
}

impl Drop for LdMatrixWriter {
    fn drop(&mut self) {
        if self.file.is_some() {
            warn!(
                "LD matrix writer for {} dropped without close; finalizing",
                self.path.display()
            );
            if let Err(e) = self.finalize() {
                warn!("Failed to finalize {}: {e}", self.path.display());
            }
        }
    }
}

fn write_header<W: Write>(writer: &mut W, footer_offset: u64) -> std::io::Result<()> {
    writer.write_all(MAGIC)?;
    writer.write_u64::<BigEndian>(footer_offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::fs;
    use tempfile::tempdir;

    fn registry_with(ids: &[&str]) -> Arc<VariantRegistry> {
        let registry = Arc::new(VariantRegistry::new());
        for id in ids {
            registry.ordinal(id, None).unwrap();
        }
        registry
    }

    #[test]
    fn header_is_patched_on_close() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("patched.tld");
        let mut writer = LdMatrixWriter::create(&path, registry_with(&["A", "B"])).unwrap();
        assert!(writer.add_block(0, &[1], &[0.5]).unwrap());
        let summary = writer.close().unwrap();

        let bytes = fs::read(&path).unwrap();
        assert_eq!(&bytes[..MAGIC.len()], MAGIC);
        let offset = u64::from_be_bytes(bytes[MAGIC.len()..HEADER_LEN as usize].try_into().unwrap());
        // One block: two 4-byte fields plus its compressed pairs.
        assert!(offset > HEADER_LEN + 8);
        assert_eq!(summary.file_len, bytes.len() as u64);
        assert_eq!(summary.n_blocks, 1);
        assert_eq!(summary.n_variants, 2);
    }

    #[test]
    fn empty_partner_list_writes_nothing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty.tld");
        let mut writer = LdMatrixWriter::create(&path, registry_with(&["A"])).unwrap();
        assert!(!writer.add_block(0, &[], &[]).unwrap());
        assert_eq!(writer.n_blocks(), 0);
        assert_eq!(writer.close().unwrap().n_blocks, 0);
    }

    #[test]
    fn invalid_blocks_are_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("invalid.tld");
        let mut writer = LdMatrixWriter::create(&path, registry_with(&["A", "B"])).unwrap();

        assert!(matches!(
            writer.add_block(0, &[1], &[0.1, 0.2]),
            Err(LdMatrixError::LengthMismatch { partners: 1, values: 2, .. })
        ));
        assert!(matches!(
            writer.add_block(0, &[5], &[0.1]),
            Err(LdMatrixError::UnknownOrdinal { ordinal: 5, len: 2 })
        ));
        writer.add_block(1, &[0], &[0.3]).unwrap();
        assert!(matches!(
            writer.add_block(1, &[0], &[0.3]),
            Err(LdMatrixError::DuplicateBlock(1))
        ));
        writer.close().unwrap();
    }

    #[test]
    fn dropped_writer_still_produces_a_footer() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dropped.tld");
        {
            let mut writer = LdMatrixWriter::create(&path, registry_with(&["A", "B"])).unwrap();
            writer.add_block(0, &[1], &[0.25]).unwrap();
        }
        let bytes = fs::read(&path).unwrap();
        let offset = u64::from_be_bytes(bytes[MAGIC.len()..HEADER_LEN as usize].try_into().unwrap());
        assert_ne!(offset, 0);
    }

    #[test]
    fn failed_block_write_abandons_the_file() {
        // Writes to /dev/full fail with ENOSPC once the buffer is flushed.
        let device = Path::new("/dev/full");
        if !device.exists() {
            return;
        }
        let mut writer = LdMatrixWriter::create(device, registry_with(&["A", "B"])).unwrap();

        // Random r² values do not compress, so the block overflows the write buffer.
        let mut rng = StdRng::seed_from_u64(17);
        let partners = vec![1u32; 300_000];
        let r2: Vec<f64> = partners.iter().map(|_| rng.gen_range(0.0..1.0)).collect();
        assert!(matches!(
            writer.add_block(0, &partners, &r2),
            Err(LdMatrixError::Io { .. })
        ));

        assert!(matches!(
            writer.add_block(1, &[0], &[0.5]),
            Err(LdMatrixError::Poisoned(_))
        ));
        assert!(matches!(writer.close(), Err(LdMatrixError::Poisoned(_))));
    }
}
