use crate::format::{Footer, HEADER_LEN, LdMatrixError, MAGIC, decode_pairs};
use crate::shared::codec::{BlockCodec, decompress_exact, read_framed};
use crate::shared::files::{MappedRegion, contig_path};
use crate::types::LdPartner;
use ahash::AHashMap;
use byteorder::{BigEndian, ReadBytesExt};
use dashmap::DashMap;
use log::{debug, warn};
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Random-access reader of a closed LD matrix file.
///
/// Opening decodes the footer into an id table and an id → body offset map and maps the
/// body read-only. Lookups share nothing mutable, so one reader serves any number of
/// threads.
#[derive(Debug)]
pub struct LdMatrixReader {
    path: PathBuf,
    body: MappedRegion,
    ids: Vec<String>,
    aliases: Vec<String>,
    ordinals: AHashMap<String, u32>,
    offsets: AHashMap<u32, u64>,
}

impl LdMatrixReader {
    pub fn open(path: &Path) -> Result<Self, LdMatrixError> {
        let display = || path.display().to_string();
        let file = File::open(path).map_err(LdMatrixError::io(path))?;
        let file_len = file.metadata().map_err(LdMatrixError::io(path))?.len();
        if file_len < HEADER_LEN {
            return Err(LdMatrixError::Truncated {
                path: display(),
                len: file_len,
            });
        }

        let mut reader = BufReader::new(file);
        let mut magic = [0u8; MAGIC.len()];
        reader
            .read_exact(&mut magic)
            .map_err(LdMatrixError::io(path))?;
        if magic != MAGIC {
            return Err(LdMatrixError::BadMagic { path: display() });
        }
        let footer_offset = reader
            .read_u64::<BigEndian>()
            .map_err(LdMatrixError::io(path))?;
        // The smallest footer is its two length fields.
        if footer_offset < HEADER_LEN || footer_offset.saturating_add(8) > file_len {
            return Err(LdMatrixError::FooterOutOfBounds {
                path: display(),
                offset: footer_offset,
                file_len,
            });
        }

        reader
            .seek(SeekFrom::Start(footer_offset))
            .map_err(LdMatrixError::io(path))?;
        let payload = read_framed(&mut reader, BlockCodec::Deflate)?;
        let Footer {
            ids,
            aliases,
            blocks,
        } = Footer::decode(&payload).map_err(|message| LdMatrixError::CorruptFooter {
            path: display(),
            message,
        })?;

        let body_len = footer_offset - HEADER_LEN;
        let mut offsets = AHashMap::with_capacity(blocks.len());
        for (ordinal, offset) in blocks {
            if offset >= body_len {
                return Err(LdMatrixError::CorruptFooter {
                    path: display(),
                    message: format!("block offset {offset} lies beyond the body ({body_len} bytes)"),
                });
            }
            offsets.insert(ordinal, offset);
        }
        let ordinals = ids
            .iter()
            .enumerate()
            .map(|(ordinal, id)| (id.clone(), ordinal as u32))
            .collect();
        let body = MappedRegion::open(path, HEADER_LEN, body_len)?;

        debug!(
            "Opened LD matrix {} ({} variants, {} blocks)",
            path.display(),
            ids.len(),
            offsets.len()
        );
        Ok(Self {
            path: path.to_path_buf(),
            body,
            ids,
            aliases,
            ordinals,
            offsets,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of variants holding an LD block.
    pub fn n_blocks(&self) -> usize {
        self.offsets.len()
    }

    /// All variant ids of the file's ordinal space, in ordinal order.
    pub fn variant_ids(&self) -> &[String] {
        &self.ids
    }

    fn block_offset(&self, id: &str) -> Option<u64> {
        let ordinal = self.ordinals.get(id)?;
        self.offsets.get(ordinal).copied()
    }

    /// Whether `id` holds an LD block.
    pub fn contains(&self, id: &str) -> bool {
        self.block_offset(id).is_some()
    }

    /// The alias stored for `id`, if the file knows the variant and it has one.
    pub fn alias(&self, id: &str) -> Option<&str> {
        let &ordinal = self.ordinals.get(id)?;
        Some(self.aliases[ordinal as usize].as_str()).filter(|alias| !alias.is_empty())
    }

    /// The raw partner list of `id`, or `None` when the variant has no recorded LD.
    pub fn partners(&self, id: &str) -> Result<Option<Vec<LdPartner>>, LdMatrixError> {
        let Some(offset) = self.block_offset(id) else {
            return Ok(None);
        };
        let corrupt = |message: String| LdMatrixError::CorruptBlock {
            id: id.to_string(),
            message,
        };

        let mut cursor = self.body.cursor_at(offset)?;
        let count = cursor.read_u32()? as usize;
        let compressed_len = cursor.read_u32()? as usize;
        let compressed = cursor.take(compressed_len)?;
        let expected = count
            .checked_mul(LdPartner::ENCODED_LEN)
            .ok_or_else(|| corrupt(format!("partner count {count} overflows")))?;
        let payload = decompress_exact(BlockCodec::Deflate, compressed, expected)?;

        let partners = decode_pairs(&payload);
        if let Some(bad) = partners.iter().find(|p| p.ordinal as usize >= self.ids.len()) {
            return Err(corrupt(format!(
                "partner ordinal {} outside the id table of {}",
                bad.ordinal,
                self.ids.len()
            )));
        }
        Ok(Some(partners))
    }

    /// The partner → r² map of `id`. `None` means the variant has no recorded LD, which
    /// is distinct from a failed lookup.
    pub fn get_r2(&self, id: &str) -> Result<Option<AHashMap<String, f64>>, LdMatrixError> {
        self.get_r2_above(id, f64::NEG_INFINITY)
    }

    /// Like [`LdMatrixReader::get_r2`], keeping only partners with `r² >= min_r2`.
    pub fn get_r2_above(
        &self,
        id: &str,
        min_r2: f64,
    ) -> Result<Option<AHashMap<String, f64>>, LdMatrixError> {
        let Some(partners) = self.partners(id)? else {
            return Ok(None);
        };
        Ok(Some(
            partners
                .into_iter()
                .filter(|partner| partner.r2 >= min_r2)
                .map(|partner| (self.ids[partner.ordinal as usize].clone(), partner.r2))
                .collect(),
        ))
    }
}

/// Per-contig LD matrices addressed through a file template such as `ld/chr{contig}.tld`.
/// Readers are opened on first use and shared afterwards; a contig whose file does not
/// exist has no matrix.
#[derive(Debug)]
pub struct LdMatrixSet {
    template: String,
    readers: DashMap<String, Option<Arc<LdMatrixReader>>>,
}

impl LdMatrixSet {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            readers: DashMap::new(),
        }
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn reader(&self, contig: &str) -> Result<Option<Arc<LdMatrixReader>>, LdMatrixError> {
        if let Some(cached) = self.readers.get(contig) {
            return Ok(cached.clone());
        }

        let path = contig_path(&self.template, contig);
        let opened = if path.exists() {
            Some(Arc::new(LdMatrixReader::open(&path)?))
        } else {
            warn!(
                "No LD matrix for contig {contig} ({} not found)",
                path.display()
            );
            None
        };
        Ok(self
            .readers
            .entry(contig.to_string())
            .or_insert(opened)
            .clone())
    }

    pub fn get_r2(
        &self,
        contig: &str,
        id: &str,
    ) -> Result<Option<AHashMap<String, f64>>, LdMatrixError> {
        match self.reader(contig)? {
            Some(reader) => reader.get_r2(id),
            None => Ok(None),
        }
    }
}
