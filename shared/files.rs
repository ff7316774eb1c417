// ========================================================================================
//                          Memory-mapped byte regions
// ========================================================================================

use byteorder::{BigEndian, ByteOrder};
use memmap2::{Mmap, MmapOptions};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Placeholder substituted by the contig name in per-contig file templates.
pub const CONTIG_PLACEHOLDER: &str = "{contig}";

#[derive(Debug, Error)]
pub enum RegionError {
    #[error("failed to map {path}: {source}")]
    Map {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("region [{offset}, {offset}+{len}) exceeds {path} ({file_len} bytes)")]
    OutsideFile {
        path: String,
        offset: u64,
        len: u64,
        file_len: u64,
    },
    #[error("read of {wanted} bytes at offset {offset} exceeds mapped region of {len} bytes")]
    OutOfBounds { offset: u64, wanted: u64, len: u64 },
}

/// A read-only mapping over `[offset, offset + len)` of a file. The whole span is one
/// mapping; lookups borrow short-lived [`RegionCursor`]s from it.
#[derive(Debug)]
pub struct MappedRegion {
    path: PathBuf,
    // `None` for an empty span, which cannot be mapped.
    mmap: Option<Mmap>,
}

impl MappedRegion {
    pub fn open(path: &Path, offset: u64, len: u64) -> Result<Self, RegionError> {
        let map_err = |source| RegionError::Map {
            path: path.display().to_string(),
            source,
        };
        let file = File::open(path).map_err(map_err)?;
        let file_len = file.metadata().map_err(map_err)?.len();
        if offset.checked_add(len).is_none_or(|end| end > file_len) {
            return Err(RegionError::OutsideFile {
                path: path.display().to_string(),
                offset,
                len,
                file_len,
            });
        }

        let mmap = if len == 0 {
            None
        } else {
            let len = usize::try_from(len).map_err(|_| {
                map_err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "region larger than the address space",
                ))
            })?;
            // SAFETY: the file is opened read-only and the stores mapped here are never
            // modified after their writer closes them.
            let mmap = unsafe { MmapOptions::new().offset(offset).len(len).map(&file) }
                .map_err(map_err)?;
            mmap.advise(memmap2::Advice::Random).map_err(map_err)?;
            Some(mmap)
        };

        Ok(Self {
            path: path.to_path_buf(),
            mmap,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> u64 {
        self.bytes().len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn bytes(&self) -> &[u8] {
        self.mmap.as_deref().unwrap_or(&[])
    }

    /// Returns a cursor positioned at `offset`, relative to the start of the region.
    pub fn cursor_at(&self, offset: u64) -> Result<RegionCursor<'_>, RegionError> {
        let len = self.len();
        if offset >= len {
            return Err(RegionError::OutOfBounds {
                offset,
                wanted: 1,
                len,
            });
        }
        Ok(RegionCursor {
            bytes: self.bytes(),
            position: offset as usize,
        })
    }
}

/// A forward-reading cursor over a [`MappedRegion`]. Integers are big-endian.
#[derive(Debug)]
pub struct RegionCursor<'a> {
    bytes: &'a [u8],
    position: usize,
}

impl<'a> RegionCursor<'a> {
    pub fn position(&self) -> u64 {
        self.position as u64
    }

    /// Borrows the next `count` bytes without copying.
    pub fn take(&mut self, count: usize) -> Result<&'a [u8], RegionError> {
        let end = self
            .position
            .checked_add(count)
            .filter(|&end| end <= self.bytes.len())
            .ok_or(RegionError::OutOfBounds {
                offset: self.position as u64,
                wanted: count as u64,
                len: self.bytes.len() as u64,
            })?;
        let slice = &self.bytes[self.position..end];
        self.position = end;
        Ok(slice)
    }

    pub fn read_u32(&mut self) -> Result<u32, RegionError> {
        self.take(4).map(BigEndian::read_u32)
    }

    pub fn read_u64(&mut self) -> Result<u64, RegionError> {
        self.take(8).map(BigEndian::read_u64)
    }

    pub fn read_f64(&mut self) -> Result<f64, RegionError> {
        self.take(8).map(BigEndian::read_f64)
    }
}

/// Expands a per-contig file template, e.g. `ld/chr{contig}.tld`.
pub fn contig_path(template: &str, contig: &str) -> PathBuf {
    PathBuf::from(template.replace(CONTIG_PLACEHOLDER, contig))
}
