// ========================================================================================
//                     Genotype container header and sample block
// ========================================================================================
//
// offset u32 | header_len u32 | n_variants u32 | n_samples u32 | magic [4] | free data |
// flags u32 | sample block | variants...
//
// All integers are little-endian. The first variant starts at `4 + offset`.

use super::ContainerError;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

pub const MAGIC: [u8; 4] = *b"bgen";
const EMPTY_MAGIC: [u8; 4] = [0; 4];
/// Fixed part of the header block: its own length, two counts, magic and flags.
const FIXED_HEADER_LEN: u32 = 20;
const FREE_DATA: &[u8] = b"triogen-0.5.0";

pub const COMPRESSION_ZLIB: u32 = 1;
pub const LAYOUT_2: u32 = 2;
const COMPRESSION_MASK: u32 = 0b11;
const LAYOUT_SHIFT: u32 = 2;
const LAYOUT_MASK: u32 = 0b1111;
const SAMPLE_IDS_FLAG: u32 = 1 << 31;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHeader {
    pub offset: u32,
    pub header_len: u32,
    pub n_variants: u32,
    pub n_samples: u32,
    pub free_data: Vec<u8>,
    pub flags: u32,
}

impl ContainerHeader {
    /// The header a [`super::ContainerWriter`] emits: zlib, layout 2, sample identifiers.
    pub fn for_samples(n_samples: u32, sample_block_len: u32) -> Self {
        let header_len = FIXED_HEADER_LEN + FREE_DATA.len() as u32;
        Self {
            offset: header_len + sample_block_len,
            header_len,
            n_variants: 0,
            n_samples,
            free_data: FREE_DATA.to_vec(),
            flags: COMPRESSION_ZLIB | (LAYOUT_2 << LAYOUT_SHIFT) | SAMPLE_IDS_FLAG,
        }
    }

    pub fn compression(&self) -> u32 {
        self.flags & COMPRESSION_MASK
    }

    pub fn layout(&self) -> u32 {
        (self.flags >> LAYOUT_SHIFT) & LAYOUT_MASK
    }

    pub fn has_sample_ids(&self) -> bool {
        self.flags & SAMPLE_IDS_FLAG != 0
    }

    /// Absolute file position of the first variant record.
    pub fn first_variant_position(&self) -> u64 {
        4 + u64::from(self.offset)
    }

    /// Absolute file position of the sample identifier block.
    pub fn sample_block_position(&self) -> u64 {
        4 + u64::from(self.header_len)
    }

    /// Reads and validates the header. Unsupported capabilities fail here.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self, ContainerError> {
        let offset = read_u32(reader)?;
        let header_len = read_u32(reader)?;
        if header_len < FIXED_HEADER_LEN {
            return Err(ContainerError::HeaderTooSmall(header_len));
        }
        if header_len > offset {
            return Err(ContainerError::HeaderBeyondOffset {
                header_len,
                sample_len: 0,
                offset,
            });
        }
        let n_variants = read_u32(reader)?;
        let n_samples = read_u32(reader)?;
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic).map_err(ContainerError::Read)?;
        if magic != MAGIC && magic != EMPTY_MAGIC {
            return Err(ContainerError::BadMagic(magic));
        }
        let free_data = read_bytes(reader, (header_len - FIXED_HEADER_LEN) as usize)?;
        let flags = read_u32(reader)?;

        let header = Self {
            offset,
            header_len,
            n_variants,
            n_samples,
            free_data,
            flags,
        };
        header.validate()?;
        Ok(header)
    }

    pub fn validate(&self) -> Result<(), ContainerError> {
        if self.compression() != COMPRESSION_ZLIB {
            return Err(ContainerError::UnsupportedCompression(self.compression()));
        }
        if self.layout() != LAYOUT_2 {
            return Err(ContainerError::UnsupportedLayout(self.layout()));
        }
        if !self.has_sample_ids() {
            return Err(ContainerError::MissingSampleIds);
        }
        Ok(())
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_u32::<LittleEndian>(self.offset)?;
        writer.write_u32::<LittleEndian>(self.header_len)?;
        writer.write_u32::<LittleEndian>(self.n_variants)?;
        writer.write_u32::<LittleEndian>(self.n_samples)?;
        writer.write_all(&MAGIC)?;
        writer.write_all(&self.free_data)?;
        writer.write_u32::<LittleEndian>(self.flags)
    }
}

/// Reads the sample identifier block that follows the header. The reader must be
/// positioned at [`ContainerHeader::sample_block_position`].
pub fn read_sample_ids<R: Read>(
    reader: &mut R,
    header: &ContainerHeader,
) -> Result<Vec<String>, ContainerError> {
    let block_len = read_u32(reader)?;
    if u64::from(block_len) + u64::from(header.header_len) > u64::from(header.offset) {
        return Err(ContainerError::HeaderBeyondOffset {
            header_len: header.header_len,
            sample_len: block_len,
            offset: header.offset,
        });
    }
    let n_samples = read_u32(reader)?;
    if n_samples != header.n_samples {
        return Err(ContainerError::SampleCountMismatch {
            header: header.n_samples,
            block: n_samples,
        });
    }
    (0..n_samples)
        .map(|_| read_u16_string(reader, "sample identifier"))
        .collect()
}

/// Encodes a sample identifier block.
pub fn encode_sample_ids(samples: &[String]) -> Result<Vec<u8>, ContainerError> {
    let body_len: usize = samples.iter().map(|s| 2 + s.len()).sum();
    let block_len = u32::try_from(8 + body_len).map_err(|_| ContainerError::InvalidVariant {
        id: "<samples>".to_string(),
        message: "sample identifier block exceeds 4 GiB".to_string(),
    })?;
    let n_samples = u32::try_from(samples.len()).map_err(|_| ContainerError::InvalidVariant {
        id: "<samples>".to_string(),
        message: "too many samples".to_string(),
    })?;
    let mut block = Vec::with_capacity(block_len as usize);
    block.write_u32::<LittleEndian>(block_len).map_err(ContainerError::Read)?;
    block.write_u32::<LittleEndian>(n_samples).map_err(ContainerError::Read)?;
    for sample in samples {
        write_u16_string(&mut block, sample, "sample identifier")?;
    }
    Ok(block)
}

pub(crate) fn read_u32<R: Read>(reader: &mut R) -> Result<u32, ContainerError> {
    reader
        .read_u32::<LittleEndian>()
        .map_err(ContainerError::Read)
}

pub(crate) fn read_u16<R: Read>(reader: &mut R) -> Result<u16, ContainerError> {
    reader
        .read_u16::<LittleEndian>()
        .map_err(ContainerError::Read)
}

/// Reads exactly `len` bytes. The buffer grows with the data actually present, so a
/// corrupt length field fails at end of file rather than allocating up front.
fn read_bytes<R: Read>(reader: &mut R, len: usize) -> Result<Vec<u8>, ContainerError> {
    let mut bytes = Vec::new();
    reader
        .by_ref()
        .take(len as u64)
        .read_to_end(&mut bytes)
        .map_err(ContainerError::Read)?;
    if bytes.len() != len {
        return Err(ContainerError::Read(io::ErrorKind::UnexpectedEof.into()));
    }
    Ok(bytes)
}

fn read_text<R: Read>(
    reader: &mut R,
    len: usize,
    what: &'static str,
) -> Result<String, ContainerError> {
    let bytes = read_bytes(reader, len)?;
    String::from_utf8(bytes).map_err(|_| ContainerError::InvalidText { what })
}

pub(crate) fn read_u16_string<R: Read>(
    reader: &mut R,
    what: &'static str,
) -> Result<String, ContainerError> {
    let len = read_u16(reader)? as usize;
    read_text(reader, len, what)
}

pub(crate) fn read_u32_string<R: Read>(
    reader: &mut R,
    what: &'static str,
) -> Result<String, ContainerError> {
    let len = read_u32(reader)? as usize;
    read_text(reader, len, what)
}

pub(crate) fn write_u16_string(
    out: &mut Vec<u8>,
    value: &str,
    what: &'static str,
) -> Result<(), ContainerError> {
    let len = u16::try_from(value.len()).map_err(|_| ContainerError::InvalidVariant {
        id: value.chars().take(32).collect(),
        message: format!("{what} longer than {} bytes", u16::MAX),
    })?;
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(value.as_bytes());
    Ok(())
}

pub(crate) fn write_u32_string(out: &mut Vec<u8>, value: &str) -> Result<(), ContainerError> {
    let len = u32::try_from(value.len()).map_err(|_| ContainerError::InvalidVariant {
        id: value.chars().take(32).collect(),
        message: "allele longer than 4 GiB".to_string(),
    })?;
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(value.as_bytes());
    Ok(())
}
