// ========================================================================================
//                           The sparse LD matrix file layout
// ========================================================================================
//
// header : magic | u64 footer_offset
// body   : block* with block = u32 partner_count | u32 compressed_len | deflate(pairs)
//          pairs = (u32 partner_ordinal | f64 r2) * partner_count
// footer : u32 compressed_len | u32 uncompressed_len | deflate(footer payload)
//
// All integers are big-endian. Body offsets are relative to the end of the header.

use crate::registry::{RegistryError, TABLE_SEPARATOR};
use crate::shared::codec::{CodecError, checked_u32};
use crate::shared::files::RegionError;
use crate::types::LdPartner;
use byteorder::{BigEndian, ByteOrder, ReadBytesExt, WriteBytesExt};
use std::io::{self, Cursor, Read};
use thiserror::Error;

pub const MAGIC: &[u8] = b"Triogen.ldMatrix.1";
pub const HEADER_LEN: u64 = MAGIC.len() as u64 + 8;
pub const EXTENSION: &str = "tld";

#[derive(Debug, Error)]
pub enum LdMatrixError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("{path} is not an LD matrix file (bad magic)")]
    BadMagic { path: String },
    #[error("{path} is truncated ({len} bytes, shorter than the 26-byte header)")]
    Truncated { path: String, len: u64 },
    #[error(
        "{path} has footer offset {offset} outside the file ({file_len} bytes); was the writer closed?"
    )]
    FooterOutOfBounds {
        path: String,
        offset: u64,
        file_len: u64,
    },
    #[error("corrupt footer in {path}: {message}")]
    CorruptFooter { path: String, message: String },
    #[error("corrupt block for variant {id}: {message}")]
    CorruptBlock { id: String, message: String },
    #[error("block for ordinal {source_ordinal} has {partners} partners but {values} r2 values")]
    LengthMismatch {
        source_ordinal: u32,
        partners: usize,
        values: usize,
    },
    #[error("ordinal {ordinal} is not registered (registry holds {len} variants)")]
    UnknownOrdinal { ordinal: u32, len: usize },
    #[error("a block for ordinal {0} was already written")]
    DuplicateBlock(u32),
    #[error("the writer for {0} is already closed")]
    Closed(String),
    #[error("an earlier write to {0} failed; the file is incomplete and was abandoned")]
    Poisoned(String),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Region(#[from] RegionError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl LdMatrixError {
    pub(crate) fn io(path: &std::path::Path) -> impl FnOnce(io::Error) -> Self + '_ {
        move |source| LdMatrixError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

/// Serialises the (ordinal, r²) pairs of one block.
pub(crate) fn encode_pairs(partners: &[u32], r2: &[f64], out: &mut Vec<u8>) {
    out.clear();
    out.reserve(partners.len() * LdPartner::ENCODED_LEN);
    for (&ordinal, &value) in partners.iter().zip(r2) {
        out.extend_from_slice(&ordinal.to_be_bytes());
        out.extend_from_slice(&value.to_be_bytes());
    }
}

pub(crate) fn decode_pairs(payload: &[u8]) -> Vec<LdPartner> {
    payload
        .chunks_exact(LdPartner::ENCODED_LEN)
        .map(|pair| LdPartner {
            ordinal: BigEndian::read_u32(&pair[..4]),
            r2: BigEndian::read_f64(&pair[4..]),
        })
        .collect()
}

/// The decoded footer: the writer's whole ordinal space plus one entry per block.
#[derive(Debug, Default, PartialEq)]
pub(crate) struct Footer {
    pub ids: Vec<String>,
    pub aliases: Vec<String>,
    pub blocks: Vec<(u32, u64)>,
}

fn join_table(values: &[String]) -> String {
    let mut joined = String::new();
    for (i, value) in values.iter().enumerate() {
        if i > 0 {
            joined.push(TABLE_SEPARATOR);
        }
        joined.push_str(value);
    }
    joined
}

fn split_table(joined: &str, expected: usize) -> Option<Vec<String>> {
    if expected == 0 {
        return joined.is_empty().then(Vec::new);
    }
    let values: Vec<String> = joined.split(TABLE_SEPARATOR).map(str::to_string).collect();
    (values.len() == expected).then_some(values)
}

impl Footer {
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let ids = join_table(&self.ids);
        let aliases = join_table(&self.aliases);
        let mut out = Vec::with_capacity(16 + ids.len() + aliases.len() + self.blocks.len() * 12);
        // Writes into a Vec cannot fail.
        out.write_u32::<BigEndian>(checked_u32(self.ids.len())?)?;
        out.write_u32::<BigEndian>(checked_u32(ids.len())?)?;
        out.extend_from_slice(ids.as_bytes());
        out.write_u32::<BigEndian>(checked_u32(aliases.len())?)?;
        out.extend_from_slice(aliases.as_bytes());
        out.write_u32::<BigEndian>(checked_u32(self.blocks.len())?)?;
        for &(ordinal, offset) in &self.blocks {
            out.write_u32::<BigEndian>(ordinal)?;
            out.write_u64::<BigEndian>(offset)?;
        }
        Ok(out)
    }

    /// Parses a footer payload; the error is a human-readable reason.
    pub fn decode(payload: &[u8]) -> Result<Self, String> {
        let mut cursor = Cursor::new(payload);
        let short = |e: io::Error| format!("malformed footer: {e}");

        let n_ids = cursor.read_u32::<BigEndian>().map_err(short)? as usize;
        let ids = read_string(&mut cursor).map_err(short)?;
        let aliases = read_string(&mut cursor).map_err(short)?;
        let ids = split_table(&ids, n_ids)
            .ok_or_else(|| format!("id table does not hold {n_ids} ids"))?;
        let aliases = split_table(&aliases, n_ids)
            .ok_or_else(|| format!("alias table does not hold {n_ids} aliases"))?;

        let n_blocks = cursor.read_u32::<BigEndian>().map_err(short)? as usize;
        let remaining = payload.len() as u64 - cursor.position();
        if remaining != n_blocks as u64 * 12 {
            return Err(format!(
                "block table of {n_blocks} entries does not match the {remaining} remaining bytes"
            ));
        }
        let mut blocks = Vec::with_capacity(n_blocks);
        for _ in 0..n_blocks {
            let ordinal = cursor.read_u32::<BigEndian>().map_err(short)?;
            let offset = cursor.read_u64::<BigEndian>().map_err(short)?;
            if ordinal as usize >= n_ids {
                return Err(format!("block entry references ordinal {ordinal} of {n_ids}"));
            }
            blocks.push((ordinal, offset));
        }

        Ok(Self {
            ids,
            aliases,
            blocks,
        })
    }
}

fn read_string(cursor: &mut Cursor<&[u8]>) -> io::Result<String> {
    let len = cursor.read_u32::<BigEndian>()? as usize;
    let remaining = cursor.get_ref().len() as u64 - cursor.position();
    if len as u64 > remaining {
        return Err(io::ErrorKind::UnexpectedEof.into());
    }
    let mut bytes = vec![0u8; len];
    cursor.read_exact(&mut bytes)?;
    String::from_utf8(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}
