// ========================================================================================
//                          Length-prefixed compressed blocks
// ========================================================================================

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use flate2::Compression;
use flate2::read::{DeflateDecoder, ZlibDecoder};
use flate2::write::{DeflateEncoder, ZlibEncoder};
use std::io::{self, Read, Write};
use thiserror::Error;

/// The compression flavor of a block. LD matrix files use raw deflate streams, while
/// genotype containers use zlib-wrapped payloads (container compression mode 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockCodec {
    Deflate,
    Zlib,
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("corrupt {codec:?} stream: {source}")]
    Corrupt {
        codec: BlockCodec,
        #[source]
        source: io::Error,
    },
    #[error("decompressed length mismatch (expected {expected} bytes, found {actual})")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("block of {0} bytes does not fit a 4-byte length field")]
    Oversized(usize),
}

// Upper bound on the inflation ratio assumed when reserving output space.
const MAX_RESERVE_RATIO: usize = 64;

/// Compresses the whole input with one streaming encoder. The encoder grows its output
/// as needed, so there is no upper bound on the input size.
pub fn compress(codec: BlockCodec, bytes: &[u8]) -> Result<Vec<u8>, CodecError> {
    let capacity = bytes.len() / 2 + 64;
    let compressed = match codec {
        BlockCodec::Deflate => {
            let mut encoder = DeflateEncoder::new(Vec::with_capacity(capacity), Compression::best());
            encoder.write_all(bytes)?;
            encoder.finish()?
        }
        BlockCodec::Zlib => {
            let mut encoder = ZlibEncoder::new(Vec::with_capacity(capacity), Compression::best());
            encoder.write_all(bytes)?;
            encoder.finish()?
        }
    };
    Ok(compressed)
}

/// Inflates `bytes` and checks that exactly `expected_len` bytes come out.
pub fn decompress_exact(
    codec: BlockCodec,
    bytes: &[u8],
    expected_len: usize,
) -> Result<Vec<u8>, CodecError> {
    // `expected_len` comes from the file; reserve no more than the input can plausibly inflate to.
    let reserve = expected_len.min(bytes.len().saturating_mul(MAX_RESERVE_RATIO));
    let mut out = Vec::with_capacity(reserve);
    // One extra byte lets an over-long stream show up as a mismatch instead of being cut.
    let limit = expected_len as u64 + 1;
    let result = match codec {
        BlockCodec::Deflate => DeflateDecoder::new(bytes).take(limit).read_to_end(&mut out),
        BlockCodec::Zlib => ZlibDecoder::new(bytes).take(limit).read_to_end(&mut out),
    };
    result.map_err(|source| CodecError::Corrupt { codec, source })?;

    if out.len() != expected_len {
        return Err(CodecError::LengthMismatch {
            expected: expected_len,
            actual: out.len(),
        });
    }
    Ok(out)
}

pub(crate) fn checked_u32(len: usize) -> Result<u32, CodecError> {
    u32::try_from(len).map_err(|_| CodecError::Oversized(len))
}

/// Writes `[u32 compressed_len][u32 uncompressed_len][payload]`, big-endian. Returns
/// the number of bytes written.
pub fn write_framed<W: Write>(
    writer: &mut W,
    codec: BlockCodec,
    bytes: &[u8],
) -> Result<u64, CodecError> {
    let compressed = compress(codec, bytes)?;
    writer.write_u32::<BigEndian>(checked_u32(compressed.len())?)?;
    writer.write_u32::<BigEndian>(checked_u32(bytes.len())?)?;
    writer.write_all(&compressed)?;
    Ok(8 + compressed.len() as u64)
}

/// Reads a block written by [`write_framed`].
pub fn read_framed<R: Read>(reader: &mut R, codec: BlockCodec) -> Result<Vec<u8>, CodecError> {
    let compressed_len = reader.read_u32::<BigEndian>()? as usize;
    let uncompressed_len = reader.read_u32::<BigEndian>()? as usize;
    let mut compressed = Vec::new();
    reader
        .by_ref()
        .take(compressed_len as u64)
        .read_to_end(&mut compressed)?;
    if compressed.len() != compressed_len {
        return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
    }
    decompress_exact(codec, &compressed, uncompressed_len)
}
