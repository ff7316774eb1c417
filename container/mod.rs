pub mod header;
pub mod index;
pub mod reader;
pub mod writer;

pub use header::ContainerHeader;
pub use index::{SIDECAR_VERSION_LINE, VariantIndex, default_sidecar_path};
pub use reader::{ContainerStream, VariantGenotypes};
pub use writer::ContainerWriter;

use crate::shared::codec::CodecError;
use crate::shared::files::RegionError;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to read container data: {0}")]
    Read(#[source] io::Error),
    #[error("magic number {0:?} should be 'bgen' or four zero bytes")]
    BadMagic([u8; 4]),
    #[error("header block of {0} bytes is smaller than the 20 required")]
    HeaderTooSmall(u32),
    #[error(
        "header block ({header_len} bytes) and sample block ({sample_len} bytes) overrun the variant offset {offset}"
    )]
    HeaderBeyondOffset {
        header_len: u32,
        sample_len: u32,
        offset: u32,
    },
    #[error("compression mode {0} is not supported (only zlib, mode 1)")]
    UnsupportedCompression(u32),
    #[error("record layout {0} is not supported (only layout 2)")]
    UnsupportedLayout(u32),
    #[error("containers without stored sample identifiers are not supported")]
    MissingSampleIds,
    #[error("sample count mismatch between header ({header}) and identifier block ({block})")]
    SampleCountMismatch { header: u32, block: u32 },
    #[error("{what} is not valid UTF-8")]
    InvalidText { what: &'static str },
    #[error("invalid variant {id}: {message}")]
    InvalidVariant { id: String, message: String },
    #[error("unsupported genotype payload for variant {id}: {message}")]
    UnsupportedPayload { id: String, message: String },
    #[error("malformed sidecar {path} at line {line}: {message}")]
    Sidecar {
        path: String,
        line: usize,
        message: String,
    },
    #[error("sidecar {path} has version line {found:?}, expected {expected:?}")]
    SidecarVersion {
        path: String,
        found: String,
        expected: &'static str,
    },
    #[error("variant ordinal {ordinal} out of range ({len} variants)")]
    OrdinalOutOfRange { ordinal: usize, len: usize },
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Region(#[from] RegionError),
}

impl ContainerError {
    pub(crate) fn io(path: &std::path::Path) -> impl FnOnce(io::Error) -> Self + '_ {
        move |source| ContainerError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}
