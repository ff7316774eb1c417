#![deny(unused_variables)]
#![deny(clippy::no_effect_underscore_binding)]
pub mod config;
pub mod format;
pub mod pipeline;
pub mod prune;
pub mod reader;
pub mod registry;
#[path = "../shared/codec.rs"]
pub mod shared_codec;
#[path = "../shared/files.rs"]
pub mod shared_files;
pub mod types;
pub mod writer;
pub mod shared {
    pub use super::shared_codec as codec;
    pub use super::shared_files as files;
}

#[path = "../window/mod.rs"]
pub mod window;

#[path = "../container/mod.rs"]
pub mod container;

pub use config::LdSettings;
pub use reader::{LdMatrixReader, LdMatrixSet};
pub use registry::VariantRegistry;
pub use types::{LdPartner, VariantInformation};
pub use writer::LdMatrixWriter;
