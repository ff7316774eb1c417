pub mod buffer;
pub mod stream;

pub use buffer::{
    BufferedGenotypeWindow, RecordFilter, WindowError, WindowItem, WindowSettings, WindowState,
};
pub use stream::{GenotypeRecord, GenotypeStream, Locus, StreamError, VecStream};
