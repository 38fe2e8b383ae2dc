pub mod clock;
pub mod config;
pub mod error;
pub mod fetch;
pub mod frame;
pub mod pacing;
pub mod parser;
pub mod player;
pub mod ppm_writer;
pub mod raster;
pub mod retry;
pub mod source;

pub use error::{DecodeError, Result};
pub use frame::{Frame, FramePump};
pub use parser::Decoder;
pub use raster::{IndexedRaster, Palette, Raster, RgbPalette};
pub use source::{Buffered, ByteSource, Streaming};
