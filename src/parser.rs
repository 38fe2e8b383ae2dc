mod bin;
mod bit_reader;
mod block_reader;
mod gif;
mod lzw;

pub use bin::{BinDecoder, BinLayout, BinOptions, Buffering};
pub use block_reader::BlockReader;
pub use gif::{closest_color, GifDecoder, GifFrame, LogicalScreenDescriptor, LoopCount, Version};
pub use lzw::{Code, Dictionary, LzwDecoder, MAX_ENTRIES};

use crate::error::Result;
use crate::frame::{Frame, FramePump};
use crate::raster::{Palette, Raster};
use crate::source::ByteSource;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisposalMethod {
    DoNotDispose = 1,
    RestoreToBackgroundColor = 2,
    RestoreToPrevious = 3,
}

impl DisposalMethod {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(DisposalMethod::DoNotDispose),
            2 => Some(DisposalMethod::RestoreToBackgroundColor),
            3 => Some(DisposalMethod::RestoreToPrevious),
            _ => None,
        }
    }
}

/// Either container, picked by sniffing the first bytes of the stream.
pub enum Decoder<S, R, P> {
    Gif(GifDecoder<S, R, P>),
    Bin(BinDecoder<S, R, P>),
}

impl<S, R, P> Decoder<S, R, P>
where
    S: ByteSource,
    R: Raster,
    P: Palette,
{
    /// Anything starting with `GIF8` is a GIF; everything else is read as BIN.
    pub fn open(mut source: S, bin: BinOptions) -> Result<Self> {
        let mut magic = [0; 4];
        let len = source.peek(&mut magic)?;
        if &magic[..len] == b"GIF8" {
            Ok(Decoder::Gif(GifDecoder::new(source)?))
        } else {
            Ok(Decoder::Bin(BinDecoder::new(source, bin)?))
        }
    }
}

impl<S, R, P> FramePump for Decoder<S, R, P>
where
    S: ByteSource,
    R: Raster,
    P: Palette,
{
    type Raster = R;
    type Palette = P;

    fn has_next_frame(&self) -> bool {
        match self {
            Decoder::Gif(gif) => gif.has_next_frame(),
            Decoder::Bin(bin) => bin.has_next_frame(),
        }
    }

    fn next_frame(&mut self) -> Result<Option<Frame<'_, R, P>>> {
        match self {
            Decoder::Gif(gif) => gif.next_frame(),
            Decoder::Bin(bin) => bin.next_frame(),
        }
    }

    fn rewind(&mut self) -> Result<()> {
        match self {
            Decoder::Gif(gif) => gif.rewind(),
            Decoder::Bin(bin) => bin.rewind(),
        }
    }

    fn prefetch(&mut self, n: usize) {
        match self {
            Decoder::Gif(gif) => gif.prefetch(n),
            Decoder::Bin(bin) => bin.prefetch(n),
        }
    }
}
