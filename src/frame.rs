use crate::error::Result;
use crate::raster::{Palette, Raster};

/// One decoded frame, borrowed from its container. A reused raster is only valid until the
/// next call to [`FramePump::next_frame`].
#[derive(Debug)]
pub struct Frame<'a, R, P> {
    pub raster: &'a R,
    pub palette: &'a P,
    pub delay_ms: u32,
    /// Offset on the logical screen. Always zero for BIN frames.
    pub left: u16,
    pub top: u16,
}

/// The surface both containers expose to the pacing loop.
pub trait FramePump {
    type Raster: Raster;
    type Palette: Palette;

    fn has_next_frame(&self) -> bool;

    /// `Ok(None)` once the stream is finished. An error is fatal to the container.
    fn next_frame(&mut self) -> Result<Option<Frame<'_, Self::Raster, Self::Palette>>>;

    /// Repositions at the first frame for another pass.
    fn rewind(&mut self) -> Result<()>;

    /// Passes a read-ahead hint down to the byte source.
    fn prefetch(&mut self, n: usize);
}
