use log::debug;

use crate::error::{DecodeError, Result};
use crate::frame::{Frame, FramePump};
use crate::raster::{pack_rgb, Palette, Raster};
use crate::source::ByteSource;

pub const PALETTE_LEN: usize = 256;

/// Where the frame count sits in the header. Both encoders are still in the field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BinLayout {
    /// `u8 width, u8 height, u16 frame_count`
    #[default]
    FrameCountU16,
    /// Legacy: `u8 width, u8 height, u8 frame_count`
    FrameCountU8,
}

impl BinLayout {
    pub fn header_len(self) -> usize {
        match self {
            BinLayout::FrameCountU16 => 4,
            BinLayout::FrameCountU8 => 3,
        }
    }
}

/// How decoded pixels reach the raster handed to the display.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Buffering {
    /// One raster, overwritten in place every frame.
    Single,
    /// Decode into a hidden raster, then swap it to the front.
    #[default]
    Double,
    /// A new raster per frame; the previous one is released first.
    Fresh,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BinOptions {
    pub layout: BinLayout,
    pub buffering: Buffering,
    /// Start over after the last frame. Needs a seekable source.
    pub looping: bool,
}

pub struct BinDecoder<S, R, P> {
    source: S,
    options: BinOptions,
    width: u8,
    height: u8,
    frame_count: u16,
    palette: P,
    primary: R,
    secondary: Option<R>,
    front_is_secondary: bool,
    row: Box<[u8]>,
    delay_ms: u32,
    frames_read: u16,
    finished: bool,
}

impl<S, R, P> BinDecoder<S, R, P>
where
    S: ByteSource,
    R: Raster,
    P: Palette,
{
    /// Reads the header and palette and allocates the raster(s) for the whole run.
    pub fn new(mut source: S, options: BinOptions) -> Result<Self> {
        let width = source.read_byte("BIN header")?;
        let height = source.read_byte("BIN header")?;
        let frame_count = match options.layout {
            BinLayout::FrameCountU16 => source.read_u16_le("BIN header")?,
            BinLayout::FrameCountU8 => source.read_byte("BIN header")?.into(),
        };
        debug!("BIN header: {width}x{height}, {frame_count} frames, {:?}", options);

        let mut palette = P::with_capacity(PALETTE_LEN);
        let mut rgb = [0; 3];
        for i in 0..PALETTE_LEN {
            source.read_exact(&mut rgb, "BIN palette")?;
            palette.set(i, pack_rgb(rgb));
        }

        let secondary = match options.buffering {
            Buffering::Double => Some(R::new(width.into(), height.into())),
            Buffering::Single | Buffering::Fresh => None,
        };

        Ok(Self {
            source,
            options,
            width,
            height,
            frame_count,
            palette,
            primary: R::new(width.into(), height.into()),
            secondary,
            front_is_secondary: false,
            row: vec![0; width.into()].into_boxed_slice(),
            delay_ms: 0,
            frames_read: 0,
            finished: false,
        })
    }

    pub fn width(&self) -> u8 {
        self.width
    }

    pub fn height(&self) -> u8 {
        self.height
    }

    pub fn frame_count(&self) -> u16 {
        self.frame_count
    }

    pub fn frames_read(&self) -> u16 {
        self.frames_read
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn palette(&self) -> &P {
        &self.palette
    }

    /// The fully written raster of the last decoded frame.
    pub fn raster(&self) -> &R {
        match (&self.secondary, self.front_is_secondary) {
            (Some(secondary), true) => secondary,
            _ => &self.primary,
        }
    }

    /// Seeks back to the first frame. Palette and rasters are kept as they are.
    pub fn reset(&mut self) -> Result<()> {
        self.source
            .seek_to(self.options.layout.header_len() + PALETTE_LEN * 3)?;
        self.frames_read = 0;
        self.finished = false;
        Ok(())
    }

    /// Decodes the next frame and returns its delay, or `None` when the stream is done.
    /// A short read finishes the decoder for good.
    pub fn read_next_frame(&mut self) -> Result<Option<u32>> {
        if self.finished {
            return Ok(None);
        }

        if self.frames_read >= self.frame_count {
            if !self.options.looping || self.frame_count == 0 {
                self.finished = true;
                return Ok(None);
            }
            if !self.source.is_seekable() {
                self.finished = true;
                return Err(DecodeError::UnsupportedOperation(
                    "looping a BIN stream that cannot seek",
                ));
            }
            debug!("looping BIN stream after {} frames", self.frames_read);
            if let Err(error) = self.reset() {
                self.finished = true;
                return Err(error);
            }
        }

        match self.decode_frame() {
            Ok(delay_ms) => {
                self.delay_ms = delay_ms;
                self.frames_read += 1;
                Ok(Some(delay_ms))
            }
            Err(error) => {
                self.finished = true;
                Err(error)
            }
        }
    }

    fn decode_frame(&mut self) -> Result<u32> {
        let delay_ms = self.source.read_u16_le("frame delay")?.into();

        match self.options.buffering {
            Buffering::Single => {
                read_pixels(&mut self.source, &mut self.row, &mut self.primary)?;
            }
            Buffering::Fresh => {
                self.primary = R::new(self.width.into(), self.height.into());
                read_pixels(&mut self.source, &mut self.row, &mut self.primary)?;
            }
            Buffering::Double => {
                let back = match (&mut self.secondary, self.front_is_secondary) {
                    (Some(secondary), false) => secondary,
                    _ => &mut self.primary,
                };
                read_pixels(&mut self.source, &mut self.row, back)?;
                self.front_is_secondary = !self.front_is_secondary;
            }
        }

        Ok(delay_ms)
    }
}

fn read_pixels<S, R>(source: &mut S, row: &mut [u8], raster: &mut R) -> Result<()>
where
    S: ByteSource,
    R: Raster,
{
    for y in 0..raster.height() {
        source.read_exact(row, "pixel row")?;
        for (x, index) in row.iter().enumerate() {
            raster.set(x as u16, y, *index);
        }
    }
    Ok(())
}

impl<S, R, P> FramePump for BinDecoder<S, R, P>
where
    S: ByteSource,
    R: Raster,
    P: Palette,
{
    type Raster = R;
    type Palette = P;

    fn has_next_frame(&self) -> bool {
        !self.finished
    }

    fn next_frame(&mut self) -> Result<Option<Frame<'_, R, P>>> {
        let Some(delay_ms) = self.read_next_frame()? else {
            return Ok(None);
        };
        Ok(Some(Frame {
            raster: self.raster(),
            palette: &self.palette,
            delay_ms,
            left: 0,
            top: 0,
        }))
    }

    fn rewind(&mut self) -> Result<()> {
        self.reset()
    }

    fn prefetch(&mut self, n: usize) {
        self.source.prefetch(n);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::{IndexedRaster, RgbPalette};
    use crate::source::{Buffered, Streaming};

    type Decoder<S> = BinDecoder<S, IndexedRaster, RgbPalette>;

    fn bin(layout: BinLayout, width: u8, height: u8, frames: &[(u16, Vec<u8>)]) -> Vec<u8> {
        let mut out = vec![width, height];
        match layout {
            BinLayout::FrameCountU16 => {
                out.extend_from_slice(&(frames.len() as u16).to_le_bytes())
            }
            BinLayout::FrameCountU8 => out.push(frames.len() as u8),
        }
        for i in 0..PALETTE_LEN {
            out.extend_from_slice(&[i as u8, 255 - i as u8, 7]);
        }
        for (delay, pixels) in frames {
            out.extend_from_slice(&delay.to_le_bytes());
            out.extend_from_slice(pixels);
        }
        out
    }

    fn three_frames() -> Vec<(u16, Vec<u8>)> {
        vec![
            (100, vec![1, 2, 3, 4, 5, 6]),
            (200, vec![6, 5, 4, 3, 2, 1]),
            (300, vec![9, 9, 9, 0, 0, 0]),
        ]
    }

    fn options(buffering: Buffering) -> BinOptions {
        BinOptions {
            buffering,
            ..BinOptions::default()
        }
    }

    fn decode_all<S: ByteSource>(decoder: &mut Decoder<S>) -> Vec<(u32, Vec<u8>, *const u8)> {
        let mut out = Vec::new();
        while let Some(frame) = decoder.next_frame().unwrap() {
            out.push((
                frame.delay_ms,
                frame.raster.pixels().to_vec(),
                frame.raster.pixels().as_ptr(),
            ));
        }
        out
    }

    #[test]
    fn decodes_every_strategy_identically() {
        let data = bin(BinLayout::FrameCountU16, 3, 2, &three_frames());
        for buffering in [Buffering::Single, Buffering::Double, Buffering::Fresh] {
            let mut decoder =
                Decoder::new(Buffered::new(data.clone()), options(buffering)).unwrap();
            let frames = decode_all(&mut decoder);
            let decoded: Vec<_> = frames.iter().map(|(d, p, _)| (*d as u16, p.clone())).collect();
            assert_eq!(decoded, three_frames(), "{buffering:?}");
            assert!(decoder.is_finished());
        }
    }

    #[test]
    fn legacy_u8_frame_count() {
        let data = bin(BinLayout::FrameCountU8, 3, 2, &three_frames());
        let options = BinOptions {
            layout: BinLayout::FrameCountU8,
            ..BinOptions::default()
        };
        let mut decoder = Decoder::new(Buffered::new(data), options).unwrap();
        assert_eq!(decoder.frame_count(), 3);
        assert_eq!(decode_all(&mut decoder).len(), 3);
        decoder.reset().unwrap();
        assert_eq!(decoder.read_next_frame().unwrap(), Some(100));
    }

    #[test]
    fn palette_is_read_in_full() {
        let data = bin(BinLayout::FrameCountU16, 3, 2, &three_frames());
        let decoder = Decoder::new(Buffered::new(data), BinOptions::default()).unwrap();
        assert_eq!(decoder.palette().len(), 256);
        assert_eq!(decoder.palette().get(0), Some(0x00ff07));
        assert_eq!(decoder.palette().get(255), Some(0xff0007));
    }

    #[test]
    fn reset_replays_without_reallocating() {
        let data = bin(BinLayout::FrameCountU16, 3, 2, &three_frames());
        for buffering in [Buffering::Single, Buffering::Double] {
            let mut decoder =
                Decoder::new(Buffered::new(data.clone()), options(buffering)).unwrap();
            let palette = decoder.palette().colors().as_ptr();
            let first = decode_all(&mut decoder);
            decoder.reset().unwrap();
            let second = decode_all(&mut decoder);

            assert_eq!(decoder.palette().colors().as_ptr(), palette);
            let contents = |frames: &[(u32, Vec<u8>, *const u8)]| {
                frames.iter().map(|(d, p, _)| (*d, p.clone())).collect::<Vec<_>>()
            };
            assert_eq!(contents(&first), contents(&second));

            let mut slots: Vec<_> = first.iter().map(|(_, _, ptr)| *ptr).collect();
            slots.sort();
            slots.dedup();
            assert!(second.iter().all(|(_, _, ptr)| slots.contains(ptr)));
            let expected_slots = if buffering == Buffering::Double { 2 } else { 1 };
            assert_eq!(slots.len(), expected_slots);
        }
    }

    #[test]
    fn double_buffer_never_exposes_partial_frame() {
        let mut data = bin(BinLayout::FrameCountU16, 3, 2, &three_frames());
        // cut the second frame after its first row
        data.truncate(4 + 768 + 2 + 6 + 2 + 3);
        let mut decoder = Decoder::new(Buffered::new(data), options(Buffering::Double)).unwrap();
        decoder.read_next_frame().unwrap();
        assert!(matches!(
            decoder.read_next_frame(),
            Err(DecodeError::IncompleteData { .. })
        ));
        assert_eq!(decoder.raster().pixels(), &[1, 2, 3, 4, 5, 6]);
        assert!(decoder.is_finished());
        assert_eq!(decoder.read_next_frame().unwrap(), None);
    }

    #[test]
    fn truncated_palette_is_incomplete() {
        let data = bin(BinLayout::FrameCountU16, 3, 2, &[]);
        assert!(matches!(
            Decoder::new(Buffered::new(data[..100].to_vec()), BinOptions::default()),
            Err(DecodeError::IncompleteData { .. })
        ));
    }

    #[test]
    fn looping_a_buffered_stream_wraps_around() {
        let data = bin(BinLayout::FrameCountU16, 3, 2, &three_frames());
        let options = BinOptions {
            looping: true,
            ..BinOptions::default()
        };
        let mut decoder = Decoder::new(Buffered::new(data), options).unwrap();
        let delays: Vec<_> = (0..5).map(|_| decoder.read_next_frame().unwrap()).collect();
        assert_eq!(delays, [100, 200, 300, 100, 200].map(Some));
    }

    #[test]
    fn looping_a_stream_is_unsupported() {
        let data = bin(BinLayout::FrameCountU16, 3, 2, &three_frames());
        let chunks: Vec<std::io::Result<Vec<u8>>> =
            data.chunks(64).map(|c| Ok(c.to_vec())).collect();
        let options = BinOptions {
            looping: true,
            ..BinOptions::default()
        };
        let mut decoder = Decoder::new(Streaming::new(chunks.into_iter()), options).unwrap();
        for _ in 0..3 {
            assert!(decoder.read_next_frame().unwrap().is_some());
        }
        assert!(matches!(
            decoder.read_next_frame(),
            Err(DecodeError::UnsupportedOperation(_))
        ));
        assert!(decoder.rewind().is_err());
    }
}
