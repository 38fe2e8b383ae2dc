use std::collections::HashMap;
use std::rc::Rc;

use log::debug;

use super::block_reader::BlockReader;
use super::lzw::LzwDecoder;
use super::DisposalMethod;
use crate::error::{DecodeError, Result};
use crate::frame::{Frame, FramePump};
use crate::raster::{pack_rgb, unpack_rgb, Palette, Raster};
use crate::source::ByteSource;

const EXTENSION_INTRODUCER: u8 = 0x21;
const IMAGE_DESCRIPTOR_LABEL: u8 = 0x2c;
const TRAILER_LABEL: u8 = 0x3b;

// Extension labels
const APPLICATION_EXTENSION: u8 = 0xff;
const GRAPHIC_CONTROL_EXTENSION: u8 = 0xf9;

const HEADER_LEN: usize = 13;
const MAX_MIN_CODE_SIZE: u8 = 11;
/// Distinct local palettes remembered per decoder before the cache starts over.
const MAX_CACHED_REMAPS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    V87a,
    V89a,
}

impl TryFrom<&[u8]> for Version {
    type Error = DecodeError;

    fn try_from(value: &[u8]) -> std::result::Result<Self, Self::Error> {
        match value {
            b"GIF87a" => Ok(Version::V87a),
            b"GIF89a" => Ok(Version::V89a),
            other => Err(DecodeError::UnsupportedFormat(format!(
                "bad GIF signature {:?}",
                String::from_utf8_lossy(other)
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopCount {
    Infinite,
    Number(u16),
}

#[derive(Debug, Clone, Copy)]
pub struct LogicalScreenDescriptor {
    pub screen_width: u16,
    pub screen_height: u16,
    pub global_color_table_flag: bool,
    pub color_resolution: u8,
    pub global_color_table_len: usize,
    pub background_color_index: u8,
    pub pixel_aspect_ratio: u8,
}

#[derive(Debug, Clone, Copy, Default)]
struct GraphicControlExtension {
    disposal_method: Option<DisposalMethod>,
    transparent_color_index: Option<u8>,
    delay_ms: u32,
}

#[derive(Debug)]
pub struct GifFrame<R, P> {
    pub left: u16,
    pub top: u16,
    pub width: u16,
    pub height: u16,
    pub delay_ms: u32,
    pub disposal_method: Option<DisposalMethod>,
    pub transparent_color_index: Option<u8>,
    pub raster: R,
    /// Only set when the stream has no global palette to remap into.
    pub local_palette: Option<P>,
}

/// Pull decoder for GIF streams: one frame per call, nothing retained between frames except
/// the global palette and the remap cache.
pub struct GifDecoder<S, R, P> {
    source: S,
    version: Version,
    screen: LogicalScreenDescriptor,
    global_palette: P,
    data_start: usize,
    loop_count: Option<LoopCount>,
    remap_cache: HashMap<Box<[u8]>, Rc<[u8]>>,
    remap_builds: usize,
    frame: Option<GifFrame<R, P>>,
    frames_read: usize,
    finished: bool,
}

impl<S, R, P> GifDecoder<S, R, P>
where
    S: ByteSource,
    R: Raster,
    P: Palette,
{
    /// Reads the header and global palette.
    pub fn new(mut source: S) -> Result<Self> {
        let mut signature = [0; 6];
        source.read_exact(&mut signature, "GIF signature")?;
        let version = Version::try_from(&signature[..])?;
        debug!("processed signature, got {:?}", version);

        let screen_width = source.read_u16_le("logical screen width")?;
        let screen_height = source.read_u16_le("logical screen height")?;
        let packed_fields = source.read_byte("logical screen flags")?;
        let background_color_index = source.read_byte("background color index")?;
        let pixel_aspect_ratio = source.read_byte("pixel aspect ratio")?;

        let global_color_table_flag = packed_fields & 0b1000_0000 != 0;
        let screen = LogicalScreenDescriptor {
            screen_width,
            screen_height,
            global_color_table_flag,
            color_resolution: ((packed_fields >> 4) & 0b111) + 1,
            global_color_table_len: if global_color_table_flag {
                color_table_len(packed_fields)
            } else {
                0
            },
            background_color_index,
            pixel_aspect_ratio,
        };
        debug!("processed logical screen descriptor, got: {:?}", screen);

        let global_palette = read_palette(&mut source, screen.global_color_table_len)?;

        Ok(Self {
            source,
            version,
            screen,
            global_palette,
            data_start: HEADER_LEN + screen.global_color_table_len * 3,
            loop_count: None,
            remap_cache: HashMap::new(),
            remap_builds: 0,
            frame: None,
            frames_read: 0,
            finished: false,
        })
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn screen(&self) -> &LogicalScreenDescriptor {
        &self.screen
    }

    /// Empty when the stream carries no global palette.
    pub fn global_palette(&self) -> &P {
        &self.global_palette
    }

    /// From a NETSCAPE2.0 extension, once one has been read.
    pub fn loop_count(&self) -> Option<LoopCount> {
        self.loop_count
    }

    pub fn frames_read(&self) -> usize {
        self.frames_read
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// How many distinct local palettes have been mapped onto the global palette.
    pub fn remap_builds(&self) -> usize {
        self.remap_builds
    }

    /// The most recently decoded frame.
    pub fn frame(&self) -> Option<&GifFrame<R, P>> {
        self.frame.as_ref()
    }

    pub fn into_source(self) -> S {
        self.source
    }

    /// Decodes the next image into [`GifDecoder::frame`] and returns its delay, or `None`
    /// after the trailer. Errors end the stream.
    pub fn read_next_frame(&mut self) -> Result<Option<u32>> {
        if self.finished {
            return Ok(None);
        }
        let result = self.read_blocks();
        if result.is_err() {
            self.finished = true;
        }
        result
    }

    fn read_blocks(&mut self) -> Result<Option<u32>> {
        let mut control = GraphicControlExtension::default();

        loop {
            match self.source.read_byte("block label")? {
                EXTENSION_INTRODUCER => {
                    let label = self.source.read_byte("extension label")?;
                    self.process_extension(label, &mut control)?;
                }
                IMAGE_DESCRIPTOR_LABEL => {
                    // drop the previous frame before allocating the next one
                    self.frame = None;
                    let frame = self.read_image(control)?;
                    let delay_ms = frame.delay_ms;
                    self.frame = Some(frame);
                    self.frames_read += 1;
                    return Ok(Some(delay_ms));
                }
                TRAILER_LABEL => {
                    debug!("reached trailer after {} frames", self.frames_read);
                    self.finished = true;
                    return Ok(None);
                }
                label => {
                    debug!("skipping unknown block with label 0x{label:02x}");
                    self.source.read_byte("unknown block")?;
                    BlockReader::new(&mut self.source).skip()?;
                }
            }
        }
    }

    fn process_extension(
        &mut self,
        label: u8,
        control: &mut GraphicControlExtension,
    ) -> Result<()> {
        match label {
            GRAPHIC_CONTROL_EXTENSION => {
                let data = BlockReader::new(&mut self.source).collect::<Result<Vec<u8>>>()?;
                if data.len() < 3 {
                    return Err(DecodeError::incomplete("graphic control extension"));
                }
                // packed fields: XXXYYYZW
                // YYY = disposal method, W = transparent color flag
                let packed_fields = data[0];
                control.disposal_method = DisposalMethod::from_u8((packed_fields >> 2) & 0b111);
                control.transparent_color_index = if packed_fields & 1 != 0 {
                    data.get(3).copied()
                } else {
                    None
                };
                control.delay_ms = u16::from_le_bytes([data[1], data[2]]) as u32 * 10;
                debug!("processed graphic control extension: {:?}", control);
            }
            APPLICATION_EXTENSION => {
                let mut blocks = BlockReader::new(&mut self.source);
                let identifier = blocks.by_ref().take(11).collect::<Result<Vec<u8>>>()?;
                if identifier == b"NETSCAPE2.0" {
                    let data = blocks.by_ref().take(3).collect::<Result<Vec<u8>>>()?;
                    if data.len() == 3 && data[0] == 1 {
                        self.loop_count = Some(match u16::from_le_bytes([data[1], data[2]]) {
                            0 => LoopCount::Infinite,
                            number => LoopCount::Number(number),
                        });
                        debug!("loop count: {:?}", self.loop_count);
                    }
                }
                blocks.skip()?;
            }
            label => {
                debug!("discarding extension 0x{label:02x}");
                BlockReader::new(&mut self.source).skip()?;
            }
        }
        Ok(())
    }

    fn read_image(&mut self, control: GraphicControlExtension) -> Result<GifFrame<R, P>> {
        let mut descriptor = [0; 9];
        self.source.read_exact(&mut descriptor, "image descriptor")?;
        let left = u16::from_le_bytes([descriptor[0], descriptor[1]]);
        let top = u16::from_le_bytes([descriptor[2], descriptor[3]]);
        let width = u16::from_le_bytes([descriptor[4], descriptor[5]]);
        let height = u16::from_le_bytes([descriptor[6], descriptor[7]]);
        let packed_fields = descriptor[8];

        let mut remap = None;
        let mut local_palette = None;
        if packed_fields & 0b1000_0000 != 0 {
            let mut table = vec![0; color_table_len(packed_fields) * 3];
            self.source.read_exact(&mut table, "local color table")?;
            if self.global_palette.is_empty() {
                local_palette = Some(palette_from_bytes::<P>(&table));
            } else {
                remap = Some(self.remap_for(table));
            }
        }

        let min_code_size = self.source.read_byte("lzw minimum code size")?;
        if min_code_size > MAX_MIN_CODE_SIZE {
            return Err(DecodeError::UnsupportedFormat(format!(
                "lzw minimum code size {min_code_size}"
            )));
        }
        debug!("image {width}x{height} at ({left}, {top}), min code size {min_code_size}");

        let mut raster = R::new(width, height);
        let (mut x, mut y) = (0u16, 0u16);
        let blocks = BlockReader::new(&mut self.source);
        for run in LzwDecoder::new(blocks, min_code_size) {
            for index in run? {
                if y >= height {
                    continue;
                }
                let index = match &remap {
                    Some(map) => map.get(index as usize).copied().unwrap_or(index),
                    None => index,
                };
                raster.set(x, y, index);
                x += 1;
                if x >= width {
                    x = 0;
                    y += 1;
                }
            }
        }

        Ok(GifFrame {
            left,
            top,
            width,
            height,
            delay_ms: control.delay_ms,
            disposal_method: control.disposal_method,
            transparent_color_index: control.transparent_color_index,
            raster,
            local_palette,
        })
    }

    /// Maps each local color to the nearest global index, reusing the table built for an
    /// identical local palette.
    fn remap_for(&mut self, table: Vec<u8>) -> Rc<[u8]> {
        if let Some(map) = self.remap_cache.get(table.as_slice()) {
            return map.clone();
        }

        self.remap_builds += 1;
        let map: Rc<[u8]> = table
            .chunks_exact(3)
            .map(|rgb| closest_color(pack_rgb([rgb[0], rgb[1], rgb[2]]), &self.global_palette))
            .collect();

        if self.remap_cache.len() >= MAX_CACHED_REMAPS {
            self.remap_cache.clear();
        }
        self.remap_cache.insert(table.into_boxed_slice(), map.clone());
        map
    }
}

/// Index of `color` in `palette`, or of the nearest entry by Manhattan distance over R, G
/// and B. Ties go to the lower index.
pub fn closest_color<P: Palette>(color: u32, palette: &P) -> u8 {
    let len = palette.len().min(256);
    if let Some(index) = (0..len).find(|&i| palette.get(i) == Some(color)) {
        return index as u8;
    }

    let [r1, g1, b1] = unpack_rgb(color);
    let mut min_distance = 768;
    let mut closest = 0;
    for index in 0..len {
        let Some(candidate) = palette.get(index) else {
            continue;
        };
        let [r2, g2, b2] = unpack_rgb(candidate);
        let distance = r1.abs_diff(r2) as u32 + g1.abs_diff(g2) as u32 + b1.abs_diff(b2) as u32;
        if distance < min_distance {
            min_distance = distance;
            closest = index;
        }
    }
    closest as u8
}

fn color_table_len(packed_fields: u8) -> usize {
    1 << ((packed_fields & 0b111) + 1)
}

fn read_palette<S: ByteSource, P: Palette>(source: &mut S, len: usize) -> Result<P> {
    let mut palette = P::with_capacity(len);
    let mut rgb = [0; 3];
    for i in 0..len {
        source.read_exact(&mut rgb, "global color table")?;
        palette.set(i, pack_rgb(rgb));
    }
    Ok(palette)
}

fn palette_from_bytes<P: Palette>(table: &[u8]) -> P {
    let mut palette = P::with_capacity(table.len() / 3);
    for (i, rgb) in table.chunks_exact(3).enumerate() {
        palette.set(i, pack_rgb([rgb[0], rgb[1], rgb[2]]));
    }
    palette
}

impl<S, R, P> FramePump for GifDecoder<S, R, P>
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
        if self.read_next_frame()?.is_none() {
            return Ok(None);
        }
        Ok(self.frame.as_ref().map(|frame| Frame {
            raster: &frame.raster,
            palette: frame.local_palette.as_ref().unwrap_or(&self.global_palette),
            delay_ms: frame.delay_ms,
            left: frame.left,
            top: frame.top,
        }))
    }

    fn rewind(&mut self) -> Result<()> {
        self.source.seek_to(self.data_start)?;
        self.frame = None;
        self.frames_read = 0;
        self.finished = false;
        Ok(())
    }

    fn prefetch(&mut self, n: usize) {
        self.source.prefetch(n);
    }
}
