//! Pixel storage capabilities the containers are generic over.
//!
//! A platform supplies its own framebuffer-backed types by implementing [`Raster`] and
//! [`Palette`]; [`IndexedRaster`] and [`RgbPalette`] are the heap-backed defaults.

/// Fixed-capacity table of 24-bit `0xRRGGBB` colors.
pub trait Palette {
    fn with_capacity(len: usize) -> Self;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `None` for indices past the capacity.
    fn get(&self, index: usize) -> Option<u32>;

    /// Writes past the capacity are ignored; capacity never changes.
    fn set(&mut self, index: usize, color: u32);
}

/// Width x height grid of palette indices.
pub trait Raster {
    fn new(width: u16, height: u16) -> Self;

    fn width(&self) -> u16;

    fn height(&self) -> u16;

    fn get(&self, x: u16, y: u16) -> Option<u8>;

    /// Out-of-bounds writes are ignored, callers clip.
    fn set(&mut self, x: u16, y: u16, index: u8);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RgbPalette {
    colors: Box<[u32]>,
}

impl RgbPalette {
    pub fn colors(&self) -> &[u32] {
        &self.colors
    }
}

impl Palette for RgbPalette {
    fn with_capacity(len: usize) -> Self {
        Self {
            colors: vec![0; len].into_boxed_slice(),
        }
    }

    fn len(&self) -> usize {
        self.colors.len()
    }

    fn get(&self, index: usize) -> Option<u32> {
        self.colors.get(index).copied()
    }

    fn set(&mut self, index: usize, color: u32) {
        if let Some(slot) = self.colors.get_mut(index) {
            *slot = color & 0x00ff_ffff;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedRaster {
    width: u16,
    height: u16,
    pixels: Box<[u8]>,
}

impl IndexedRaster {
    /// Row-major index bytes.
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }
}

impl Raster for IndexedRaster {
    fn new(width: u16, height: u16) -> Self {
        Self {
            width,
            height,
            pixels: vec![0; width as usize * height as usize].into_boxed_slice(),
        }
    }

    fn width(&self) -> u16 {
        self.width
    }

    fn height(&self) -> u16 {
        self.height
    }

    fn get(&self, x: u16, y: u16) -> Option<u8> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.pixels.get(y as usize * self.width as usize + x as usize).copied()
    }

    fn set(&mut self, x: u16, y: u16, index: u8) {
        if x >= self.width || y >= self.height {
            return;
        }
        self.pixels[y as usize * self.width as usize + x as usize] = index;
    }
}

/// Packs an RGB triple the way palettes store it.
pub fn pack_rgb(rgb: [u8; 3]) -> u32 {
    (rgb[0] as u32) << 16 | (rgb[1] as u32) << 8 | rgb[2] as u32
}

pub fn unpack_rgb(color: u32) -> [u8; 3] {
    [(color >> 16) as u8, (color >> 8) as u8, color as u8]
}
