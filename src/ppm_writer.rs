use std::fs::File;
use std::io::{self, prelude::*, BufWriter};
use std::path::PathBuf;

use log::trace;

use crate::frame::Frame;
use crate::pacing::DisplaySink;
use crate::raster::{unpack_rgb, Palette, Raster};

const MAGIC_NUMBER: &[u8] = b"P3";

/// Writes a frame as a plain-text PPM. Indices the palette doesn't cover come out black.
pub fn write_ppm<W, R, P>(writer: &mut W, raster: &R, palette: &P) -> io::Result<()>
where
    W: Write,
    R: Raster,
    P: Palette,
{
    let width = raster.width();
    let height = raster.height();

    writer.write_all(MAGIC_NUMBER)?;
    writer.write_all(b"\n")?;
    writer.write_all(format!("{} {}", width, height).as_bytes())?;
    writer.write_all(b" 255")?;
    writer.write_all(b"\n")?;

    for y in 0..height {
        for x in 0..width {
            let color = raster
                .get(x, y)
                .and_then(|index| palette.get(index.into()))
                .unwrap_or(0);
            let [red, green, blue] = unpack_rgb(color);

            writer.write_all(format!("{: >3} {: >3} {: >3}", red, green, blue).as_bytes())?;
            if x + 1 != width {
                writer.write_all(b" ")?;
            }
        }
        writer.write_all(b"\n")?;
    }

    Ok(())
}

/// A display that dumps each shown frame into a directory, cycling through a fixed set of
/// file names.
pub struct PpmSink {
    dir: PathBuf,
    ring: usize,
    shown: usize,
}

impl PpmSink {
    pub fn new(dir: impl Into<PathBuf>, ring: usize) -> Self {
        Self {
            dir: dir.into(),
            ring: ring.max(1),
            shown: 0,
        }
    }

    pub fn shown(&self) -> usize {
        self.shown
    }

    fn next_path(&self) -> PathBuf {
        self.dir.join(format!("frame_{}.ppm", self.shown % self.ring))
    }
}

impl<R: Raster, P: Palette> DisplaySink<R, P> for PpmSink {
    fn show(&mut self, frame: &Frame<'_, R, P>) -> io::Result<()> {
        let path = self.next_path();
        trace!("writing {}", path.display());

        let mut writer = BufWriter::new(File::create(&path)?);
        write_ppm(&mut writer, frame.raster, frame.palette)?;
        writer.flush()?;
        self.shown += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::{pack_rgb, IndexedRaster, RgbPalette};

    #[test]
    fn writes_plain_ppm() {
        let mut raster = IndexedRaster::new(2, 1);
        raster.set(1, 0, 1);
        let mut palette = RgbPalette::with_capacity(2);
        palette.set(0, pack_rgb([255, 0, 0]));
        palette.set(1, pack_rgb([0, 7, 42]));

        let mut out = Vec::new();
        write_ppm(&mut out, &raster, &palette).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "P3\n2 1 255\n255   0   0   0   7  42\n"
        );
    }

    #[test]
    fn sink_cycles_file_names() {
        let dir = std::env::temp_dir().join(format!("matrix-anim-ppm-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let raster = IndexedRaster::new(1, 1);
        let palette = RgbPalette::with_capacity(1);
        let frame = Frame {
            raster: &raster,
            palette: &palette,
            delay_ms: 10,
            left: 0,
            top: 0,
        };

        let mut sink = PpmSink::new(&dir, 2);
        for _ in 0..3 {
            sink.show(&frame).unwrap();
        }
        assert_eq!(sink.shown(), 3);
        assert!(dir.join("frame_0.ppm").exists());
        assert!(dir.join("frame_1.ppm").exists());
        assert!(!dir.join("frame_2.ppm").exists());
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
