use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::fetch::{FetchMode, FetchPolicy, DEFAULT_MEMORY_CEILING};
use crate::parser::{BinLayout, BinOptions, Buffering};

/// Fetches animations and plays them on schedule, rendering each frame to disk.
#[derive(Parser, Debug)]
#[command(name = "matrix-anim", version)]
pub struct Config {
    /// Base URL used with `--dev`.
    #[arg(long, env = "MATRIX_URL_DEV", default_value = "http://localhost:8000")]
    pub url_dev: String,

    /// Base URL used otherwise.
    #[arg(long, env = "MATRIX_URL_PROD", default_value = "http://matrix.local")]
    pub url_prod: String,

    /// Talk to the development server.
    #[arg(long)]
    pub dev: bool,

    /// Request path appended to the base URL.
    #[arg(long, default_value = "/next")]
    pub path: String,

    /// Directory that answers requests in place of a network session.
    #[arg(long, env = "MATRIX_SERVE_DIR", default_value = ".")]
    pub serve_dir: PathBuf,

    #[arg(long, env = "MATRIX_DEVICE_ID")]
    pub device_id: Option<String>,

    #[arg(long, env = "MATRIX_LOCATION")]
    pub location: Option<String>,

    /// Payloads up to this many bytes are buffered whole; larger ones stream.
    #[arg(long, default_value_t = DEFAULT_MEMORY_CEILING)]
    pub memory_ceiling: usize,

    /// Stream every payload regardless of size.
    #[arg(long)]
    pub force_streaming: bool,

    #[arg(long, value_enum, default_value = "u16")]
    pub bin_layout: LayoutArg,

    #[arg(long, value_enum, default_value = "double")]
    pub buffering: BufferingArg,

    /// Loop BIN animations that were buffered whole.
    #[arg(long)]
    pub bin_loop: bool,

    /// Local animation played when a fetch fails.
    #[arg(long, env = "MATRIX_FALLBACK")]
    pub fallback: Option<PathBuf>,

    /// Where rendered frames are written.
    #[arg(long, short, default_value = "frames")]
    pub output_dir: PathBuf,

    /// How many frame files to cycle through.
    #[arg(long, default_value_t = 16)]
    pub frame_ring: usize,

    /// Number of fetch-and-play cycles; 0 runs forever.
    #[arg(long, default_value_t = 0)]
    pub cycles: usize,

    /// Seconds to keep replaying when the server sends no dwell.
    #[arg(long)]
    pub dwell: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LayoutArg {
    U16,
    U8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BufferingArg {
    Single,
    Double,
    Fresh,
}

impl From<LayoutArg> for BinLayout {
    fn from(value: LayoutArg) -> Self {
        match value {
            LayoutArg::U16 => BinLayout::FrameCountU16,
            LayoutArg::U8 => BinLayout::FrameCountU8,
        }
    }
}

impl From<BufferingArg> for Buffering {
    fn from(value: BufferingArg) -> Self {
        match value {
            BufferingArg::Single => Buffering::Single,
            BufferingArg::Double => Buffering::Double,
            BufferingArg::Fresh => Buffering::Fresh,
        }
    }
}

impl Config {
    pub fn url(&self) -> String {
        let base = match self.dev {
            true => &self.url_dev,
            false => &self.url_prod,
        };
        format!(
            "{}/{}",
            base.trim_end_matches('/'),
            self.path.trim_start_matches('/')
        )
    }

    pub fn fetch_policy(&self) -> FetchPolicy {
        FetchPolicy {
            memory_ceiling: self.memory_ceiling,
            mode: match self.force_streaming {
                true => FetchMode::ForceStreaming,
                false => FetchMode::Auto,
            },
            ..FetchPolicy::default()
        }
    }

    pub fn bin_options(&self) -> BinOptions {
        BinOptions {
            layout: self.bin_layout.into(),
            buffering: self.buffering.into(),
            looping: self.bin_loop,
        }
    }

    pub fn default_dwell(&self) -> Option<Duration> {
        self.dwell
            .filter(|seconds| seconds.is_finite() && *seconds > 0.0)
            .map(Duration::from_secs_f64)
    }
}
