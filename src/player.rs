//! The outer cycle: fetch the next animation, play it, repeat.

use std::fs::File;
use std::io::{self, Read};
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use log::{error, info, warn};

use crate::clock::Clock;
use crate::error::{DecodeError, Result};
use crate::fetch::{FetchPolicy, Response, Session, SessionProvider};
use crate::pacing::{DisplaySink, PacingLoop, PlaybackStats, Watchdog};
use crate::parser::{BinOptions, Decoder};
use crate::raster::{IndexedRaster, RgbPalette};
use crate::source::{Buffered, ByteSource};

pub const DEVICE_HEADER: &str = "matr-device";
pub const LOCATION_HEADER: &str = "matr-location";
/// The device's idea of the time, in seconds since the epoch.
pub const DEVICE_TIME_HEADER: &str = "matr-device-time";

const CHUNK_LEN: usize = 1024;
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

pub struct Player<P, D, W> {
    provider: P,
    url: String,
    headers: Vec<(String, String)>,
    fetch: FetchPolicy,
    bin: BinOptions,
    fallback: Option<PathBuf>,
    default_dwell: Option<Duration>,
    clock: Rc<dyn Clock>,
    pacing: PacingLoop<Rc<dyn Clock>, D, W>,
    /// Last server time and the clock reading when it arrived.
    server_time: Option<(u64, Duration)>,
}

impl<P, D, W> Player<P, D, W>
where
    P: SessionProvider,
    D: DisplaySink<IndexedRaster, RgbPalette>,
    W: Watchdog,
{
    pub fn new(
        provider: P,
        url: impl Into<String>,
        clock: Rc<dyn Clock>,
        display: D,
        watchdog: W,
    ) -> Self {
        Self {
            provider,
            url: url.into(),
            headers: Vec::new(),
            fetch: FetchPolicy::default(),
            bin: BinOptions::default(),
            fallback: None,
            default_dwell: None,
            pacing: PacingLoop::new(clock.clone(), display, watchdog),
            clock,
            server_time: None,
        }
    }

    pub fn with_fetch_policy(mut self, fetch: FetchPolicy) -> Self {
        self.fetch = fetch;
        self
    }

    pub fn with_bin_options(mut self, bin: BinOptions) -> Self {
        self.bin = bin;
        self
    }

    /// Local file played whenever the fetch gives up.
    pub fn with_fallback(mut self, path: impl Into<PathBuf>) -> Self {
        self.fallback = Some(path.into());
        self
    }

    /// Used when the server doesn't say how long to show something.
    pub fn with_default_dwell(mut self, dwell: Duration) -> Self {
        self.default_dwell = Some(dwell);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn pacing(&self) -> &PacingLoop<Rc<dyn Clock>, D, W> {
        &self.pacing
    }

    /// Wall-clock seconds, carried forward from the last server time by the local clock.
    pub fn device_time(&self) -> Option<u64> {
        let (server_time, received_at) = self.server_time?;
        let elapsed = self.clock.now().saturating_sub(received_at);
        Some(server_time + elapsed.as_secs())
    }

    fn request_headers(&self) -> Vec<(String, String)> {
        let mut headers = self.headers.clone();
        if let Some(time) = self.device_time() {
            headers.push((DEVICE_TIME_HEADER.to_string(), time.to_string()));
        }
        headers
    }

    /// One fetch and playback. Falls back to the local asset if the fetch fails.
    pub fn run_cycle(&mut self) -> Result<PlaybackStats> {
        let headers = self.request_headers();
        let fetched = match self
            .fetch
            .fetch(&mut self.provider, &self.url, &headers, self.clock.clone())
        {
            Ok(fetched) => fetched,
            Err(fetch_error) => {
                error!("{fetch_error}, falling back to local asset");
                return self.play_fallback(fetch_error);
            }
        };

        if let Some(server_time) = fetched.server_time {
            self.server_time = Some((server_time, self.clock.now()));
        }
        let dwell = fetched.dwell.or(self.default_dwell);
        self.play(fetched.source, dwell)
    }

    /// Runs `cycles` cycles, or forever with zero. Errors are logged and the next cycle
    /// starts after a short pause. Returns how many cycles played cleanly.
    pub fn run(&mut self, cycles: usize) -> usize {
        let mut clean = 0;
        let mut cycle = 0;
        while cycles == 0 || cycle < cycles {
            cycle += 1;
            info!("cycle {cycle}");
            match self.run_cycle() {
                Ok(_) => clean += 1,
                Err(error) => {
                    warn!("cycle {cycle} failed: {error}");
                    self.pacing.sleep(ERROR_BACKOFF);
                }
            }
        }
        clean
    }

    fn play_fallback(&mut self, cause: DecodeError) -> Result<PlaybackStats> {
        let Some(path) = self.fallback.clone() else {
            return Err(cause);
        };
        let data = std::fs::read(&path)?;
        info!("playing {}", path.display());
        self.play(Buffered::new(data), self.default_dwell)
    }

    fn play<S: ByteSource>(&mut self, source: S, dwell: Option<Duration>) -> Result<PlaybackStats> {
        let mut decoder: Decoder<S, IndexedRaster, RgbPalette> =
            Decoder::open(source, self.bin)?;
        self.pacing.play(&mut decoder, dwell)
    }
}

/// A watchdog for hosts without one: it only notes the feed.
#[derive(Debug, Default)]
pub struct LogWatchdog {
    feeds: usize,
}

impl LogWatchdog {
    pub fn feeds(&self) -> usize {
        self.feeds
    }
}

impl Watchdog for LogWatchdog {
    fn feed(&mut self) {
        self.feeds += 1;
        log::trace!("watchdog fed ({})", self.feeds);
    }
}

/// Serves requests out of a directory, mapping the URL path onto a file name. Stands in for
/// the radio when running on a host.
#[derive(Debug, Clone)]
pub struct DirectoryProvider {
    root: PathBuf,
}

impl DirectoryProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl SessionProvider for DirectoryProvider {
    type Session = DirectorySession;

    fn open(&mut self) -> io::Result<DirectorySession> {
        Ok(DirectorySession {
            root: self.root.clone(),
        })
    }
}

pub struct DirectorySession {
    root: PathBuf,
}

impl DirectorySession {
    fn resolve(&self, url: &str) -> io::Result<PathBuf> {
        let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
        let path = match url.contains("://") {
            true => rest.split_once('/').map_or("", |(_, path)| path),
            false => rest,
        };
        let path = path.split(['?', '#']).next().unwrap_or_default();

        let mut resolved = self.root.clone();
        for part in path.split('/').filter(|part| !part.is_empty()) {
            if part == ".." {
                return Err(io::Error::new(io::ErrorKind::InvalidInput, "path escapes root"));
            }
            resolved.push(part);
        }
        if resolved == self.root {
            return Err(io::Error::new(io::ErrorKind::NotFound, "empty path"));
        }
        Ok(resolved)
    }
}

impl Session for DirectorySession {
    type Response = FileResponse;

    fn get(&mut self, url: &str, _headers: &[(String, String)]) -> io::Result<FileResponse> {
        let path = self.resolve(url)?;
        Ok(FileResponse {
            file: Some(File::open(path)?),
        })
    }

    fn close(&mut self) {}
}

pub struct FileResponse {
    file: Option<File>,
}

impl Response for FileResponse {
    fn header(&self, _name: &str) -> Option<String> {
        None
    }

    fn next_chunk(&mut self) -> Option<io::Result<Vec<u8>>> {
        let file = self.file.as_mut()?;
        let mut chunk = vec![0; CHUNK_LEN];
        match file.read(&mut chunk) {
            Ok(0) => {
                self.file = None;
                None
            }
            Ok(len) => {
                chunk.truncate(len);
                Some(Ok(chunk))
            }
            Err(error) => Some(Err(error)),
        }
    }

    fn close(&mut self) {
        self.file = None;
    }
}
