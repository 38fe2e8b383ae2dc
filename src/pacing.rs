//! Presents frames on schedule.
//!
//! Each cycle decodes one frame, measures how long that took, and sleeps away the rest of
//! the frame's delay. A frame whose decode already ate its whole delay is counted but not
//! shown. Sleeps are cut into segments no longer than the watchdog allows, feeding it after
//! each one.

use std::io;
use std::time::Duration;

use log::{debug, info};

use crate::clock::Clock;
use crate::error::Result;
use crate::frame::{Frame, FramePump};

/// Longest stretch the loop sleeps without feeding the watchdog.
pub const MAX_SLEEP_SEGMENT: Duration = Duration::from_secs(5);
/// Bytes to pull ahead while a frame is on screen.
pub const DEFAULT_PREFETCH: usize = 2048;

/// Whatever ends up lighting pixels.
pub trait DisplaySink<R, P> {
    fn show(&mut self, frame: &Frame<'_, R, P>) -> io::Result<()>;
}

/// The device liveness timer. Resets the device unless fed within its timeout.
pub trait Watchdog {
    fn feed(&mut self);
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackStats {
    pub presented: usize,
    /// Frames whose decode overran their own delay.
    pub skipped: usize,
    /// Extra passes started to fill the dwell time.
    pub replays: usize,
}

pub struct PacingLoop<C, D, W> {
    clock: C,
    display: D,
    watchdog: W,
    max_sleep_segment: Duration,
    prefetch: usize,
}

impl<C, D, W> PacingLoop<C, D, W>
where
    C: Clock,
    W: Watchdog,
{
    pub fn new(clock: C, display: D, watchdog: W) -> Self {
        Self {
            clock,
            display,
            watchdog,
            max_sleep_segment: MAX_SLEEP_SEGMENT,
            prefetch: DEFAULT_PREFETCH,
        }
    }

    pub fn with_max_sleep_segment(mut self, segment: Duration) -> Self {
        self.max_sleep_segment = segment.max(Duration::from_millis(1));
        self
    }

    /// Zero turns read-ahead off.
    pub fn with_prefetch(mut self, bytes: usize) -> Self {
        self.prefetch = bytes;
        self
    }

    pub fn display(&self) -> &D {
        &self.display
    }

    pub fn watchdog(&self) -> &W {
        &self.watchdog
    }

    /// Plays `pump` to the end. With a `dwell`, a pass that ends before the dwell has elapsed
    /// rewinds and plays again, as long as the source allows it.
    pub fn play<F>(&mut self, pump: &mut F, dwell: Option<Duration>) -> Result<PlaybackStats>
    where
        F: FramePump,
        D: DisplaySink<F::Raster, F::Palette>,
    {
        let deadline = dwell.map(|dwell| self.clock.now() + dwell);
        let mut stats = PlaybackStats::default();
        let mut pass_frames = 0;

        loop {
            let cycle_start = self.clock.now();
            let delay = match pump.next_frame()? {
                Some(frame) => {
                    let overhead = self.clock.now().saturating_sub(cycle_start);
                    let delay = Duration::from_millis(frame.delay_ms.into());
                    if delay <= overhead {
                        debug!("decode took {overhead:?}, past the {delay:?} delay, skipping");
                        // a skipped frame never sleeps, so it feeds here
                        self.watchdog.feed();
                        stats.skipped += 1;
                        None
                    } else {
                        self.display.show(&frame)?;
                        stats.presented += 1;
                        Some(delay)
                    }
                }
                None => {
                    let dwelling = deadline.is_some_and(|deadline| self.clock.now() < deadline);
                    if dwelling && pass_frames > 0 {
                        self.watchdog.feed();
                        match pump.rewind() {
                            Ok(()) => {
                                debug!("replaying to fill dwell time");
                                stats.replays += 1;
                                pass_frames = 0;
                                continue;
                            }
                            Err(error) => debug!("cannot replay: {error}"),
                        }
                    }
                    break;
                }
            };
            pass_frames += 1;

            if let Some(delay) = delay {
                if self.prefetch > 0 {
                    pump.prefetch(self.prefetch);
                }
                let elapsed = self.clock.now().saturating_sub(cycle_start);
                self.sleep(delay.saturating_sub(elapsed));
            }
        }

        info!(
            "playback done: {} presented, {} skipped, {} replays",
            stats.presented, stats.skipped, stats.replays
        );
        Ok(stats)
    }

    /// Sleeps in segments no longer than the watchdog timeout, feeding it after each.
    /// Together with the feeds on skipped frames and rewinds, no pass through the loop
    /// leaves the watchdog unfed.
    pub fn sleep(&mut self, duration: Duration) {
        if duration > self.max_sleep_segment {
            self.watchdog.feed();
        }
        let mut remaining = duration;
        while !remaining.is_zero() {
            let segment = remaining.min(self.max_sleep_segment);
            self.clock.sleep(segment);
            self.watchdog.feed();
            remaining -= segment;
        }
    }
}
