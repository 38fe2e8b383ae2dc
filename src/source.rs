//! Pull-based byte input shared by every container.
//!
//! [`Buffered`] wraps a payload that already sits in memory. [`Streaming`] pops bytes off a
//! chunk iterator fed by a live connection, retrying stale-descriptor hiccups per its
//! [`RetryPolicy`].

use std::io;
use std::rc::Rc;

use log::{debug, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::{DecodeError, Result};
use crate::retry::{is_stale_descriptor, RetryError, RetryPolicy};

pub trait ByteSource {
    /// Fills as much of `buf` as possible. Returns fewer than `buf.len()` bytes only at
    /// end of stream.
    fn read_available(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Best-effort pull of at least `n` bytes into the internal tail so the next read does
    /// not wait on the network. Never consumes bytes.
    fn prefetch(&mut self, n: usize);

    /// Copies upcoming bytes into `buf` without consuming them. Returns fewer than
    /// `buf.len()` only at end of stream.
    fn peek(&mut self, buf: &mut [u8]) -> Result<usize>;

    fn is_seekable(&self) -> bool {
        false
    }

    /// Moves the read cursor to an absolute offset.
    fn seek_to(&mut self, _offset: usize) -> Result<()> {
        Err(DecodeError::UnsupportedOperation("seek on a non-seekable source"))
    }

    /// Fills all of `buf` or fails with `IncompleteData`.
    fn read_exact(&mut self, buf: &mut [u8], context: &'static str) -> Result<()> {
        if self.read_available(buf)? < buf.len() {
            return Err(DecodeError::incomplete(context));
        }
        Ok(())
    }

    /// Returns exactly `n` bytes or fails with `IncompleteData`.
    fn read(&mut self, n: usize) -> Result<Vec<u8>> {
        let mut buffer = vec![0; n];
        self.read_exact(&mut buffer, "fixed-size field")?;
        Ok(buffer)
    }

    fn read_byte(&mut self, context: &'static str) -> Result<u8> {
        let mut buffer = [0; 1];
        self.read_exact(&mut buffer, context)?;
        Ok(buffer[0])
    }

    fn read_u16_le(&mut self, context: &'static str) -> Result<u16> {
        let mut buffer = [0; 2];
        self.read_exact(&mut buffer, context)?;
        Ok(u16::from_le_bytes(buffer))
    }
}

impl<S: ByteSource + ?Sized> ByteSource for &mut S {
    fn read_available(&mut self, buf: &mut [u8]) -> Result<usize> {
        (**self).read_available(buf)
    }

    fn prefetch(&mut self, n: usize) {
        (**self).prefetch(n)
    }

    fn peek(&mut self, buf: &mut [u8]) -> Result<usize> {
        (**self).peek(buf)
    }

    fn is_seekable(&self) -> bool {
        (**self).is_seekable()
    }

    fn seek_to(&mut self, offset: usize) -> Result<()> {
        (**self).seek_to(offset)
    }
}

impl<S: ByteSource + ?Sized> ByteSource for Box<S> {
    fn read_available(&mut self, buf: &mut [u8]) -> Result<usize> {
        (**self).read_available(buf)
    }

    fn prefetch(&mut self, n: usize) {
        (**self).prefetch(n)
    }

    fn peek(&mut self, buf: &mut [u8]) -> Result<usize> {
        (**self).peek(buf)
    }

    fn is_seekable(&self) -> bool {
        (**self).is_seekable()
    }

    fn seek_to(&mut self, offset: usize) -> Result<()> {
        (**self).seek_to(offset)
    }
}

/// A complete payload in memory. Reads never retry and end of stream is exact.
#[derive(Debug, Clone)]
pub struct Buffered {
    data: Vec<u8>,
    position: usize,
}

impl Buffered {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data, position: 0 }
    }

    pub fn position(&self) -> usize {
        self.position
    }
}

impl ByteSource for Buffered {
    fn read_available(&mut self, buf: &mut [u8]) -> Result<usize> {
        let remaining = &self.data[self.position..];
        let count = remaining.len().min(buf.len());
        buf[..count].copy_from_slice(&remaining[..count]);
        self.position += count;
        Ok(count)
    }

    fn prefetch(&mut self, _n: usize) {}

    fn peek(&mut self, buf: &mut [u8]) -> Result<usize> {
        let remaining = &self.data[self.position..];
        let count = remaining.len().min(buf.len());
        buf[..count].copy_from_slice(&remaining[..count]);
        Ok(count)
    }

    fn is_seekable(&self) -> bool {
        true
    }

    fn seek_to(&mut self, offset: usize) -> Result<()> {
        if offset > self.data.len() {
            return Err(DecodeError::incomplete("seek target"));
        }
        self.position = offset;
        Ok(())
    }
}

/// Bytes popped off a sequence of chunks pulled from a live connection.
pub struct Streaming<I> {
    chunks: I,
    tail: Vec<u8>,
    head: usize,
    retry: RetryPolicy,
    clock: Rc<dyn Clock>,
    exhausted: bool,
    /// Error hit during a prefetch, surfaced by the next read that needs more bytes.
    deferred: Option<DecodeError>,
}

impl<I> Streaming<I>
where
    I: Iterator<Item = io::Result<Vec<u8>>>,
{
    pub fn new(chunks: I) -> Self {
        Self::with_prefix(Vec::new(), chunks)
    }

    /// Serves `prefix` before anything from `chunks`.
    pub fn with_prefix(prefix: Vec<u8>, chunks: I) -> Self {
        Self {
            chunks,
            tail: prefix,
            head: 0,
            retry: RetryPolicy::stream_default(),
            clock: Rc::new(SystemClock::new()),
            exhausted: false,
            deferred: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy, clock: Rc<dyn Clock>) -> Self {
        self.retry = retry;
        self.clock = clock;
        self
    }

    /// Bytes pulled off the connection but not yet read.
    pub fn buffered(&self) -> usize {
        self.tail.len() - self.head
    }

    /// Appends one chunk to the tail. `Ok(false)` once the connection has nothing more.
    fn pull(&mut self) -> Result<bool> {
        if let Some(error) = self.deferred.take() {
            return Err(error);
        }
        if self.exhausted {
            return Ok(false);
        }

        let chunks = &mut self.chunks;
        let outcome = self.retry.run(
            &*self.clock,
            |_| chunks.next().transpose(),
            is_stale_descriptor,
        );

        match outcome {
            Ok(Some(chunk)) => {
                if self.head == self.tail.len() {
                    self.tail.clear();
                } else {
                    self.tail.drain(..self.head);
                }
                self.head = 0;
                self.tail.extend_from_slice(&chunk);
                Ok(true)
            }
            Ok(None) => {
                debug!("stream ended");
                self.exhausted = true;
                Ok(false)
            }
            Err(RetryError::Fatal { error, .. }) => {
                self.exhausted = true;
                Err(error.into())
            }
            Err(RetryError::Exhausted { attempts, .. }) => {
                self.exhausted = true;
                Err(DecodeError::TransientIo { attempts })
            }
        }
    }
}

impl<I> ByteSource for Streaming<I>
where
    I: Iterator<Item = io::Result<Vec<u8>>>,
{
    fn read_available(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            if self.head == self.tail.len() {
                if !self.pull()? {
                    break;
                }
                continue;
            }
            let count = (self.tail.len() - self.head).min(buf.len() - filled);
            buf[filled..filled + count].copy_from_slice(&self.tail[self.head..self.head + count]);
            self.head += count;
            filled += count;
        }
        Ok(filled)
    }

    fn peek(&mut self, buf: &mut [u8]) -> Result<usize> {
        while self.buffered() < buf.len() {
            if !self.pull()? {
                break;
            }
        }
        let count = self.buffered().min(buf.len());
        buf[..count].copy_from_slice(&self.tail[self.head..self.head + count]);
        Ok(count)
    }

    fn prefetch(&mut self, n: usize) {
        while self.deferred.is_none() && self.buffered() < n {
            match self.pull() {
                Ok(true) => {}
                Ok(false) => break,
                Err(error) => {
                    warn!("prefetch failed, deferring error to next read: {error}");
                    self.deferred = Some(error);
                }
            }
        }
    }
}
