//! Fetches a payload and decides how it is held.
//!
//! Small payloads are read whole and the connection is closed straight away. Once a payload
//! grows past the in-memory ceiling the connection stays open and the rest is decoded as it
//! arrives. Either way the caller gets a [`ByteSource`] and every connection is closed when
//! the last thing holding it is dropped.

use std::io;
use std::rc::Rc;
use std::time::Duration;

use log::{debug, info};

use crate::clock::Clock;
use crate::error::{DecodeError, Result};
use crate::retry::{RetryError, RetryPolicy};
use crate::source::{Buffered, ByteSource, Streaming};

pub const DEFAULT_MEMORY_CEILING: usize = 10 * 1024;
pub const DWELL_HEADER: &str = "matr-dwell";
pub const TIME_HEADER: &str = "matr-time";

/// A response whose body arrives in chunks.
pub trait Response {
    /// Header lookup, case-insensitive on the name.
    fn header(&self, name: &str) -> Option<String>;

    fn next_chunk(&mut self) -> Option<io::Result<Vec<u8>>>;

    fn close(&mut self);
}

pub trait Session {
    type Response: Response;

    /// Issues a streaming GET.
    fn get(&mut self, url: &str, headers: &[(String, String)]) -> io::Result<Self::Response>;

    fn close(&mut self);
}

pub trait SessionProvider {
    type Session: Session;

    fn open(&mut self) -> io::Result<Self::Session>;
}

/// An open session and, once the request went out, its response. Dropping it closes both,
/// response first.
pub struct Connection<S: Session> {
    session: S,
    response: Option<S::Response>,
}

impl<S: Session> Connection<S> {
    fn new(session: S) -> Self {
        Self {
            session,
            response: None,
        }
    }
}

impl<S: Session> Iterator for Connection<S> {
    type Item = io::Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.response.as_mut()?.next_chunk()
    }
}

impl<S: Session> Drop for Connection<S> {
    fn drop(&mut self) {
        if let Some(mut response) = self.response.take() {
            response.close();
        }
        self.session.close();
        debug!("connection released");
    }
}

/// The body as either a complete buffer or a live stream.
pub enum FetchedSource<S: Session> {
    Buffered(Buffered),
    Streaming(Streaming<Connection<S>>),
}

impl<S: Session> FetchedSource<S> {
    pub fn is_streaming(&self) -> bool {
        matches!(self, FetchedSource::Streaming(_))
    }
}

impl<S: Session> ByteSource for FetchedSource<S> {
    fn read_available(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self {
            FetchedSource::Buffered(source) => source.read_available(buf),
            FetchedSource::Streaming(source) => source.read_available(buf),
        }
    }

    fn prefetch(&mut self, n: usize) {
        match self {
            FetchedSource::Buffered(source) => source.prefetch(n),
            FetchedSource::Streaming(source) => source.prefetch(n),
        }
    }

    fn peek(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self {
            FetchedSource::Buffered(source) => source.peek(buf),
            FetchedSource::Streaming(source) => source.peek(buf),
        }
    }

    fn is_seekable(&self) -> bool {
        match self {
            FetchedSource::Buffered(source) => source.is_seekable(),
            FetchedSource::Streaming(source) => source.is_seekable(),
        }
    }

    fn seek_to(&mut self, offset: usize) -> Result<()> {
        match self {
            FetchedSource::Buffered(source) => source.seek_to(offset),
            FetchedSource::Streaming(source) => source.seek_to(offset),
        }
    }
}

pub struct Fetched<S: Session> {
    pub source: FetchedSource<S>,
    /// How long the server wants this shown.
    pub dwell: Option<Duration>,
    /// Server clock in seconds since the epoch, for the RTC.
    pub server_time: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FetchMode {
    /// Buffer up to the ceiling, stream beyond it.
    #[default]
    Auto,
    /// Always stream, whatever the size.
    ForceStreaming,
}

#[derive(Debug, Clone)]
pub struct FetchPolicy {
    pub memory_ceiling: usize,
    pub mode: FetchMode,
    /// Whole-request attempts.
    pub retry: RetryPolicy,
    /// Per-chunk retries once streaming.
    pub stream_retry: RetryPolicy,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            memory_ceiling: DEFAULT_MEMORY_CEILING,
            mode: FetchMode::Auto,
            retry: RetryPolicy::fetch_default(),
            stream_retry: RetryPolicy::stream_default(),
        }
    }
}

impl FetchPolicy {
    /// Any failure releases what was opened, waits, and starts over. Fails with
    /// `FetchExhausted` once the attempts run out.
    pub fn fetch<P>(
        &self,
        provider: &mut P,
        url: &str,
        headers: &[(String, String)],
        clock: Rc<dyn Clock>,
    ) -> Result<Fetched<P::Session>>
    where
        P: SessionProvider,
    {
        let outcome = self.retry.run(
            &*clock,
            |attempt| {
                debug!("fetching {url}, attempt {attempt}");
                self.attempt(provider, url, headers, clock.clone())
            },
            |_| true,
        );

        match outcome {
            Ok(fetched) => Ok(fetched),
            Err(RetryError::Fatal { attempts, .. } | RetryError::Exhausted { attempts, .. }) => {
                Err(DecodeError::FetchExhausted {
                    url: url.to_string(),
                    attempts,
                })
            }
        }
    }

    fn attempt<P>(
        &self,
        provider: &mut P,
        url: &str,
        headers: &[(String, String)],
        clock: Rc<dyn Clock>,
    ) -> Result<Fetched<P::Session>>
    where
        P: SessionProvider,
    {
        let mut connection = Connection::new(provider.open()?);
        let response = connection.session.get(url, headers)?;
        let dwell = response.header(DWELL_HEADER).and_then(|value| parse_seconds(&value));
        let server_time = response
            .header(TIME_HEADER)
            .and_then(|value| value.trim().parse().ok());
        connection.response = Some(response);

        if self.mode == FetchMode::ForceStreaming {
            info!("streaming {url}");
            let source = Streaming::new(connection).with_retry(self.stream_retry, clock);
            return Ok(Fetched {
                source: FetchedSource::Streaming(source),
                dwell,
                server_time,
            });
        }

        let mut buffered = Vec::new();
        while buffered.len() <= self.memory_ceiling {
            match connection.next() {
                Some(chunk) => buffered.extend_from_slice(&chunk?),
                None => {
                    drop(connection);
                    info!("buffered {url} ({} bytes)", buffered.len());
                    return Ok(Fetched {
                        source: FetchedSource::Buffered(Buffered::new(buffered)),
                        dwell,
                        server_time,
                    });
                }
            }
        }

        info!(
            "{url} exceeds {} bytes, streaming the rest",
            self.memory_ceiling
        );
        let source =
            Streaming::with_prefix(buffered, connection).with_retry(self.stream_retry, clock);
        Ok(Fetched {
            source: FetchedSource::Streaming(source),
            dwell,
            server_time,
        })
    }
}

fn parse_seconds(value: &str) -> Option<Duration> {
    let seconds: f64 = value.trim().parse().ok()?;
    (seconds.is_finite() && seconds >= 0.0).then(|| Duration::from_secs_f64(seconds))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::cell::RefCell;
    use std::collections::VecDeque;

    #[derive(Default)]
    struct Log {
        opened: usize,
        sessions_closed: usize,
        responses_closed: usize,
    }

    struct MockResponse {
        log: Rc<RefCell<Log>>,
        chunks: VecDeque<io::Result<Vec<u8>>>,
        headers: Vec<(String, String)>,
    }

    impl Response for MockResponse {
        fn header(&self, name: &str) -> Option<String> {
            self.headers
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(name))
                .map(|(_, value)| value.clone())
        }

        fn next_chunk(&mut self) -> Option<io::Result<Vec<u8>>> {
            self.chunks.pop_front()
        }

        fn close(&mut self) {
            self.log.borrow_mut().responses_closed += 1;
        }
    }

    struct MockSession {
        log: Rc<RefCell<Log>>,
        body: Vec<u8>,
        chunk: usize,
        fail_get: bool,
    }

    impl Session for MockSession {
        type Response = MockResponse;

        fn get(&mut self, _url: &str, _headers: &[(String, String)]) -> io::Result<MockResponse> {
            if self.fail_get {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "timed out"));
            }
            Ok(MockResponse {
                log: self.log.clone(),
                chunks: self.body.chunks(self.chunk).map(|c| Ok(c.to_vec())).collect(),
                headers: vec![
                    ("Matr-Dwell".to_string(), "2.5".to_string()),
                    ("matr-time".to_string(), "1700000000".to_string()),
                ],
            })
        }

        fn close(&mut self) {
            self.log.borrow_mut().sessions_closed += 1;
        }
    }

    struct MockProvider {
        log: Rc<RefCell<Log>>,
        body: Vec<u8>,
        chunk: usize,
        failures: usize,
    }

    impl MockProvider {
        fn new(body: Vec<u8>, chunk: usize) -> Self {
            Self {
                log: Rc::new(RefCell::new(Log::default())),
                body,
                chunk,
                failures: 0,
            }
        }
    }

    impl SessionProvider for MockProvider {
        type Session = MockSession;

        fn open(&mut self) -> io::Result<MockSession> {
            let fail_get = self.failures > 0;
            self.failures = self.failures.saturating_sub(1);
            self.log.borrow_mut().opened += 1;
            Ok(MockSession {
                log: self.log.clone(),
                body: self.body.clone(),
                chunk: self.chunk,
                fail_get,
            })
        }
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    fn read_to_end<S: ByteSource>(source: &mut S) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0; 333];
        loop {
            let n = source.read_available(&mut buf).unwrap();
            out.extend_from_slice(&buf[..n]);
            if n < buf.len() {
                return out;
            }
        }
    }

    fn policy() -> FetchPolicy {
        FetchPolicy {
            memory_ceiling: 1000,
            ..FetchPolicy::default()
        }
    }

    #[test]
    fn small_payload_is_buffered_and_released() {
        let clock: Rc<dyn Clock> = Rc::new(ManualClock::new());
        let mut provider = MockProvider::new(payload(999), 100);
        let mut fetched = policy().fetch(&mut provider, "http://x/next", &[], clock).unwrap();

        assert!(!fetched.source.is_streaming());
        assert_eq!(fetched.dwell, Some(Duration::from_millis(2500)));
        assert_eq!(fetched.server_time, Some(1_700_000_000));
        {
            let log = provider.log.borrow();
            assert_eq!(log.sessions_closed, 1);
            assert_eq!(log.responses_closed, 1);
        }
        assert_eq!(read_to_end(&mut fetched.source), payload(999));
    }

    #[test]
    fn large_payload_streams_everything_in_order() {
        let clock: Rc<dyn Clock> = Rc::new(ManualClock::new());
        let mut provider = MockProvider::new(payload(1001), 100);
        let mut fetched = policy().fetch(&mut provider, "http://x/next", &[], clock).unwrap();

        assert!(fetched.source.is_streaming());
        assert_eq!(provider.log.borrow().sessions_closed, 0);
        assert_eq!(read_to_end(&mut fetched.source), payload(1001));
        drop(fetched);
        let log = provider.log.borrow();
        assert_eq!(log.sessions_closed, 1);
        assert_eq!(log.responses_closed, 1);
    }

    #[test]
    fn forced_streaming_ignores_size() {
        let clock: Rc<dyn Clock> = Rc::new(ManualClock::new());
        let mut provider = MockProvider::new(payload(10), 4);
        let policy = FetchPolicy {
            mode: FetchMode::ForceStreaming,
            ..policy()
        };
        let mut fetched = policy.fetch(&mut provider, "http://x/next", &[], clock).unwrap();
        assert!(fetched.source.is_streaming());
        assert_eq!(read_to_end(&mut fetched.source), payload(10));
    }

    #[test]
    fn failed_attempts_release_and_retry() {
        let manual = Rc::new(ManualClock::new());
        let clock: Rc<dyn Clock> = manual.clone();
        let mut provider = MockProvider::new(payload(10), 4);
        provider.failures = 2;
        let fetched = policy().fetch(&mut provider, "http://x/next", &[], clock).unwrap();

        assert!(!fetched.source.is_streaming());
        let log = provider.log.borrow();
        assert_eq!(log.opened, 3);
        assert_eq!(log.sessions_closed, 3);
        assert_eq!(manual.slept(), Duration::from_secs(3));
    }

    #[test]
    fn exhausted_attempts_report_fetch_exhausted() {
        let clock: Rc<dyn Clock> = Rc::new(ManualClock::new());
        let mut provider = MockProvider::new(payload(10), 4);
        provider.failures = 5;
        let result = policy().fetch(&mut provider, "http://x/next", &[], clock);

        assert!(matches!(
            result,
            Err(DecodeError::FetchExhausted { attempts: 3, .. })
        ));
        let log = provider.log.borrow();
        assert_eq!(log.opened, 3);
        assert_eq!(log.sessions_closed, 3);
    }

    #[test]
    fn dwell_header_parsing() {
        assert_eq!(parse_seconds(" 30 "), Some(Duration::from_secs(30)));
        assert_eq!(parse_seconds("-1"), None);
        assert_eq!(parse_seconds("soon"), None);
    }
}
