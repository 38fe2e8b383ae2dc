use std::io;
use std::time::Duration;

use log::warn;

use crate::clock::Clock;

/// `EBADF`: the socket behind the stream was torn down under us. The radio stack reports this
/// for a connection that recovers on the next pull.
const EBADF: i32 = 9;

pub fn is_stale_descriptor(error: &io::Error) -> bool {
    error.raw_os_error() == Some(EBADF)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed,
    /// Delay doubles after every failed attempt.
    Doubling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
    pub backoff: Backoff,
}

#[derive(Debug)]
pub enum RetryError<E> {
    /// The predicate rejected the error; no further attempts were made.
    Fatal { error: E, attempts: u32 },
    Exhausted { last: E, attempts: u32 },
}

impl RetryPolicy {
    pub const fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
            backoff: Backoff::Fixed,
        }
    }

    /// Three tries, 100ms apart. Used for chunk pulls off a live stream.
    pub const fn stream_default() -> Self {
        Self::fixed(3, Duration::from_millis(100))
    }

    /// Three tries with a doubling pause starting at one second. Used for whole fetches.
    pub const fn fetch_default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(1),
            backoff: Backoff::Doubling,
        }
    }

    fn delay_after(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.delay,
            Backoff::Doubling => self.delay.saturating_mul(1 << (attempt - 1).min(16)),
        }
    }

    /// Runs `op` until it succeeds, `is_retryable` rejects its error, or the attempt budget is
    /// spent. `op` receives the 1-based attempt number.
    pub fn run<T, E, F, P>(
        &self,
        clock: &dyn Clock,
        mut op: F,
        is_retryable: P,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Result<T, E>,
        P: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(error) if !is_retryable(&error) => {
                    return Err(RetryError::Fatal {
                        error,
                        attempts: attempt,
                    })
                }
                Err(error) if attempt >= max_attempts => {
                    warn!("giving up after {attempt} attempts: {error}");
                    return Err(RetryError::Exhausted {
                        last: error,
                        attempts: attempt,
                    });
                }
                Err(error) => {
                    warn!("attempt {attempt}/{max_attempts} failed, retrying: {error}");
                    clock.sleep(self.delay_after(attempt));
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn stale() -> io::Error {
        io::Error::from_raw_os_error(EBADF)
    }

    #[test]
    fn retries_until_success() {
        let clock = ManualClock::new();
        let policy = RetryPolicy::fixed(3, Duration::from_millis(100));
        let mut calls = 0;
        let result = policy.run(
            &clock,
            |_| {
                calls += 1;
                if calls < 3 {
                    Err(stale())
                } else {
                    Ok(calls)
                }
            },
            is_stale_descriptor,
        );
        assert_eq!(result.unwrap(), 3);
        assert_eq!(clock.slept(), Duration::from_millis(200));
    }

    #[test]
    fn fatal_error_is_not_retried() {
        let clock = ManualClock::new();
        let policy = RetryPolicy::stream_default();
        let mut calls = 0;
        let result: Result<(), _> = policy.run(
            &clock,
            |_| {
                calls += 1;
                Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            },
            is_stale_descriptor,
        );
        assert!(matches!(result, Err(RetryError::Fatal { attempts: 1, .. })));
        assert_eq!(calls, 1);
        assert_eq!(clock.slept(), Duration::ZERO);
    }

    #[test]
    fn doubling_backoff() {
        let clock = ManualClock::new();
        let policy = RetryPolicy {
            max_attempts: 3,
            delay: Duration::from_secs(1),
            backoff: Backoff::Doubling,
        };
        let result: Result<(), _> = policy.run(&clock, |_| Err(stale()), |_| true);
        assert!(matches!(result, Err(RetryError::Exhausted { attempts: 3, .. })));
        assert_eq!(clock.slept(), Duration::from_secs(3));
    }
}
