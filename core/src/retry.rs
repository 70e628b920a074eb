//! Fixed-backoff retry for gateway requests.

use std::{thread, time::Duration};

use crate::error::{FetchError, FetchResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Pause between consecutive attempts.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Run `attempt` until it succeeds, fails with a non-retryable error,
    /// or `max_attempts` is used up. `attempt` receives the 1-based
    /// attempt number.
    pub fn run<T>(
        &self,
        operation: &str,
        mut attempt: impl FnMut(u32) -> FetchResult<T>,
    ) -> FetchResult<T> {
        let max_attempts = self.max_attempts.max(1);
        let mut n = 1;
        loop {
            match attempt(n) {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) if n >= max_attempts => {
                    log::error!("{operation} failed after all {n} attempts: {e}");
                    return Err(FetchError::RetryExhausted {
                        operation: operation.to_string(),
                        attempts: n,
                        last: Box::new(e),
                    });
                }
                Err(e) => {
                    log::warn!("{operation} retry {n} error: {e}");
                    if !self.backoff.is_zero() {
                        thread::sleep(self.backoff);
                    }
                    n += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick() -> RetryPolicy {
        RetryPolicy::new(3, Duration::ZERO)
    }

    #[test]
    fn succeeds_on_third_attempt() {
        let mut calls = 0;
        let result = quick().run("op", |n| {
            calls += 1;
            if n < 3 { Err(FetchError::gateway("op", 7)) } else { Ok(n) }
        });
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls, 3);
    }

    #[test]
    fn stops_after_max_attempts() {
        let mut calls = 0;
        let result: FetchResult<()> = quick().run("op", |_| {
            calls += 1;
            Err(FetchError::gateway("op", 7))
        });
        assert_eq!(calls, 3);
        match result {
            Err(FetchError::RetryExhausted { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected RetryExhausted, got {other:?}"),
        }
    }

    #[test]
    fn timeouts_are_not_retried() {
        let mut calls = 0;
        let result: FetchResult<()> = quick().run("op", |_| {
            calls += 1;
            Err(FetchError::Timeout {
                waiting_for: "x".into(),
                waited_ms: 1,
            })
        });
        assert_eq!(calls, 1);
        assert!(matches!(result, Err(FetchError::Timeout { .. })));
    }
}
