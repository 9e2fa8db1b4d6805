use std::thread::sleep;
use std::time::Duration;

use log::warn;

use crate::error::{Error, ErrorKind, Result};

/// Result of one attempt of a retryable operation.
#[derive(Debug)]
pub enum RetryOutcome<T> {
    Success(T),
    Retryable(Error),
    Fatal(Error),
}

impl<T> From<Result<T>> for RetryOutcome<T> {
    /// Only transport errors are worth another attempt.
    fn from(result: Result<T>) -> Self {
        match result {
            Ok(value) => RetryOutcome::Success(value),
            Err(e) if e.kind() == ErrorKind::Transport => RetryOutcome::Retryable(e),
            Err(e) => RetryOutcome::Fatal(e),
        }
    }
}

/// Runs `operation` until it succeeds, fails fatally or `attempts` are used up.
///
/// The delay doubles after every failed attempt. The operation gets the
/// number of the current attempt, starting at 1.
pub fn retry_with_backoff<T, F>(attempts: usize, delay: Duration, mut operation: F) -> Result<T>
where
    F: FnMut(usize) -> RetryOutcome<T>,
{
    let mut delay = delay;
    let mut attempt = 1;
    loop {
        match operation(attempt) {
            RetryOutcome::Success(value) => return Ok(value),
            RetryOutcome::Fatal(e) => return Err(e),
            RetryOutcome::Retryable(e) if attempt >= attempts => return Err(e),
            RetryOutcome::Retryable(e) => {
                warn!("Attempt {} of {} failed: {}", attempt, attempts, e);
                sleep(delay);
                delay *= 2;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn disconnected() -> Error {
        Error::Disconnected {
            channel: "test".to_string(),
        }
    }

    #[test]
    fn retries_until_success() {
        let result = retry_with_backoff(5, Duration::ZERO, |attempt| {
            if attempt < 3 {
                RetryOutcome::Retryable(disconnected())
            } else {
                RetryOutcome::Success(attempt)
            }
        });
        assert_eq!(result.unwrap(), 3);
    }

    #[test]
    fn stops_at_attempt_cap() {
        let mut calls = 0;
        let result: Result<()> = retry_with_backoff(4, Duration::ZERO, |_| {
            calls += 1;
            RetryOutcome::Retryable(disconnected())
        });
        assert!(matches!(result, Err(Error::Disconnected { .. })));
        assert_eq!(calls, 4);
    }

    #[test]
    fn fatal_is_not_retried() {
        let mut calls = 0;
        let result: Result<()> = retry_with_backoff(4, Duration::ZERO, |_| {
            calls += 1;
            RetryOutcome::from(Err::<(), _>(Error::Protocol {
                message: "halt".to_string(),
                response: String::new(),
            }))
        });
        assert!(matches!(result, Err(Error::Protocol { .. })));
        assert_eq!(calls, 1);
    }
}
