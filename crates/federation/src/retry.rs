//! Bounded retry combinator.
//!
//! One combinator serves both identity authentication (linear backoff,
//! stops early on non-retryable errors) and signature verification (fixed
//! delay, a `None` result counts as a failed attempt).

use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tracing::debug;

/// Whether an error is worth another attempt.
pub trait Retryable {
    fn is_retryable(&self) -> bool {
        true
    }
}

impl Retryable for fraudnet_protocol::ProtocolError {}

/// Delay growth between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Same delay after every attempt
    Fixed,
    /// `delay * attempt`
    Linear,
}

/// Retry bounds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
            backoff: Backoff::Fixed,
        }
    }

    pub fn linear(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
            backoff: Backoff::Linear,
        }
    }

    /// Delay to wait after the given (1-based) failed attempt.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.delay,
            Backoff::Linear => self.delay * attempt,
        }
    }
}

/// A successful result and the attempt it arrived on.
#[derive(Debug, Clone, PartialEq)]
pub struct Retried<T> {
    pub value: T,
    pub attempts: u32,
}

/// Why a retried operation gave up.
#[derive(Error, Debug)]
pub enum RetryError<E> {
    /// Every attempt completed but produced nothing
    #[error("No result after {attempts} attempts")]
    Exhausted { attempts: u32 },

    /// The last attempt failed, or a non-retryable error cut the loop short
    #[error("Failed after {attempts} attempts: {error}")]
    Failed { attempts: u32, error: E },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts } | RetryError::Failed { attempts, .. } => *attempts,
        }
    }
}

/// Run `op` up to `policy.max_attempts` times.
///
/// `Ok(Some(_))` ends the loop. `Ok(None)` and retryable errors wait and try
/// again. An error on the final attempt, or a non-retryable one, is returned
/// as [`RetryError::Failed`].
pub async fn retry<T, E, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<Retried<T>, RetryError<E>>
where
    E: Retryable + std::fmt::Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
{
    let max_attempts = policy.max_attempts.max(1);

    for attempt in 1..=max_attempts {
        match op(attempt).await {
            Ok(Some(value)) => return Ok(Retried { value, attempts: attempt }),
            Ok(None) => {
                debug!("Attempt {}/{} produced no result", attempt, max_attempts);
            }
            Err(e) if attempt == max_attempts || !e.is_retryable() => {
                return Err(RetryError::Failed {
                    attempts: attempt,
                    error: e,
                });
            }
            Err(e) => {
                debug!("Attempt {}/{} failed: {}", attempt, max_attempts, e);
            }
        }

        if attempt < max_attempts {
            sleep(policy.delay_after(attempt)).await;
        }
    }

    Err(RetryError::Exhausted {
        attempts: max_attempts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[derive(Debug, Error)]
    enum TestError {
        #[error("transient")]
        Transient,
        #[error("fatal")]
        Fatal,
    }

    impl Retryable for TestError {
        fn is_retryable(&self) -> bool {
            matches!(self, TestError::Transient)
        }
    }

    fn quick(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::fixed(max_attempts, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_succeeds_after_failures() {
        let calls = Cell::new(0);
        let result = retry(&quick(5), |_| {
            calls.set(calls.get() + 1);
            let n = calls.get();
            async move {
                match n {
                    1 => Err(TestError::Transient),
                    2 => Ok(None),
                    _ => Ok(Some("done")),
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(result.value, "done");
        assert_eq!(result.attempts, 3);
    }

    #[tokio::test]
    async fn test_exhausted_when_all_empty() {
        let result = retry(&quick(5), |_| async { Ok::<Option<()>, TestError>(None) }).await;
        assert!(matches!(result, Err(RetryError::Exhausted { attempts: 5 })));
    }

    #[tokio::test]
    async fn test_error_on_final_attempt_is_returned() {
        let result = retry(&quick(3), |attempt| async move {
            if attempt < 3 {
                Ok::<Option<()>, TestError>(None)
            } else {
                Err(TestError::Transient)
            }
        })
        .await;

        match result {
            Err(RetryError::Failed { attempts, error }) => {
                assert_eq!(attempts, 3);
                assert!(matches!(error, TestError::Transient));
            }
            other => panic!("unexpected result: {:?}", other.map(|r| r.attempts)),
        }
    }

    #[tokio::test]
    async fn test_non_retryable_stops_early() {
        let calls = Cell::new(0);
        let result = retry(&quick(5), |_| {
            calls.set(calls.get() + 1);
            async { Err::<Option<()>, _>(TestError::Fatal) }
        })
        .await;

        assert_eq!(calls.get(), 1);
        assert_eq!(result.unwrap_err().attempts(), 1);
    }

    #[test]
    fn test_backoff_delays() {
        let linear = RetryPolicy::linear(3, Duration::from_secs(1));
        assert_eq!(linear.delay_after(1), Duration::from_secs(1));
        assert_eq!(linear.delay_after(2), Duration::from_secs(2));

        let fixed = RetryPolicy::fixed(5, Duration::from_millis(300));
        assert_eq!(fixed.delay_after(4), Duration::from_millis(300));
    }
}
