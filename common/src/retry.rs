// Retry strategies for transient failures and a cancellable retry loop

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Retries for transient status-check failures. Not configurable.
pub const STATUS_CHECK_RETRIES: u32 = 3;

/// Retry strategy trait for calculating retry delays
pub trait RetryStrategy: Send + Sync {
    /// Calculate the delay before the next retry attempt
    /// Returns None if max retries exceeded
    fn next_delay(&self, attempt: u32) -> Option<Duration>;

    /// Get the maximum number of retries
    fn max_retries(&self) -> u32;
}

/// Fixed delay between step attempts
#[derive(Debug, Clone)]
pub struct FixedDelay {
    delay: Duration,
    max_retries: u32,
}

impl FixedDelay {
    pub fn new(delay: Duration, max_retries: u32) -> Self {
        Self { delay, max_retries }
    }
}

impl RetryStrategy for FixedDelay {
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_retries {
            return None;
        }
        Some(self.delay)
    }

    fn max_retries(&self) -> u32 {
        self.max_retries
    }
}

/// Linear backoff: base, 2 × base, 3 × base, ...
#[derive(Debug, Clone)]
pub struct LinearBackoff {
    base: Duration,
    max_retries: u32,
}

impl LinearBackoff {
    pub fn new(base: Duration, max_retries: u32) -> Self {
        Self { base, max_retries }
    }

    /// Backoff used around remote status checks
    pub fn for_status_checks(polling_interval: Duration) -> Self {
        Self::new(polling_interval, STATUS_CHECK_RETRIES)
    }
}

impl RetryStrategy for LinearBackoff {
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_retries {
            return None;
        }
        Some(self.base.saturating_mul(attempt + 1))
    }

    fn max_retries(&self) -> u32 {
        self.max_retries
    }
}

/// Why a cancellable retry loop gave up
#[derive(Debug)]
pub enum RetryError<E> {
    Cancelled,
    Exhausted(E),
}

/// Run `operation` until it succeeds, retries run out, or the token fires.
///
/// Both the operation and the backoff delay observe the token.
pub async fn retry_cancellable<T, E, F, Fut>(
    strategy: &dyn RetryStrategy,
    token: &CancellationToken,
    operation_name: &str,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut attempt = 0;
    loop {
        let result = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(RetryError::Cancelled),
            result = operation() => result,
        };

        let error = match result {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        let Some(delay) = strategy.next_delay(attempt) else {
            tracing::warn!(
                operation = operation_name,
                attempts = attempt + 1,
                error = %error,
                "Retries exhausted"
            );
            return Err(RetryError::Exhausted(error));
        };

        tracing::warn!(
            operation = operation_name,
            attempt = attempt + 1,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Transient failure, retrying"
        );

        tokio::select! {
            biased;
            _ = token.cancelled() => return Err(RetryError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
    }
}
