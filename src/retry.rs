//! Retry logic with exponential backoff
//!
//! Transient transfer failures are retried inside the transfer engine with
//! exponential backoff and optional jitter; they never surface as job-level
//! failures until the retry budget is exhausted.

use crate::config::RetryConfig;
use crate::error::TransferError;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Trait for errors that can be classified as retryable or not
///
/// Transient failures (timeouts, connection resets, server overload) should
/// return `true`. Permanent failures (cancellation, checksum mismatch,
/// disk full) should return `false`.
pub trait IsRetryable {
    /// Returns true if the error is transient and the operation should be retried
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for TransferError {
    fn is_retryable(&self) -> bool {
        match self {
            TransferError::Network(e) => {
                if e.is_timeout() || e.is_connect() || e.is_request() || e.is_body() {
                    return true;
                }
                // Overloaded or flaky mirrors: retry 5xx and 429
                e.status()
                    .map(|s| s.is_server_error() || s.as_u16() == 429)
                    .unwrap_or(false)
            }
            TransferError::Io { source, .. } => matches!(
                source.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::NotConnected
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::UnexpectedEof
            ),
            // The partial file is kept for an explicit resume; do not loop here
            TransferError::Incomplete { .. } => false,
            // Re-downloading the same wrong bytes will not fix the digest
            TransferError::ChecksumMismatch { .. } => false,
            TransferError::Cancelled => false,
        }
    }
}

/// Execute an async operation with exponential backoff retry logic
///
/// Retries only errors whose `is_retryable()` returns true, up to
/// `config.max_attempts` retries. Cancellation during a backoff sleep
/// short-circuits the wait; the next attempt observes the token and
/// returns promptly with its own cancellation error.
pub async fn with_retry<F, Fut, T, E>(
    config: &RetryConfig,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: IsRetryable + std::fmt::Display,
{
    let mut attempt = 0;
    let mut delay = config.initial_delay;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    tracing::info!(attempts = attempt + 1, "operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if e.is_retryable() && attempt < config.max_attempts => {
                attempt += 1;

                tracing::warn!(
                    error = %e,
                    attempt = attempt,
                    max_attempts = config.max_attempts,
                    delay_ms = delay.as_millis(),
                    "operation failed, retrying"
                );

                let jittered_delay = if config.jitter {
                    add_jitter(delay)
                } else {
                    delay
                };

                tokio::select! {
                    _ = tokio::time::sleep(jittered_delay) => {}
                    _ = cancel.cancelled() => {}
                }

                let next_delay =
                    Duration::from_secs_f64(delay.as_secs_f64() * config.backoff_multiplier);
                delay = next_delay.min(config.max_delay);
            }
            Err(e) => {
                if e.is_retryable() {
                    tracing::error!(
                        error = %e,
                        attempts = attempt + 1,
                        "operation failed after all retry attempts exhausted"
                    );
                } else {
                    tracing::debug!(error = %e, "operation failed with non-retryable error");
                }
                return Err(e);
            }
        }
    }
}

/// Add random jitter to a delay to avoid synchronized retry storms
///
/// Jitter is uniformly distributed between 0% and 100% of the delay, so the
/// actual delay is between `delay` and `2 * delay`.
fn add_jitter(delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let jitter_factor: f64 = rng.gen_range(0.0..=1.0);
    Duration::from_secs_f64(delay.as_secs_f64() * (1.0 + jitter_factor))
}
