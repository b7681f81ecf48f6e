//! Retry utilities with bounded attempts and optional backoff.
//!
//! Every wait in a deployment is expressed through [`retry_with_backoff`]:
//! an async operation, a predicate that decides which errors are transient,
//! and a [`RetryConfig`] bounding how often and how long to try.
//!
//! # Example
//!
//! ```ignore
//! use pcs_common::retry::{retry_with_backoff, RetryConfig};
//!
//! let secret = retry_with_backoff(
//!     &RetryConfig::fixed(Duration::from_secs(10), 36),
//!     "create secret",
//!     |e: &ClusterApiError| e.is_connect_timeout(),
//!     || async { api.create("default", &manifest).await },
//! ).await?;
//! ```

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, info};

/// Configuration for operations that may fail transiently.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = infinite)
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Upper bound for the delay between attempts
    pub max_delay: Duration,
    /// Multiplier applied to the delay after every failed attempt
    pub backoff_multiplier: f64,
    /// Log retryable failures at debug level. Set for polling waits, where
    /// a failed attempt only means "not yet".
    pub quiet: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0, // infinite
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            quiet: false,
        }
    }
}

impl RetryConfig {
    /// Fixed interval between attempts, at most `attempts` tries
    pub fn fixed(interval: Duration, attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            initial_delay: interval,
            max_delay: interval,
            backoff_multiplier: 1.0,
            quiet: false,
        }
    }

    /// Same schedule, retryable failures logged at debug level
    #[must_use]
    pub fn quiet(mut self) -> Self {
        self.quiet = true;
        self
    }
}

/// Why a retried operation gave up.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// The operation failed with an error the predicate rejected
    #[error("{0}")]
    Fatal(E),
    /// Every attempt failed with a retryable error
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted {
        /// Attempts made
        attempts: u32,
        /// Error from the final attempt
        last: E,
    },
}

impl<E> RetryError<E> {
    /// The underlying error from the last attempt
    pub fn into_inner(self) -> E {
        match self {
            Self::Fatal(e) => e,
            Self::Exhausted { last, .. } => last,
        }
    }
}

/// Execute an async operation, retrying while `is_retryable` accepts the error.
///
/// The first attempt runs immediately; later attempts wait for the configured
/// delay after the previous attempt settled, so attempts never overlap.
/// Each call keeps its own attempt counter.
///
/// # Returns
/// The operation's value, [`RetryError::Fatal`] for a non-retryable error, or
/// [`RetryError::Exhausted`] once `max_attempts` retryable failures happened.
pub async fn retry_with_backoff<F, Fut, T, E, P>(
    config: &RetryConfig,
    operation_name: &str,
    is_retryable: P,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: Display,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if !is_retryable(&e) => {
                debug!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    "Operation failed with non-retryable error"
                );
                return Err(RetryError::Fatal(e));
            }
            Err(e) => {
                if config.max_attempts > 0 && attempt >= config.max_attempts {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last: e,
                    });
                }

                if config.quiet {
                    debug!(
                        operation = %operation_name,
                        attempt = attempt,
                        max_attempts = config.max_attempts,
                        status = %e,
                        "Not ready yet, polling again"
                    );
                } else {
                    info!(
                        operation = %operation_name,
                        attempt = attempt,
                        max_attempts = config.max_attempts,
                        error = %e,
                        delay_ms = delay.as_millis(),
                        "Operation failed, retrying"
                    );
                }

                tokio::time::sleep(delay).await;

                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * config.backoff_multiplier)
                        .min(config.max_delay.as_secs_f64()),
                );
            }
        }
    }
}
