//! Fetch Retry Policy
//!
//! Exponential backoff with jitter for upstream fetches. Transient failures
//! are retried after a growing, capped delay; everything else propagates at
//! once.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::domain::MarketError;
use crate::infrastructure::metrics;

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff (e.g., 2.0 doubles delay each attempt).
    pub multiplier: f64,
    /// Jitter factor as a fraction (e.g., 0.1 = ±10% randomization).
    pub jitter_factor: f64,
    /// Total attempts allowed, including the first (0 = unlimited).
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter_factor: 0.1,
            max_attempts: 5,
        }
    }
}

impl RetryConfig {
    /// Same delays without an attempt cap.
    #[must_use]
    pub const fn unlimited(mut self) -> Self {
        self.max_attempts = 0;
        self
    }
}

/// Backoff state for one sequence of attempts.
///
/// # Example
///
/// ```rust
/// use kline_relay::application::services::retry::{Backoff, RetryConfig};
///
/// let mut backoff = Backoff::new(RetryConfig::default());
///
/// // Delay after the first failure
/// let delay = backoff.next_delay();
/// assert!(delay.is_some());
///
/// // Success starts over
/// backoff.reset();
/// ```
#[derive(Debug)]
pub struct Backoff {
    config: RetryConfig,
    current_delay: Duration,
    retries: u32,
}

impl Backoff {
    /// Create a fresh backoff.
    #[must_use]
    pub const fn new(config: RetryConfig) -> Self {
        let initial_delay = config.initial_delay;
        Self {
            config,
            current_delay: initial_delay,
            retries: 0,
        }
    }

    /// Delay before the next attempt, or `None` when attempts are used up.
    #[must_use]
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.should_retry() {
            return None;
        }

        self.retries += 1;

        let delay_with_jitter = self.apply_jitter(self.current_delay);

        #[allow(clippy::cast_precision_loss)]
        let scaled = (self.current_delay.as_millis() as f64 * self.config.multiplier).round();
        let next_millis = if scaled.is_finite() && scaled > 0.0 {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            {
                scaled as u128
            }
        } else {
            0
        };
        let capped = next_millis.min(self.config.max_delay.as_millis());
        self.current_delay = Duration::from_millis(u64::try_from(capped).unwrap_or(u64::MAX));

        Some(delay_with_jitter)
    }

    /// Start over after a success.
    pub const fn reset(&mut self) {
        self.current_delay = self.config.initial_delay;
        self.retries = 0;
    }

    /// Attempts made so far, counting the first.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.retries + 1
    }

    /// Whether another attempt is allowed.
    #[must_use]
    pub const fn should_retry(&self) -> bool {
        self.config.max_attempts == 0 || self.retries + 1 < self.config.max_attempts
    }

    fn apply_jitter(&self, duration: Duration) -> Duration {
        if self.config.jitter_factor <= 0.0 {
            return duration;
        }

        #[allow(clippy::cast_precision_loss)]
        let base_millis = duration.as_millis() as f64;
        let jitter_range = base_millis * self.config.jitter_factor;
        let jitter: f64 = rand::rng().random_range(-jitter_range..=jitter_range);
        let adjusted_millis = (base_millis + jitter).max(1.0);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let adjusted_u64 = adjusted_millis as u64;
        Duration::from_millis(adjusted_u64)
    }
}

/// Run `fetch` until it succeeds, fails permanently, or attempts run out.
///
/// # Errors
///
/// Non-transient errors are returned as-is. Running out of attempts yields
/// `MarketError::RetriesExhausted`.
pub async fn retry_transient<T, F, Fut>(
    adapter: &str,
    config: &RetryConfig,
    mut fetch: F,
) -> Result<T, MarketError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, MarketError>>,
{
    let mut backoff = Backoff::new(config.clone());
    loop {
        metrics::record_fetch(adapter);
        let err = match fetch().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        metrics::record_fetch_failure(adapter, err.kind());
        if !err.is_transient() {
            return Err(err);
        }

        let attempts = backoff.attempts();
        let Some(delay) = backoff.next_delay() else {
            return Err(MarketError::RetriesExhausted {
                attempts,
                last_error: err.to_string(),
            });
        };

        warn!(
            adapter,
            attempt = attempts,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = %err,
            "Transient fetch failure, retrying"
        );
        metrics::record_fetch_retry(adapter);
        tokio::time::sleep(delay).await;
    }
}
