//! Bounded exponential backoff for provider calls

use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::RetryConfig;
use crate::error::{LabelerError, Result};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Randomization factor (0.0 - 1.0)
    pub jitter: f64,
    /// Stretch a delay to at least the provider's `Retry-After` hint
    pub respect_retry_after: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter: config.jitter,
            respect_retry_after: config.respect_retry_after,
        }
    }

    /// No waiting between attempts; used by tests
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: 0.0,
            respect_retry_after: false,
        }
    }

    fn backoff(&self) -> backoff::ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.base_delay)
            .with_multiplier(2.0)
            .with_randomization_factor(self.jitter)
            .with_max_interval(self.max_delay)
            .with_max_elapsed_time(None)
            .build()
    }

    fn delay_for(&self, backoff: &mut backoff::ExponentialBackoff, error: &LabelerError) -> Duration {
        let mut delay = backoff.next_backoff().unwrap_or(self.max_delay);

        if self.respect_retry_after {
            if let Some(secs) = error.retry_after() {
                delay = delay.max(Duration::from_secs(secs));
            }
        }

        delay.min(self.max_delay)
    }
}

/// Run `operation` until it succeeds, fails permanently, or the attempt
/// budget is spent
///
/// Only transient errors (see [`LabelerError::is_transient`]) are retried; the
/// last transient error is returned once `max_attempts` calls have been made.
/// Cancellation is observed before every re-attempt and during the backoff
/// sleep, never in the middle of a call.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation_name: &str,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut backoff = policy.backoff();
    let mut attempts = 0;

    loop {
        attempts += 1;
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if e.is_transient() && attempts < policy.max_attempts => {
                let delay = policy.delay_for(&mut backoff, &e);
                warn!(
                    "{} failed (attempt {}/{}): {}. Retrying in {:?}...",
                    operation_name, attempts, policy.max_attempts, e, delay
                );

                tokio::select! {
                    _ = cancel.cancelled() => {
                        return Err(LabelerError::Cancelled(format!(
                            "{} cancelled after {} attempt(s)",
                            operation_name, attempts
                        )));
                    }
                    _ = tokio::time::sleep(delay) => {}
                }

                if cancel.is_cancelled() {
                    return Err(LabelerError::Cancelled(format!(
                        "{} cancelled after {} attempt(s)",
                        operation_name, attempts
                    )));
                }
            }
            Err(e) => return Err(e),
        }
    }
}
