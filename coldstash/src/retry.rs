//! Classified exponential backoff around network operations.
//!
//! Only errors that look transient (see [`StashError::is_transient`]) are
//! retried. Delays double from the initial delay up to the per-attempt cap,
//! and the whole loop gives up once the elapsed-time ceiling is reached.

use std::future::Future;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::RetryConfig;
use crate::{Result, StashError};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    initial_delay: Duration,
    max_delay: Duration,
    max_elapsed: Duration,
}

impl RetryPolicy {
    pub fn new(initial_delay: Duration, max_delay: Duration, max_elapsed: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            max_elapsed,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.initial_delay(),
            config.max_delay(),
            config.max_elapsed(),
        )
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Run `operation` until it succeeds, fails permanently, exhausts the
    /// elapsed-time ceiling, or `cancel` fires.
    pub async fn run<T, F, Fut>(
        &self,
        label: &str,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let start = Instant::now();
        let mut attempt: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(StashError::Cancelled);
            }

            let err = match operation().await {
                Ok(value) => {
                    if attempt > 0 {
                        info!("{} succeeded after {} attempts", label, attempt + 1);
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };

            if !err.is_transient() {
                return Err(err);
            }

            attempt += 1;
            let elapsed = start.elapsed();
            if elapsed >= self.max_elapsed {
                return Err(StashError::RetryExhausted {
                    label: label.to_string(),
                    elapsed,
                    source: Box::new(err),
                });
            }

            let delay = self.delay_for(attempt);
            warn!("{} failed (attempt {}): {}", label, attempt, err);
            warn!("Retrying {} in {:?} (cancel to abort)", label, delay);

            tokio::select! {
                _ = cancel.cancelled() => return Err(StashError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}
