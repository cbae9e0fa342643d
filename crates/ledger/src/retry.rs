//! Bounded exponential backoff for transient ledger failures.

use std::future::Future;
use std::time::Duration;

use crate::error::LedgerError;

/// Retry policy for ledger operations.
///
/// Only errors where [`LedgerError::is_transient`] holds are retried;
/// permanent errors surface on the first attempt.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// A policy that never sleeps, for tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            multiplier: 1.0,
        }
    }

    /// Run `operation` until it succeeds, fails permanently, or the
    /// attempt budget is exhausted. The last error is returned.
    pub async fn run<T, F, Fut>(&self, operation: F) -> Result<T, LedgerError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, LedgerError>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut backoff = self.initial_backoff;
        let mut last_error = LedgerError::Transport {
            message: "no attempts made".to_string(),
        };

        for attempt in 1..=attempts {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() => {
                    last_error = e;
                    if attempt < attempts {
                        tokio::time::sleep(backoff).await;
                        backoff = Duration::from_millis(
                            ((backoff.as_millis() as f64) * self.multiplier) as u64,
                        )
                        .min(self.max_backoff);
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error)
    }
}
