//! Backoff for transient remote failures.
//!
//! The engine never picks a retry count on its own: callers opt in through
//! [`RetryConfig`], whose default makes a single attempt.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use draftsync_common::Result;

/// How often and how patiently remote calls are retried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RetryConfig {
    /// Extra attempts after the first; 0 disables retrying.
    pub max_retries: u32,
    /// Delay before the first retry, in milliseconds.
    pub initial_delay_ms: u64,
    /// Cap on any single delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Growth factor between consecutive delays.
    pub backoff_multiplier: f64,
    /// Spread each delay by up to 25% either way.
    pub jitter: bool,
}

impl RetryConfig {
    /// Retry up to `max_retries` times, starting at one second.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_delay_ms: 1_000,
            max_delay_ms: 60_000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }

    /// Single attempt, no retries.
    pub fn disabled() -> Self {
        Self::new(0)
    }

    /// Delay before retry number `retry` (zero-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let grown = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(retry as i32);
        let capped = grown.min(self.max_delay_ms as f64);
        let spread = if self.jitter {
            0.75 + rand::random::<f64>() * 0.5
        } else {
            1.0
        };
        Duration::from_millis((capped * spread) as u64)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::disabled()
    }
}

/// Runs remote calls under a [`RetryConfig`].
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Call `operation` until it succeeds or its error is final.
    ///
    /// An error is final when [`draftsync_common::Error::is_retryable`] is
    /// false (`Auth` among others) or the retry budget is spent.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut retries = 0;
        loop {
            let err = match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !err.is_retryable() || retries >= self.config.max_retries {
                if retries > 0 {
                    warn!("Remote call gave up after {} retries: {}", retries, err);
                }
                return Err(err);
            }

            let delay = self.config.backoff(retries);
            retries += 1;
            debug!("Remote call failed ({}), retry {} in {:?}", err, retries, delay);
            sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use draftsync_common::Error;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn steady(max_retries: u32) -> RetryConfig {
        RetryConfig {
            jitter: false,
            ..RetryConfig::new(max_retries)
        }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let config = RetryConfig {
            max_delay_ms: 5_000,
            ..steady(10)
        };

        assert_eq!(config.backoff(0), Duration::from_secs(1));
        assert_eq!(config.backoff(2), Duration::from_secs(4));
        assert_eq!(config.backoff(8), Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let config = RetryConfig::new(3);
        for _ in 0..50 {
            let delay = config.backoff(1);
            assert!(delay >= Duration::from_millis(1_500) && delay <= Duration::from_millis(2_500));
        }
    }

    #[test]
    fn test_default_does_not_retry() {
        assert_eq!(RetryConfig::default().max_retries, 0);

        let parsed: RetryConfig = serde_json::from_str(r#"{"maxRetries": 4}"#).unwrap();
        assert_eq!(parsed.max_retries, 4);
        assert_eq!(parsed.initial_delay_ms, 1_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_errors() {
        let attempts = AtomicU32::new(0);
        let counter = &attempts;

        let result = RetryExecutor::new(steady(3))
            .execute(move || async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::Remote {
                        status: 502,
                        message: "bad gateway".to_string(),
                    })
                } else {
                    Ok("stored")
                }
            })
            .await;

        assert_eq!(result.unwrap(), "stored");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_error_not_retried() {
        let attempts = AtomicU32::new(0);
        let counter = &attempts;

        let result: Result<()> = RetryExecutor::new(steady(5))
            .execute(move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(Error::Auth("token expired".to_string()))
            })
            .await;

        assert!(matches!(result, Err(Error::Auth(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_budget() {
        let attempts = AtomicU32::new(0);
        let counter = &attempts;

        let result: Result<()> = RetryExecutor::new(steady(2))
            .execute(move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(Error::Network("unreachable".to_string()))
            })
            .await;

        assert!(matches!(result, Err(Error::Network(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
