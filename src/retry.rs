//! Bounded construction retry for resources that load slowly.
//!
//! A reward model may fail to load while its weights are still being fetched
//! by another process. Construction itself never retries; callers wrap it in
//! [`load_with_retry`], which sleeps a fixed delay between attempts and only
//! retries errors that report themselves as transient.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{info, warn};

use crate::reward::RewardModelError;

/// Errors that can tell a contended resource from a broken one.
pub trait TransientError: std::error::Error {
    fn is_transient(&self) -> bool;
}

impl TransientError for RewardModelError {
    fn is_transient(&self) -> bool {
        RewardModelError::is_transient(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadRetryPolicy {
    /// Total attempts including the first. Values below 1 are treated as 1.
    pub max_attempts: u32,
    /// Fixed pause between attempts.
    pub delay: Duration,
}

impl Default for LoadRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay: Duration::from_secs(5),
        }
    }
}

impl LoadRetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }

    /// `LOAD_RETRY_ATTEMPTS` and `LOAD_RETRY_DELAY_SECONDS` override defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_attempts: std::env::var("LOAD_RETRY_ATTEMPTS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_attempts),
            delay: std::env::var("LOAD_RETRY_DELAY_SECONDS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.delay),
        }
    }
}

/// Run `load` until it succeeds, fails permanently, or attempts run out.
///
/// Returns the last error when every attempt fails.
pub async fn load_with_retry<T, E, F, Fut>(policy: LoadRetryPolicy, mut load: F) -> Result<T, E>
where
    E: TransientError,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match load().await {
            Ok(value) => {
                if attempt > 1 {
                    info!(attempt, "load succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if err.is_transient() && attempt < max_attempts => {
                warn!(
                    attempt,
                    max_attempts,
                    delay_ms = policy.delay.as_millis() as u64,
                    error = %err,
                    "transient load failure; retrying"
                );
                sleep(policy.delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
