//! Bounded exponential backoff for transient backend failures.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::config::RouterConfig;
use crate::error::BackendError;

/// Retry policy for one (credential, request) pair. Only
/// `BackendError::Transient` is retried; auth and quota failures return
/// immediately so the failover layer can act on them.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub factor: f64,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RouterConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RouterConfig) -> Self {
        Self {
            max_retries: config.transient_retries,
            initial_delay: config.initial_delay,
            factor: config.backoff_factor,
            max_delay: config.max_delay,
            jitter: config.jitter,
        }
    }

    /// Policy that never sleeps or retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            initial_delay: Duration::ZERO,
            factor: 1.0,
            max_delay: Duration::ZERO,
            jitter: false,
        }
    }

    /// Delay before retry number `retry` (0-based), without jitter.
    pub fn base_delay(&self, retry: u32) -> Duration {
        let secs = self.initial_delay.as_secs_f64() * self.factor.powi(retry as i32);
        let capped = secs.min(self.max_delay.as_secs_f64());
        if capped.is_finite() && capped > 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            Duration::ZERO
        }
    }

    /// Delay before retry number `retry`, scaled by `[0.5, 1.5)` when jitter is on.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let base = self.base_delay(retry);
        if !self.jitter || base.is_zero() {
            return base;
        }
        let scale = 0.5 + rand::thread_rng().gen_range(0.0..1.0);
        base.mul_f64(scale)
    }

    /// Run `op`, retrying transient failures up to `max_retries` times.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T, BackendError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        let mut retry = 0;
        loop {
            match op().await {
                Err(e) if e.is_transient() && retry < self.max_retries => {
                    let delay = self.delay_for(retry);
                    tracing::debug!(retry = retry + 1, delay_ms = delay.as_millis() as u64, error = %e, "Retrying transient failure");
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
                other => return other,
            }
        }
    }
}
