use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use careassist_config::RetryConfig;
use rand::Rng;
use tracing::{debug, info, warn};

/// Bounded exponential backoff. Delay before retry `n` (0-based) is
/// `min(base * multiplier^n, max)`; jitter only ever shortens a delay.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    base_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            multiplier: 2.0,
            jitter: 0.0,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            multiplier: config.multiplier.max(1.0),
            jitter: config.jitter.clamp(0.0, 1.0),
        }
    }

    /// A policy that makes exactly one attempt.
    pub fn no_retries() -> Self {
        Self::new(0, Duration::ZERO, Duration::ZERO)
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier.max(1.0);
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Un-jittered delay before retry `retry` (0-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let scaled = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::from_secs_f64(scaled.min(self.max_delay.as_secs_f64()))
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let shave = rand::rng().random_range(0.0..=self.jitter);
        delay.mul_f64(1.0 - shave)
    }

    /// Run `attempt` until it succeeds, fails with an error `is_retryable`
    /// rejects, or `max_retries` retries have been spent. The last error is
    /// returned on exhaustion. `attempt` receives the 0-based attempt number.
    pub async fn run<T, E, F, Fut, P>(&self, mut attempt: F, is_retryable: P) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: Display,
    {
        let mut retries = 0;
        loop {
            debug!(attempt = retries + 1, "attempting");
            match attempt(retries).await {
                Ok(value) => {
                    if retries > 0 {
                        info!(retries, "succeeded after retrying");
                    }
                    return Ok(value);
                }
                Err(err) if !is_retryable(&err) => {
                    debug!(attempt = retries + 1, error = %err, "terminal failure, not retrying");
                    return Err(err);
                }
                Err(err) if retries >= self.max_retries => {
                    warn!(attempts = retries + 1, error = %err, "retries exhausted");
                    return Err(err);
                }
                Err(err) => {
                    let delay = self.jittered(self.delay_for(retries));
                    warn!(
                        retry = retries + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retryable failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    retries += 1;
                }
            }
        }
    }
}
