//! Bounded retries with exponential backoff.
//!
//! Both cache-miss resolution and individual transfer chunks run through
//! [`RetryController::execute`]. Only the final outcome leaves the controller;
//! intermediate retryable failures are logged and absorbed.

use std::future::Future;
use std::time::Duration;
use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::config::RetryConfig;
use crate::errors::{AppError, Disposition, Result};

/// Maps a failure to retryable or terminal.
pub type Classifier = fn(&AppError) -> Disposition;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    /// Upper bound of the uniform random delay added to each backoff.
    pub jitter: Duration,
    /// Cap applied to the exponential part before jitter.
    pub max_delay: Duration,
    pub classifier: Classifier,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_millis(config.base_delay_ms),
            multiplier: config.multiplier,
            jitter: Duration::from_millis(config.jitter_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            classifier: AppError::disposition,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_classifier(mut self, classifier: Classifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// `base * multiplier^(attempt-1)`, capped, without jitter.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = secs.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        };
        self.backoff_for(attempt) + jitter
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

pub struct RetryController {
    policy: RetryPolicy,
    cancel: Option<CancellationToken>,
}

impl RetryController {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy, cancel: None }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().map_or(false, |t| t.is_cancelled())
    }

    pub async fn execute<T, F, Fut>(&self, label: &str, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            if self.is_cancelled() {
                return Err(AppError::Cancelled);
            }

            let err = match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        log::info!("✅ [RETRY] {} succeeded on attempt {}", label, attempt);
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if err.is_cancelled() {
                return Err(err);
            }

            if (self.policy.classifier)(&err) == Disposition::Terminal {
                log::debug!("⛔ [RETRY] {} failed terminally: {}", label, err);
                return Err(err);
            }

            if attempt >= max_attempts {
                log::error!("❌ [RETRY] {} failed after {} attempts: {}", label, attempt, err);
                return Err(AppError::Exhausted {
                    attempts: attempt,
                    last: Box::new(err),
                });
            }

            let delay = self.policy.delay_for(attempt);
            log::warn!(
                "⚠️ [RETRY] {} attempt {}/{} failed: {}; retrying in {:?}",
                label, attempt, max_attempts, err, delay
            );

            match &self.cancel {
                Some(token) => {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = token.cancelled() => return Err(AppError::Cancelled),
                    }
                }
                None => tokio::time::sleep(delay).await,
            }

            attempt += 1;
        }
    }
}
