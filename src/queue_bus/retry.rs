use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::error::{OrchestratorError, Result};
use crate::queue_bus::circuit_breaker::CircuitBreaker;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    pub enable_jitter: bool,
    pub jitter_range: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            enable_jitter: true,
            jitter_range: 0.1,
        }
    }
}

fn calculate_delay(config: &RetryConfig, attempt: usize) -> Duration {
    let exp = config.backoff_factor.powi(attempt as i32);
    let base_ms = (config.initial_delay.as_millis() as f64 * exp)
        .min(config.max_delay.as_millis() as f64);

    let delay_ms = if config.enable_jitter {
        let jitter = base_ms * config.jitter_range;
        let mut rng = rand::thread_rng();
        let offset: f64 = rng.gen_range(-jitter..=jitter);
        (base_ms + offset).max(0.0)
    } else {
        base_ms
    };

    Duration::from_millis(delay_ms as u64)
}

/// Shared retry-with-backoff-and-jitter combinator, generalizing the teacher's
/// `RetryHandler::execute_with_retry` into a circuit-breaker-gated helper any
/// `QueueBus` destination can reuse.
pub struct RetryHandler {
    config: RetryConfig,
    circuit_breaker: Arc<CircuitBreaker>,
}

impl RetryHandler {
    pub fn new(config: RetryConfig, circuit_breaker: Arc<CircuitBreaker>) -> Self {
        Self { config, circuit_breaker }
    }

    pub async fn execute_with_retry<T, F, Fut>(&self, destination: &str, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut last_error: Option<OrchestratorError> = None;

        for attempt in 0..self.config.max_attempts {
            if !self.circuit_breaker.can_execute().await {
                return Err(OrchestratorError::CircuitOpen {
                    destination: destination.to_string(),
                });
            }

            match operation().await {
                Ok(value) => {
                    self.circuit_breaker.record_success().await;
                    return Ok(value);
                }
                Err(error) => {
                    self.circuit_breaker.record_failure().await;

                    if !error.is_retryable() {
                        return Err(error);
                    }

                    if attempt + 1 == self.config.max_attempts {
                        last_error = Some(error);
                        break;
                    }

                    let delay = calculate_delay(&self.config, attempt);
                    warn!(
                        destination,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "retrying after failure"
                    );
                    last_error = Some(error);
                    tokio::time::sleep(delay).await;
                }
            }
        }

        let last_error = last_error.expect("loop always sets last_error before exhausting attempts");
        debug!(destination, "retry attempts exhausted");
        Err(OrchestratorError::RetryExhausted {
            attempts: self.config.max_attempts,
            last_error: last_error.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue_bus::circuit_breaker::CircuitBreakerConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_retries_until_success() {
        let cb = CircuitBreaker::new("dest", CircuitBreakerConfig::default());
        let handler = RetryHandler::new(
            RetryConfig {
                max_attempts: 5,
                initial_delay: Duration::from_millis(1),
                ..Default::default()
            },
            cb,
        );
        let attempts = AtomicUsize::new(0);
        let result = handler
            .execute_with_retry("dest", || {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(OrchestratorError::transient("not yet"))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(result, 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_error_short_circuits() {
        let cb = CircuitBreaker::new("dest", CircuitBreakerConfig::default());
        let handler = RetryHandler::new(RetryConfig::default(), cb);
        let attempts = AtomicUsize::new(0);
        let result: Result<()> = handler
            .execute_with_retry("dest", || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(OrchestratorError::validation("bad payload")) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_reports_retry_exhausted() {
        let cb = CircuitBreaker::new("dest", CircuitBreakerConfig {
            failure_threshold: 100,
            ..Default::default()
        });
        let handler = RetryHandler::new(
            RetryConfig {
                max_attempts: 2,
                initial_delay: Duration::from_millis(1),
                ..Default::default()
            },
            cb,
        );
        let result: Result<()> = handler
            .execute_with_retry("dest", || async { Err(OrchestratorError::transient("down")) })
            .await;
        match result {
            Err(OrchestratorError::RetryExhausted { attempts, .. }) => assert_eq!(attempts, 2),
            other => panic!("expected RetryExhausted, got {other:?}"),
        }
    }
}
