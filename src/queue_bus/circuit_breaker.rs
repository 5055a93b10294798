use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: usize,
    pub failure_window: Duration,
    pub recovery_timeout: Duration,
    pub success_threshold: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window: Duration::from_secs(60),
            recovery_timeout: Duration::from_secs(30),
            success_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitStateKind {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
enum CircuitState {
    Closed,
    Open { opened_at: Instant },
    HalfOpen { successful_calls: usize },
}

struct FailureWindow {
    failures: Vec<Instant>,
    window: Duration,
}

impl FailureWindow {
    fn new(window: Duration) -> Self {
        Self {
            failures: Vec::new(),
            window,
        }
    }

    fn add_failure(&mut self, at: Instant) {
        self.failures.push(at);
        self.cleanup(at);
    }

    fn cleanup(&mut self, now: Instant) {
        self.failures.retain(|&f| now.duration_since(f) <= self.window);
    }

    fn count(&mut self, now: Instant) -> usize {
        self.cleanup(now);
        self.failures.len()
    }

    fn clear(&mut self) {
        self.failures.clear();
    }
}

#[derive(Debug, Default, Clone)]
pub struct CircuitBreakerStats {
    pub total_calls: u64,
    pub total_failures: u64,
    pub total_successes: u64,
    pub times_opened: u64,
}

/// Closed/Open/HalfOpen breaker gating calls to one downstream destination,
/// following the same three-state shape and failure-window accounting as the
/// teacher's `telegram::retry_handler::CircuitBreaker`.
pub struct CircuitBreaker {
    destination: String,
    config: CircuitBreakerConfig,
    state: RwLock<CircuitState>,
    failure_window: RwLock<FailureWindow>,
    stats: RwLock<CircuitBreakerStats>,
}

impl CircuitBreaker {
    pub fn new(destination: impl Into<String>, config: CircuitBreakerConfig) -> Arc<Self> {
        let window = config.failure_window;
        Arc::new(Self {
            destination: destination.into(),
            config,
            state: RwLock::new(CircuitState::Closed),
            failure_window: RwLock::new(FailureWindow::new(window)),
            stats: RwLock::new(CircuitBreakerStats::default()),
        })
    }

    pub async fn state_kind(&self) -> CircuitStateKind {
        match &*self.state.read().await {
            CircuitState::Closed => CircuitStateKind::Closed,
            CircuitState::Open { .. } => CircuitStateKind::Open,
            CircuitState::HalfOpen { .. } => CircuitStateKind::HalfOpen,
        }
    }

    /// Whether a call may proceed right now. If the circuit is `Open` and the
    /// recovery timeout has elapsed, this transitions it to `HalfOpen` as a
    /// side effect (the teacher's `try_half_open` behavior) and allows the call
    /// through as a probe.
    pub async fn can_execute(&self) -> bool {
        let mut state = self.state.write().await;
        match &*state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen { .. } => true,
            CircuitState::Open { opened_at } => {
                if opened_at.elapsed() >= self.config.recovery_timeout {
                    info!(destination = %self.destination, "circuit breaker entering half-open");
                    *state = CircuitState::HalfOpen { successful_calls: 0 };
                    true
                } else {
                    false
                }
            }
        }
    }

    pub async fn record_success(&self) {
        let mut stats = self.stats.write().await;
        stats.total_calls += 1;
        stats.total_successes += 1;
        drop(stats);

        let mut state = self.state.write().await;
        match &mut *state {
            CircuitState::Closed => {}
            CircuitState::HalfOpen { successful_calls } => {
                *successful_calls += 1;
                if *successful_calls >= self.config.success_threshold {
                    info!(destination = %self.destination, "circuit breaker closing after recovery");
                    *state = CircuitState::Closed;
                    self.failure_window.write().await.clear();
                }
            }
            CircuitState::Open { .. } => {}
        }
    }

    pub async fn record_failure(&self) {
        let mut stats = self.stats.write().await;
        stats.total_calls += 1;
        stats.total_failures += 1;
        drop(stats);

        let now = Instant::now();
        let mut window = self.failure_window.write().await;
        window.add_failure(now);
        let failures = window.count(now);
        drop(window);

        let mut state = self.state.write().await;
        match &*state {
            CircuitState::Closed => {
                if failures >= self.config.failure_threshold {
                    warn!(destination = %self.destination, failures, "circuit breaker opening");
                    *state = CircuitState::Open { opened_at: now };
                    self.stats.write().await.times_opened += 1;
                }
            }
            CircuitState::HalfOpen { .. } => {
                warn!(destination = %self.destination, "probe failed, circuit breaker reopening");
                *state = CircuitState::Open { opened_at: now };
                self.stats.write().await.times_opened += 1;
            }
            CircuitState::Open { .. } => {}
        }
    }

    pub async fn stats(&self) -> CircuitBreakerStats {
        self.stats.read().await.clone()
    }

    pub async fn reset(&self) {
        *self.state.write().await = CircuitState::Closed;
        self.failure_window.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_opens_after_threshold_failures() {
        let cb = CircuitBreaker::new("redis", CircuitBreakerConfig {
            failure_threshold: 3,
            ..Default::default()
        });
        for _ in 0..3 {
            cb.record_failure().await;
        }
        assert_eq!(cb.state_kind().await, CircuitStateKind::Open);
        assert!(!cb.can_execute().await);
    }

    #[tokio::test]
    async fn test_half_open_closes_after_success_threshold() {
        let cb = CircuitBreaker::new(
            "redis",
            CircuitBreakerConfig {
                failure_threshold: 1,
                recovery_timeout: Duration::from_millis(1),
                success_threshold: 2,
                ..Default::default()
            },
        );
        cb.record_failure().await;
        assert_eq!(cb.state_kind().await, CircuitStateKind::Open);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(cb.can_execute().await);
        assert_eq!(cb.state_kind().await, CircuitStateKind::HalfOpen);
        cb.record_success().await;
        assert_eq!(cb.state_kind().await, CircuitStateKind::HalfOpen);
        cb.record_success().await;
        assert_eq!(cb.state_kind().await, CircuitStateKind::Closed);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let cb = CircuitBreaker::new(
            "redis",
            CircuitBreakerConfig {
                failure_threshold: 1,
                recovery_timeout: Duration::from_millis(1),
                ..Default::default()
            },
        );
        cb.record_failure().await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(cb.can_execute().await);
        cb.record_failure().await;
        assert_eq!(cb.state_kind().await, CircuitStateKind::Open);
    }
}
