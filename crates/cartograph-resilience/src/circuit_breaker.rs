use std::time::{Duration, Instant};

use cartograph_types::CoreError;
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

struct Inner {
    state: BreakerState,
    failure_count: u32,
    tripped_at: Option<Instant>,
}

/// Per-upstream circuit breaker with the `{Closed, Open, HalfOpen}` state
/// machine. All transitions happen under a single mutex so they are atomic
/// with respect to concurrent callers.
pub struct CircuitBreaker {
    upstream: String,
    threshold: u32,
    recovery: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(upstream: impl Into<String>, threshold: u32, recovery: Duration) -> Self {
        Self {
            upstream: upstream.into(),
            threshold,
            recovery,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failure_count: 0,
                tripped_at: None,
            }),
        }
    }

    /// Checks whether a call is currently permitted, transitioning
    /// `Open -> HalfOpen` if the recovery window has elapsed. Returns
    /// `Err(CircuitOpen)` when the call must fail fast, and a flag telling
    /// the caller whether it is holding the sole HalfOpen probe slot.
    pub async fn try_acquire(&self) -> Result<bool, CoreError> {
        let mut inner = self.inner.lock().await;
        match inner.state {
            BreakerState::Closed => Ok(false),
            BreakerState::Open => {
                let elapsed = inner.tripped_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.recovery {
                    inner.state = BreakerState::HalfOpen;
                    info!(upstream = %self.upstream, "circuit breaker entering half-open probe");
                    Ok(true)
                } else {
                    Err(CoreError::CircuitOpen {
                        upstream: self.upstream.clone(),
                    })
                }
            }
            BreakerState::HalfOpen => Err(CoreError::CircuitOpen {
                upstream: self.upstream.clone(),
            }),
        }
    }

    pub async fn record_success(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state != BreakerState::Closed {
            info!(upstream = %self.upstream, "circuit breaker reset to closed");
        }
        inner.state = BreakerState::Closed;
        inner.failure_count = 0;
        inner.tripped_at = None;
    }

    pub async fn record_failure(&self) {
        let mut inner = self.inner.lock().await;
        match inner.state {
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.tripped_at = Some(Instant::now());
                warn!(upstream = %self.upstream, "half-open probe failed, circuit re-opened");
            }
            BreakerState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.threshold {
                    inner.state = BreakerState::Open;
                    inner.tripped_at = Some(Instant::now());
                    warn!(upstream = %self.upstream, threshold = self.threshold, "circuit breaker tripped open");
                }
            }
            BreakerState::Open => {}
        }
    }

    pub async fn is_open(&self) -> bool {
        matches!(self.inner.lock().await.state, BreakerState::Open)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn trips_open_after_threshold_consecutive_failures() {
        let breaker = CircuitBreaker::new("test", 3, Duration::from_secs(60));
        for _ in 0..3 {
            breaker.record_failure().await;
        }
        assert!(breaker.is_open().await);
        assert!(matches!(breaker.try_acquire().await, Err(CoreError::CircuitOpen { .. })));
    }

    #[tokio::test]
    async fn success_resets_failure_count() {
        let breaker = CircuitBreaker::new("test", 3, Duration::from_secs(60));
        breaker.record_failure().await;
        breaker.record_failure().await;
        breaker.record_success().await;
        breaker.record_failure().await;
        assert!(!breaker.is_open().await);
    }

    #[tokio::test]
    async fn half_open_probe_failure_reopens_with_fresh_timer() {
        let breaker = CircuitBreaker::new("test", 1, Duration::from_millis(20));
        breaker.record_failure().await;
        assert!(breaker.is_open().await);
        tokio::time::sleep(Duration::from_millis(40)).await;
        let probing = breaker.try_acquire().await.unwrap();
        assert!(probing);
        breaker.record_failure().await;
        assert!(breaker.is_open().await);
    }

    #[tokio::test]
    async fn half_open_probe_success_closes_the_breaker() {
        let breaker = CircuitBreaker::new("test", 1, Duration::from_millis(20));
        breaker.record_failure().await;
        tokio::time::sleep(Duration::from_millis(40)).await;
        breaker.try_acquire().await.unwrap();
        breaker.record_success().await;
        assert!(!breaker.is_open().await);
        assert!(!breaker.try_acquire().await.unwrap());
    }
}
