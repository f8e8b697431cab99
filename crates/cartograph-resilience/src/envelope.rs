use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use cartograph_types::CoreError;
use tokio::sync::RwLock;

use crate::circuit_breaker::CircuitBreaker;
use crate::rate_limiter::RateLimiter;
use crate::retry::retry_with_backoff;
use crate::timeout::with_timeout;

#[derive(Debug, Clone)]
pub struct EnvelopeConfig {
    pub timeout: Duration,
    pub rate_rpm: u32,
    pub rate_tpm: u64,
    pub breaker_threshold: u32,
    pub breaker_recovery: Duration,
}

impl Default for EnvelopeConfig {
    fn default() -> Self {
        Self {
            timeout: crate::timeout::AI_CALL_TIMEOUT,
            rate_rpm: 50,
            rate_tpm: 40_000,
            breaker_threshold: 3,
            breaker_recovery: Duration::from_secs(120),
        }
    }
}

/// The composed timeout + rate limiter + circuit breaker + retry pipeline
/// wrapping every call to one logical upstream. Composition is fixed:
/// `Retry(CircuitBreaker(Timeout(RateLimiter(call))))` — the breaker must
/// see a timed-out call as a failure, the limiter must account for tokens
/// even on a call that later times out, and retries must re-enter the
/// limiter.
pub struct ResilienceEnvelope {
    upstream: String,
    rate_limiter: RateLimiter,
    breaker: CircuitBreaker,
    timeout: Duration,
}

impl ResilienceEnvelope {
    pub fn new(upstream: impl Into<String>, config: EnvelopeConfig) -> Self {
        let upstream = upstream.into();
        Self {
            rate_limiter: RateLimiter::new(config.rate_rpm, config.rate_tpm),
            breaker: CircuitBreaker::new(upstream.clone(), config.breaker_threshold, config.breaker_recovery),
            timeout: config.timeout,
            upstream,
        }
    }

    /// Runs `call` under the full envelope. `call` returns the value plus
    /// its actual token cost, which reconciles with the estimate passed to
    /// the rate limiter regardless of whether the call ultimately succeeds.
    pub async fn execute<F, Fut, T>(&self, estimated_tokens: u64, context: &str, mut call: F) -> Result<T, CoreError>
    where
        F: FnMut() -> Fut,
        T: Send,
        Fut: Future<Output = Result<(T, u64), CoreError>>,
    {
        let upstream = self.upstream.clone();
        let result = retry_with_backoff(|| async {
            self.breaker.try_acquire().await?;
            let (permit, _waited) = self.rate_limiter.acquire(estimated_tokens).await;
            let attempt_result = with_timeout(self.timeout, context, call()).await;
            match &attempt_result {
                Ok((_, actual_tokens)) => {
                    self.rate_limiter.report_actual(permit, *actual_tokens).await;
                    self.breaker.record_success().await;
                }
                Err(err) => {
                    self.rate_limiter.report_actual(permit, estimated_tokens).await;
                    if err.retryable() {
                        self.breaker.record_failure().await;
                    }
                }
            }
            attempt_result
        })
        .await;

        result.map(|(value, _)| value).map_err(|err| {
            if let CoreError::CircuitOpen { .. } = &err {
                tracing::error!(upstream = %upstream, "envelope exhausted retries with circuit open");
            }
            err
        })
    }

    pub async fn circuit_is_open(&self) -> bool {
        self.breaker.is_open().await
    }
}

/// Holds one `ResilienceEnvelope` per logical upstream, created once at
/// startup and handed around via dependency injection rather than kept as a
/// process-wide singleton.
#[derive(Clone, Default)]
pub struct ResilienceRegistry {
    envelopes: Arc<RwLock<HashMap<String, Arc<ResilienceEnvelope>>>>,
    config: EnvelopeConfig,
}

impl ResilienceRegistry {
    pub fn new(config: EnvelopeConfig) -> Self {
        Self {
            envelopes: Arc::new(RwLock::new(HashMap::new())),
            config,
        }
    }

    pub async fn envelope_for(&self, upstream: &str) -> Arc<ResilienceEnvelope> {
        if let Some(existing) = self.envelopes.read().await.get(upstream) {
            return existing.clone();
        }
        let mut envelopes = self.envelopes.write().await;
        envelopes
            .entry(upstream.to_string())
            .or_insert_with(|| Arc::new(ResilienceEnvelope::new(upstream, self.config.clone())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn fast_config() -> EnvelopeConfig {
        EnvelopeConfig {
            timeout: Duration::from_millis(200),
            rate_rpm: 1000,
            rate_tpm: 1_000_000,
            breaker_threshold: 3,
            breaker_recovery: Duration::from_millis(50),
        }
    }

    #[tokio::test]
    async fn happy_path_returns_value_and_trips_no_breaker() {
        let envelope = ResilienceEnvelope::new("vendor-a", fast_config());
        let result = envelope
            .execute(10, "test", || async { Ok::<_, CoreError>((7u32, 10u64)) })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert!(!envelope.circuit_is_open().await);
    }

    #[tokio::test]
    async fn transient_failures_are_retried_then_succeed() {
        let calls = AtomicU32::new(0);
        let envelope = ResilienceEnvelope::new("vendor-a", fast_config());
        let result = envelope
            .execute(10, "test", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(CoreError::Overloaded("busy".into()))
                    } else {
                        Ok((1u32, 10u64))
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 1);
        assert!(!envelope.circuit_is_open().await);
    }

    #[tokio::test]
    async fn persistent_failures_trip_the_breaker() {
        let envelope = ResilienceEnvelope::new("vendor-a", fast_config());
        let result: Result<u32, CoreError> = envelope
            .execute(10, "test", || async { Err(CoreError::Overloaded("down".into())) })
            .await;
        assert!(result.is_err());
        assert!(envelope.circuit_is_open().await);
    }

    #[tokio::test]
    async fn registry_reuses_the_same_envelope_per_upstream() {
        let registry = ResilienceRegistry::new(fast_config());
        let a = registry.envelope_for("vendor-a").await;
        let b = registry.envelope_for("vendor-a").await;
        assert!(Arc::ptr_eq(&a, &b));
    }
}
