use std::future::Future;
use std::time::Duration;

use cartograph_types::CoreError;
use rand::Rng;
use tracing::warn;

pub const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(20);
const MULT: f64 = 2.0;

/// Runs `attempt` for up to `MAX_RETRIES` (default 3) attempts total, but
/// only for errors the taxonomy marks retryable. Wait between attempts grows
/// exponentially with jitter drawn uniformly from `[0.5, 1.0)`, per the
/// envelope's composition rules. `attempt` is the inner stack (circuit
/// breaker wrapping timeout wrapping rate limiter) so every retry re-enters
/// the limiter.
pub async fn retry_with_backoff<F, Fut, T>(mut attempt: F) -> Result<T, CoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CoreError>>,
{
    let mut last_err = None;
    for n in 0..MAX_RETRIES {
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(err) if err.retryable() && n + 1 < MAX_RETRIES => {
                let backoff = backoff_for_attempt(n);
                warn!(attempt = n, wait_ms = backoff.as_millis() as u64, error = %err, "retrying after backoff");
                tokio::time::sleep(backoff).await;
                last_err = Some(err);
            }
            Err(err) => return Err(err),
        }
    }
    Err(last_err.expect("loop always attempts at least once"))
}

fn backoff_for_attempt(n: u32) -> Duration {
    let base = INITIAL_BACKOFF.mul_f64(MULT.powi(n as i32)).min(MAX_BACKOFF);
    let jitter = rand::thread_rng().gen_range(0.5..1.0);
    base.mul_f64(jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn succeeds_without_retry_on_first_try() {
        let calls = AtomicU32::new(0);
        let result = retry_with_backoff(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, CoreError>(42) }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_retryable_errors_until_success() {
        let calls = AtomicU32::new(0);
        let result = retry_with_backoff(|| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(CoreError::Overloaded("busy".into()))
                } else {
                    Ok(99)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 99);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_errors_surface_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, CoreError> = retry_with_backoff(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(CoreError::Auth("bad key".into())) }
        })
        .await;
        assert!(matches!(result, Err(CoreError::Auth(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausting_retries_surfaces_the_last_error() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, CoreError> = retry_with_backoff(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(CoreError::Timeout { elapsed_ms: 1, context: "x".into() }) }
        })
        .await;
        assert!(matches!(result, Err(CoreError::Timeout { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), MAX_RETRIES);
    }
}
