use std::future::Future;
use std::time::Duration;

use cartograph_types::CoreError;

/// Named per-attempt deadlines, per the defaults in the concurrency model.
pub const AI_CALL_TIMEOUT: Duration = Duration::from_secs(90);
pub const VCS_TIMEOUT: Duration = Duration::from_secs(30);
pub const STORE_TIMEOUT: Duration = Duration::from_secs(5);

/// Runs `fut` under a single-shot deadline, converting expiry into
/// `CoreError::Timeout`. This is the innermost-but-one wrapper in the
/// envelope: it sees only one attempt, never the retry loop as a whole.
pub async fn with_timeout<F, T>(duration: Duration, context: &str, fut: F) -> Result<T, CoreError>
where
    F: Future<Output = Result<T, CoreError>>,
{
    match tokio::time::timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => Err(CoreError::Timeout {
            elapsed_ms: duration.as_millis() as u64,
            context: context.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn completes_before_deadline() {
        let result: Result<u32, CoreError> =
            with_timeout(Duration::from_millis(100), "test", async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn expiry_surfaces_as_timeout() {
        let result: Result<u32, CoreError> = with_timeout(Duration::from_millis(10), "slow-call", async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(1)
        })
        .await;
        assert!(matches!(result, Err(CoreError::Timeout { .. })));
    }
}
