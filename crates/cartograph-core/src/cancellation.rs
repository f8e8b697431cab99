use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Tracks one cancellation token per in-flight analysis session so that a
/// caller (or an orchestration-level deadline) can cancel an entire
/// activation tree cooperatively. Every suspension point in the orchestrator
/// holds a clone of the relevant token and checks it at `.await` boundaries.
#[derive(Clone, Default)]
pub struct CancellationRegistry {
    tokens: Arc<RwLock<HashMap<Uuid, CancellationToken>>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, session_id: Uuid) -> CancellationToken {
        let token = CancellationToken::new();
        self.tokens.write().await.insert(session_id, token.clone());
        token
    }

    pub async fn cancel(&self, session_id: Uuid) {
        if let Some(token) = self.tokens.read().await.get(&session_id) {
            token.cancel();
        }
    }

    pub async fn unregister(&self, session_id: Uuid) {
        self.tokens.write().await.remove(&session_id);
    }

    /// Spawns a background task that cancels `session_id` once `deadline`
    /// elapses, implementing the per-analysis hard deadline from the
    /// concurrency model.
    pub fn arm_deadline(&self, session_id: Uuid, deadline: Duration) {
        let registry = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            registry.cancel(session_id).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancel_trips_the_registered_token() {
        let registry = CancellationRegistry::new();
        let session_id = Uuid::new_v4();
        let token = registry.register(session_id).await;
        assert!(!token.is_cancelled());
        registry.cancel(session_id).await;
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn deadline_cancels_after_elapsed() {
        let registry = CancellationRegistry::new();
        let session_id = Uuid::new_v4();
        let token = registry.register(session_id).await;
        registry.arm_deadline(session_id, Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(token.is_cancelled());
    }
}
