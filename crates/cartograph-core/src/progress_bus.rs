use cartograph_types::ProgressEvent;
use tokio::sync::broadcast;

const DEFAULT_CAPACITY: usize = 2048;

/// In-process pub/sub of orchestration lifecycle events. Publishing is
/// lock-free and never blocks the publisher; delivery is best-effort and
/// at-least-once per live subscriber. A subscriber that falls more than
/// `capacity` events behind receives `RecvError::Lagged` on its next poll —
/// the broadcast channel's own backlog, which is this bus's backpressure
/// mechanism for a slow subscriber.
#[derive(Clone)]
pub struct ProgressBus {
    tx: broadcast::Sender<ProgressEvent>,
}

impl ProgressBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Errors (no subscribers) are expected and ignored.
    pub fn publish(&self, event: ProgressEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for ProgressBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = ProgressBus::new();
        let mut rx = bus.subscribe();
        let session_id = Uuid::new_v4();
        bus.publish(ProgressEvent::AnalysisStarted {
            session_id,
            path: "/tmp/proj".into(),
            mode: "full".into(),
        });
        let event = rx.recv().await.unwrap();
        match event {
            ProgressEvent::AnalysisStarted { session_id: got, .. } => assert_eq!(got, session_id),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn publish_without_subscribers_does_not_panic() {
        let bus = ProgressBus::new();
        bus.publish(ProgressEvent::AnalysisError {
            session_id: Uuid::new_v4(),
            error: "boom".into(),
        });
    }

    #[tokio::test]
    async fn lagging_subscriber_observes_a_lag_error() {
        let bus = ProgressBus::with_capacity(2);
        let mut rx = bus.subscribe();
        for i in 0..5 {
            bus.publish(ProgressEvent::AgentStatus {
                agent_id: format!("AGN-Function-{i:04}"),
                status: "analyzing".into(),
                target: "src/lib.rs".into(),
            });
        }
        let result = rx.recv().await;
        assert!(matches!(result, Err(broadcast::error::RecvError::Lagged(_))));
    }
}
