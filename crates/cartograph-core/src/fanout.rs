use cartograph_types::ProgressEvent;

/// An external consumer that relays `ProgressBus` events out of process
/// (over a WebSocket, SSE stream, or similar transport). Not implemented by
/// this repository — wiring a live transport is the caller's job — but the
/// trait is declared here so a host binary can depend on it without pulling
/// in the orchestrator crate.
pub trait FanOut: Send + Sync {
    fn deliver(&self, event: &ProgressEvent);
}
