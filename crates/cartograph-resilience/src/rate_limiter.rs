use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

const WINDOW: Duration = Duration::from_secs(60);
const POLL_INTERVAL: Duration = Duration::from_millis(25);

struct Entry {
    id: u64,
    at: Instant,
    tokens: u64,
}

struct State {
    window: VecDeque<Entry>,
    next_id: u64,
    next_ticket_to_serve: u64,
    next_ticket_to_issue: u64,
}

/// Token-bucket rate limiter enforcing both a requests-per-minute and a
/// tokens-per-minute ceiling over a rolling 60-second window, FIFO across
/// waiting callers. Callers report an estimated cost on `acquire` and the
/// actual cost on completion via the returned `Permit`.
pub struct RateLimiter {
    state: Mutex<State>,
    max_rpm: u32,
    max_tpm: u64,
}

pub struct Permit {
    id: u64,
}

impl RateLimiter {
    pub fn new(max_rpm: u32, max_tpm: u64) -> Self {
        Self {
            state: Mutex::new(State {
                window: VecDeque::new(),
                next_id: 0,
                next_ticket_to_serve: 0,
                next_ticket_to_issue: 0,
            }),
            max_rpm,
            max_tpm,
        }
    }

    /// Blocks until a slot is available under both ceilings, honoring FIFO
    /// order among waiting callers. Returns a `Permit` plus the time spent
    /// waiting.
    pub async fn acquire(&self, estimated_tokens: u64) -> (Permit, Duration) {
        let started = Instant::now();
        let ticket = {
            let mut state = self.state.lock().await;
            let ticket = state.next_ticket_to_issue;
            state.next_ticket_to_issue += 1;
            ticket
        };

        loop {
            let mut state = self.state.lock().await;
            prune(&mut state.window);
            let is_my_turn = ticket == state.next_ticket_to_serve;
            let requests_in_window = state.window.len() as u32;
            let tokens_in_window: u64 = state.window.iter().map(|e| e.tokens).sum();
            let has_capacity = requests_in_window < self.max_rpm
                && tokens_in_window.saturating_add(estimated_tokens) <= self.max_tpm;

            if is_my_turn && has_capacity {
                let id = state.next_id;
                state.next_id += 1;
                state.window.push_back(Entry {
                    id,
                    at: Instant::now(),
                    tokens: estimated_tokens,
                });
                state.next_ticket_to_serve += 1;
                return (Permit { id }, started.elapsed());
            }
            drop(state);
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Reconciles the estimated cost recorded at `acquire` time with the
    /// actual token usage reported after the call completes.
    pub async fn report_actual(&self, permit: Permit, actual_tokens: u64) {
        let mut state = self.state.lock().await;
        if let Some(entry) = state.window.iter_mut().find(|e| e.id == permit.id) {
            entry.tokens = actual_tokens;
        }
    }

    /// Calls made and tokens reported within the trailing 60-second window.
    pub async fn window_usage(&self) -> (u32, u64) {
        let mut state = self.state.lock().await;
        prune(&mut state.window);
        let requests = state.window.len() as u32;
        let tokens = state.window.iter().map(|e| e.tokens).sum();
        (requests, tokens)
    }
}

fn prune(window: &mut VecDeque<Entry>) {
    let now = Instant::now();
    while let Some(front) = window.front() {
        if now.duration_since(front.at) > WINDOW {
            window.pop_front();
        } else {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_under_ceiling_does_not_block() {
        let limiter = RateLimiter::new(10, 10_000);
        let (_, waited) = limiter.acquire(100).await;
        assert!(waited < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn respects_request_ceiling_fifo() {
        let limiter = RateLimiter::new(1, 1_000_000);
        let (permit, _) = limiter.acquire(1).await;
        limiter.report_actual(permit, 1).await;
        let (requests, _) = limiter.window_usage().await;
        assert_eq!(requests, 1);
    }

    #[tokio::test]
    async fn report_actual_updates_window_tokens() {
        let limiter = RateLimiter::new(10, 10_000);
        let (permit, _) = limiter.acquire(5).await;
        limiter.report_actual(permit, 500).await;
        let (_, tokens) = limiter.window_usage().await;
        assert_eq!(tokens, 500);
    }
}
