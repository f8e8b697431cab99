pub mod circuit_breaker;
pub mod envelope;
pub mod rate_limiter;
pub mod retry;
pub mod timeout;

pub use circuit_breaker::CircuitBreaker;
pub use envelope::{EnvelopeConfig, ResilienceEnvelope, ResilienceRegistry};
pub use rate_limiter::{Permit, RateLimiter};
pub use retry::{retry_with_backoff, MAX_RETRIES};
pub use timeout::{with_timeout, AI_CALL_TIMEOUT, STORE_TIMEOUT, VCS_TIMEOUT};
