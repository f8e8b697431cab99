use thiserror::Error;

/// The closed error taxonomy shared by every crate in the workspace.
///
/// Kinds mirror the table in the error handling design: each carries enough
/// context to locate the failure, and `retryable()` tells the resilience
/// envelope whether a failure of this kind should be retried.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("upstream overloaded: {0}")]
    Overloaded(String),

    #[error("upstream transient failure: {0}")]
    UpstreamTransient(String),

    #[error("timed out after {elapsed_ms}ms: {context}")]
    Timeout { elapsed_ms: u64, context: String },

    #[error("circuit open for upstream {upstream}")]
    CircuitOpen { upstream: String },

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("illegal transition: {from} -> {to}")]
    IllegalTransition { from: String, to: String },

    #[error("path is not a vcs working tree: {0}")]
    VcsRequired(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("operation cancelled")]
    Cancelled,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("path out of scope: {0}")]
    PathOutOfScope(String),

    #[error("ambiguous multi-hunk fix, cannot apply unambiguously")]
    MultiHunkUnsupported,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("storage error: {0}")]
    Storage(String),
}

impl CoreError {
    /// Whether the envelope's retry loop should re-attempt a call that
    /// failed with this error kind.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            CoreError::RateLimited(_)
                | CoreError::Overloaded(_)
                | CoreError::UpstreamTransient(_)
                | CoreError::Timeout { .. }
                | CoreError::CircuitOpen { .. }
        )
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
