//! Unified error types for the Convoy agent

use thiserror::Error;

/// Unified error type for all agent operations
///
/// The variants map one-to-one onto the behaviors the rest of the system
/// keys off: transient errors are retried with backoff, auth errors abort
/// the process, resolution errors surface directly to the user.
#[derive(Error, Debug)]
pub enum AgentError {
    /// Connection reset, timeout or 5xx from the coordination service.
    /// Retried with bounded exponential backoff.
    #[error("transient network error: {0}")]
    Transient(String),

    /// 401/403 from the service. Never retried.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// A search query could not resolve a build scope.
    #[error("no build scope: {0}")]
    Scope(String),

    /// Zero matches for a search, or a never-set metadata key.
    #[error("not found: {0}")]
    NotFound(String),

    /// A single-match query resolved artifacts from more than one job.
    #[error("ambiguous match: {0}")]
    AmbiguousMatch(String),

    /// Downloaded or uploaded bytes failed checksum/length verification.
    #[error("integrity check failed: {0}")]
    Integrity(String),

    /// The bootstrap child process crashed or could not be spawned.
    #[error("process error: {0}")]
    Process(String),

    /// The service answered with an unexpected shape.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AgentError {
    /// Whether the API client should retry the call that produced this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, AgentError::Transient(_))
    }

    /// Process exit code for this error when it reaches the binary edge.
    ///
    /// 1 = job/script or generic failure, 2 = agent-level fatal
    /// (registration/auth), 3 = artifact resolution failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            AgentError::Auth(_) => 2,
            AgentError::Scope(_) | AgentError::NotFound(_) | AgentError::AmbiguousMatch(_) => 3,
            _ => 1,
        }
    }
}

/// Result type alias using AgentError
pub type Result<T> = std::result::Result<T, AgentError>;
