//! Engine error types.

use meshsync_codec::CodecError;
use meshsync_protocol::ConflictId;
use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors surfaced by the replication engine.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Malformed caller input. Not retryable.
    #[error("validation error: {0}")]
    Validation(String),

    /// A bundle or peer references an unknown or incompatible schema.
    /// The whole bundle is rejected.
    #[error("schema error: {0}")]
    Schema(String),

    /// A bundle container is unreadable or fails its integrity hash.
    #[error("bundle error: {0}")]
    Bundle(String),

    /// The underlying store failed; the enclosing transaction was rolled
    /// back. Retryable.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Encoding or decoding a replicated blob failed.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Transport failure reported by an adapter.
    #[error("transport error: {message}")]
    Transport {
        /// Adapter-provided description.
        message: String,
        /// Whether the sync loop should retry with backoff.
        retryable: bool,
    },

    /// Not a failure: a resolver declined to decide and left the conflict
    /// for an operator.
    #[error("conflict {conflict_id} awaits manual resolution")]
    ConflictPending {
        /// The deferred conflict.
        conflict_id: ConflictId,
    },

    /// A cooperative cancellation was honoured.
    #[error("operation cancelled")]
    Cancelled,

    /// The requested action is not valid in the current state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Filesystem failure around bundle files.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Creates a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Creates a schema error.
    pub fn schema(message: impl Into<String>) -> Self {
        Self::Schema(message.into())
    }

    /// Creates a bundle error.
    pub fn bundle(message: impl Into<String>) -> Self {
        Self::Bundle(message.into())
    }

    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a fatal transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// True if the sync loop should back off and retry.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Transport { retryable, .. } => *retryable,
            EngineError::Database(_) => true,
            _ => false,
        }
    }
}
