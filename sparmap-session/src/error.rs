//! Error types for sessions.

use sparmap_cache::CacheError;
use thiserror::Error;

/// Session and requestor errors.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The shared geometry cache has not been built yet.
    #[error("geometry cache is not ready")]
    CacheNotReady,

    /// The session itself has not been built yet.
    #[error("session is not built")]
    NotReady,

    /// A session build would exceed the memory budget.
    #[error("memory budget exceeded: need {needed} bytes, budget {budget}")]
    OutOfMemory { needed: u64, budget: u64 },

    /// A streaming consumer aborted the transfer.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// Unknown session id.
    #[error("unknown session {0}")]
    UnknownSession(String),

    /// Propagated cache/backend failure.
    #[error(transparent)]
    Cache(#[from] CacheError),
}

impl SessionError {
    /// Whether retrying after evicting a session could succeed.
    pub fn is_out_of_memory(&self) -> bool {
        matches!(
            self,
            SessionError::OutOfMemory { .. } | SessionError::Cache(CacheError::OutOfMemory { .. })
        )
    }
}

/// Result type for session operations.
pub type Result<T> = std::result::Result<T, SessionError>;
