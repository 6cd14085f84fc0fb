//! Error types for the geometry cache.

use thiserror::Error;

/// Geometry cache errors.
#[derive(Error, Debug)]
pub enum CacheError {
    /// The cache has not finished building.
    #[error("geometry cache is not ready")]
    NotReady,

    /// A projected allocation would exceed the memory budget.
    #[error("memory budget exceeded: need {needed} bytes, budget {budget}")]
    OutOfMemory { needed: u64, budget: u64 },

    /// Transport-level backend failure.
    #[error("backend transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The backend produced unexpected framing.
    #[error("backend protocol error: {0}")]
    Protocol(String),

    /// Persisted cache is corrupt or has an incompatible version.
    #[error("cache format error: {0}")]
    Format(String),

    /// Scratch or persistence IO failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;
