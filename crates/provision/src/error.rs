//! Engine error taxonomy.

use thiserror::Error;

use crate::store::StoreError;

/// Coarse classification used by callers to map errors onto their own
/// protocol (HTTP status, CLI exit code).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed argument; nothing changed.
    Input,
    /// Request understood but cannot be completed; nothing changed.
    Conflict,
    /// The addressed object does not exist.
    NotFound,
    /// Unexpected failure below the engine.
    Internal,
}

/// Errors returned by engine operations.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Malformed argument (out-of-range table index, missing identifiers).
    #[error("Invalid input: {0}")]
    Input(String),

    /// Understood but cannot complete (duplicate hardware id, double rebind).
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Object referenced by an administrative call does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Persistence backend failure.
    #[error("Storage error: {0}")]
    Internal(#[from] StoreError),

    /// Boot template could not be rendered.
    #[error("Template render error: {0}")]
    Render(String),
}

impl EngineError {
    /// Classify this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Input(_) => ErrorKind::Input,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Internal(_) | Self::Render(_) => ErrorKind::Internal,
        }
    }
}

/// Result alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;
