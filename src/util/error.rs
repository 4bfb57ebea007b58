//! Error types for the progressive tracer.

use thiserror::Error;

/// Main error type for scene synchronization and accumulation.
#[derive(Error, Debug)]
pub enum Error {
    /// Allocation failed for a buffer or image
    #[error("Out of GPU memory allocating {resource} ({bytes} bytes)")]
    ResourceExhausted { resource: String, bytes: u64 },

    /// Kernel resource name could not be resolved
    #[error("Kernel binding unresolved: {0}")]
    MissingBinding(String),

    /// Upload length does not equal capacity × stride
    #[error("Stride mismatch in {slot}: buffer holds {expected} bytes, upload has {actual}")]
    StrideMismatch {
        slot: String,
        expected: u64,
        actual: u64,
    },

    /// Handle not owned by the backend
    #[error("Unknown {kind} handle: {id}")]
    UnknownResource { kind: &'static str, id: u64 },

    /// Blend requested before begin_frame produced image targets
    #[error("Accumulation targets not ready")]
    TargetsNotReady,

    /// Kernel dispatch failed
    #[error("Kernel dispatch failed: {0}")]
    Dispatch(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Settings (de)serialization error
    #[error("Invalid settings: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error with message
    #[error("{0}")]
    Other(String),
}

/// How the render loop reacts to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Absorbed locally: the binding is skipped and the frame proceeds.
    Recoverable,
    /// Surfaced as a per-frame skip; retried next frame.
    ResourceExhaustion,
    /// A defect in the synchronization policy itself.
    InvariantViolation,
}

impl Error {
    /// Create an "other" error from a string.
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Create a resource exhaustion error.
    pub fn exhausted(resource: impl Into<String>, bytes: u64) -> Self {
        Self::ResourceExhausted {
            resource: resource.into(),
            bytes,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::MissingBinding(_) => ErrorCategory::Recoverable,
            Error::ResourceExhausted { .. } | Error::Dispatch(_) => ErrorCategory::ResourceExhaustion,
            Error::StrideMismatch { .. } | Error::UnknownResource { .. } | Error::TargetsNotReady => {
                ErrorCategory::InvariantViolation
            }
            Error::Io(_) | Error::Json(_) | Error::Other(_) => ErrorCategory::Recoverable,
        }
    }
}

/// Result type alias for tracer operations.
pub type Result<T> = std::result::Result<T, Error>;
