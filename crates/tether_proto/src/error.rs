//! Error types for the wire protocol.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtoResult<T> = Result<T, ProtoError>;

/// Errors that can occur while parsing or applying protocol data.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtoError {
    /// A pointer string was malformed.
    #[error("invalid pointer: {0}")]
    InvalidPointer(String),

    /// A pointer did not resolve to an existing location.
    #[error("path not found: {0}")]
    PathNotFound(String),

    /// An operation was structurally invalid for its target.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// A `test` operation did not match the current value.
    #[error("test failed at {path}")]
    TestFailed {
        /// Pointer the test operation addressed.
        path: String,
    },

    /// A wire message could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),
}

impl ProtoError {
    /// Creates an invalid-pointer error.
    pub fn invalid_pointer(message: impl Into<String>) -> Self {
        Self::InvalidPointer(message.into())
    }

    /// Creates a path-not-found error.
    pub fn path_not_found(path: impl Into<String>) -> Self {
        Self::PathNotFound(path.into())
    }

    /// Creates an invalid-operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation(message.into())
    }

    /// Creates a decode error.
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode(message.into())
    }
}
