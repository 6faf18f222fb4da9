//! Error types for the client SDK.

use thiserror::Error;

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors that can occur in the client SDK.
///
/// `Clone` is deliberate: a refresh or resync outcome is shared with every
/// caller that coalesced onto the same in-flight attempt.
#[derive(Error, Debug, Clone)]
pub enum ClientError {
    /// No credentials are available.
    #[error("not authenticated")]
    NotAuthenticated,

    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// The server explicitly rejected the session's credentials. Terminal:
    /// the session is logged out.
    #[error("credentials rejected: {0}")]
    CredentialsRejected(String),

    /// The server rejected the request for application reasons.
    #[error("server error: {0}")]
    Server(String),

    /// An operation was attempted in a state that does not allow it.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The provider does not support the requested capability.
    #[error("capability not supported: {0}")]
    Unsupported(String),

    /// Local storage I/O failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// Document-model error.
    #[error("state error: {0}")]
    State(#[from] tether_core::CoreError),

    /// Wire-protocol error.
    #[error("protocol error: {0}")]
    Protocol(#[from] tether_proto::ProtoError),
}

impl ClientError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Creates a server rejection error.
    pub fn server(message: impl Into<String>) -> Self {
        Self::Server(message.into())
    }

    /// Creates an invalid-state error.
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState(message.into())
    }

    /// Creates an unsupported-capability error.
    pub fn unsupported(capability: impl Into<String>) -> Self {
        Self::Unsupported(capability.into())
    }

    /// Creates a storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Transport { retryable, .. } => *retryable,
            ClientError::Server(_) => true,
            _ => false,
        }
    }

    /// Returns true if this error invalidates the session's credentials.
    pub fn is_rejection(&self) -> bool {
        matches!(self, ClientError::CredentialsRejected(_))
    }
}
