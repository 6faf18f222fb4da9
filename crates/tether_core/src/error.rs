//! Error types for the document model.

use thiserror::Error;

/// Result type for state operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur while validating or mutating space state.
#[derive(Error, Debug, Clone)]
pub enum CoreError {
    /// An object id failed charset or length validation.
    #[error("invalid object id: {0}")]
    InvalidObjectId(String),

    /// A referenced object does not exist.
    #[error("object not found: {0}")]
    ObjectNotFound(String),

    /// An object with this id already exists.
    #[error("object already exists: {0}")]
    ObjectExists(String),

    /// A write tried to change an object's immutable id field.
    #[error("object id is immutable: {0}")]
    ImmutableId(String),

    /// A referenced conversation does not exist.
    #[error("conversation not found: {0}")]
    ConversationNotFound(String),

    /// A conversation with this id already exists.
    #[error("conversation already exists: {0}")]
    ConversationExists(String),

    /// A relation name failed validation.
    #[error("invalid relation name: {0}")]
    InvalidRelation(String),

    /// An incoming patch skipped versions; the caller must resync.
    #[error("version gap: local={local}, incoming={incoming}")]
    VersionGap {
        /// The version held locally.
        local: u64,
        /// The version the patch carried.
        incoming: u64,
    },

    /// A patch could not be applied structurally.
    #[error("patch apply failed: {0}")]
    PatchApply(String),

    /// A snapshot or export could not be interpreted.
    #[error("invalid state document: {0}")]
    InvalidState(String),

    /// An import collided with existing content.
    #[error("import failed: {0}")]
    Import(String),

    /// A protocol-layer failure while addressing values.
    #[error("protocol error: {0}")]
    Protocol(#[from] tether_proto::ProtoError),
}

impl CoreError {
    /// Creates an invalid-object-id error.
    pub fn invalid_object_id(message: impl Into<String>) -> Self {
        Self::InvalidObjectId(message.into())
    }

    /// Creates an object-not-found error.
    pub fn object_not_found(id: impl Into<String>) -> Self {
        Self::ObjectNotFound(id.into())
    }

    /// Creates a patch-apply error.
    pub fn patch_apply(message: impl Into<String>) -> Self {
        Self::PatchApply(message.into())
    }

    /// Creates an invalid-state error.
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState(message.into())
    }
}
