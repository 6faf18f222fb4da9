//! Remote space API abstraction.

use crate::error::{ClientError, ClientResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tether_core::{
    AuditStamp, Conversation, ConversationId, Interaction, ObjectEntry, ObjectId, SpaceId,
    SpaceState,
};

/// Server-reported checkpoint availability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointStatus {
    /// Whether an undo target exists.
    pub can_undo: bool,
    /// Whether a redo target exists.
    pub can_redo: bool,
}

/// The remote operations a space client issues.
///
/// This trait abstracts the request layer, allowing for different
/// implementations (HTTP, mock for testing, in-memory reference server).
/// Every call carries a bearer token obtained from the auth session.
///
/// Mutation calls carry the client-stamped values verbatim; the server
/// mirrors them into the broadcast patch, which is what lets the engine
/// recognize its own writes coming back.
pub trait SpaceApi: Send + Sync {
    /// Fetches the authoritative state of a space.
    fn fetch_space(&self, token: &str, space: &SpaceId) -> ClientResult<SpaceState>;

    /// Creates an object with the given entry.
    fn create_object(
        &self,
        token: &str,
        space: &SpaceId,
        id: &ObjectId,
        entry: &ObjectEntry,
    ) -> ClientResult<()>;

    /// Merges fields into an object's data.
    fn update_object(
        &self,
        token: &str,
        space: &SpaceId,
        id: &ObjectId,
        fields: &Map<String, Value>,
        stamp: &AuditStamp,
    ) -> ClientResult<()>;

    /// Deletes objects by id.
    fn delete_objects(&self, token: &str, space: &SpaceId, ids: &[ObjectId]) -> ClientResult<()>;

    /// Adds a relation edge.
    fn link(
        &self,
        token: &str,
        space: &SpaceId,
        from: &ObjectId,
        relation: &str,
        to: &ObjectId,
        stamp: &AuditStamp,
    ) -> ClientResult<()>;

    /// Removes a relation edge.
    fn unlink(
        &self,
        token: &str,
        space: &SpaceId,
        from: &ObjectId,
        relation: &str,
        to: &ObjectId,
        stamp: &AuditStamp,
    ) -> ClientResult<()>;

    /// Sets a space metadata value.
    fn set_metadata(
        &self,
        token: &str,
        space: &SpaceId,
        key: &str,
        value: &Value,
    ) -> ClientResult<()>;

    /// Creates a conversation.
    fn create_conversation(
        &self,
        token: &str,
        space: &SpaceId,
        id: &ConversationId,
        conversation: &Conversation,
    ) -> ClientResult<()>;

    /// Renames a conversation.
    fn rename_conversation(
        &self,
        token: &str,
        space: &SpaceId,
        id: &ConversationId,
        name: &str,
    ) -> ClientResult<()>;

    /// Deletes a conversation.
    fn delete_conversation(
        &self,
        token: &str,
        space: &SpaceId,
        id: &ConversationId,
    ) -> ClientResult<()>;

    /// Appends an interaction to a conversation.
    fn append_interaction(
        &self,
        token: &str,
        space: &SpaceId,
        id: &ConversationId,
        interaction: &Interaction,
    ) -> ClientResult<()>;

    /// Sets or clears a conversation's system instruction.
    fn set_system_instruction(
        &self,
        token: &str,
        space: &SpaceId,
        id: &ConversationId,
        instruction: Option<&str>,
    ) -> ClientResult<()>;

    /// Records a checkpoint.
    fn checkpoint(&self, token: &str, space: &SpaceId, label: Option<&str>) -> ClientResult<()>;

    /// Reverts to the previous checkpoint. Content changes arrive through
    /// the patch stream, never through this response.
    fn undo(&self, token: &str, space: &SpaceId) -> ClientResult<()>;

    /// Re-applies the next checkpoint.
    fn redo(&self, token: &str, space: &SpaceId) -> ClientResult<()>;

    /// Reports checkpoint availability.
    fn checkpoint_status(&self, token: &str, space: &SpaceId) -> ClientResult<CheckpointStatus>;

    /// Drops the checkpoint history.
    fn clear_history(&self, token: &str, space: &SpaceId) -> ClientResult<()>;
}

/// A mock API for testing.
#[derive(Default)]
pub struct MockSpaceApi {
    state: parking_lot::Mutex<SpaceState>,
    status: parking_lot::Mutex<CheckpointStatus>,
    calls: parking_lot::Mutex<Vec<String>>,
    fail_next: parking_lot::Mutex<Option<ClientError>>,
}

impl MockSpaceApi {
    /// Creates a mock with an empty space.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the state returned by `fetch_space`.
    pub fn set_state(&self, state: SpaceState) {
        *self.state.lock() = state;
    }

    /// Sets the checkpoint status.
    pub fn set_status(&self, status: CheckpointStatus) {
        *self.status.lock() = status;
    }

    /// Makes the next call fail with `error`.
    pub fn fail_next(&self, error: ClientError) {
        *self.fail_next.lock() = Some(error);
    }

    /// Method names of all calls made so far.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn record(&self, method: &str) -> ClientResult<()> {
        self.calls.lock().push(method.to_string());
        match self.fail_next.lock().take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

impl SpaceApi for MockSpaceApi {
    fn fetch_space(&self, _token: &str, _space: &SpaceId) -> ClientResult<SpaceState> {
        self.record("fetch_space")?;
        Ok(self.state.lock().clone())
    }

    fn create_object(
        &self,
        _token: &str,
        _space: &SpaceId,
        _id: &ObjectId,
        _entry: &ObjectEntry,
    ) -> ClientResult<()> {
        self.record("create_object")
    }

    fn update_object(
        &self,
        _token: &str,
        _space: &SpaceId,
        _id: &ObjectId,
        _fields: &Map<String, Value>,
        _stamp: &AuditStamp,
    ) -> ClientResult<()> {
        self.record("update_object")
    }

    fn delete_objects(
        &self,
        _token: &str,
        _space: &SpaceId,
        _ids: &[ObjectId],
    ) -> ClientResult<()> {
        self.record("delete_objects")
    }

    fn link(
        &self,
        _token: &str,
        _space: &SpaceId,
        _from: &ObjectId,
        _relation: &str,
        _to: &ObjectId,
        _stamp: &AuditStamp,
    ) -> ClientResult<()> {
        self.record("link")
    }

    fn unlink(
        &self,
        _token: &str,
        _space: &SpaceId,
        _from: &ObjectId,
        _relation: &str,
        _to: &ObjectId,
        _stamp: &AuditStamp,
    ) -> ClientResult<()> {
        self.record("unlink")
    }

    fn set_metadata(
        &self,
        _token: &str,
        _space: &SpaceId,
        _key: &str,
        _value: &Value,
    ) -> ClientResult<()> {
        self.record("set_metadata")
    }

    fn create_conversation(
        &self,
        _token: &str,
        _space: &SpaceId,
        _id: &ConversationId,
        _conversation: &Conversation,
    ) -> ClientResult<()> {
        self.record("create_conversation")
    }

    fn rename_conversation(
        &self,
        _token: &str,
        _space: &SpaceId,
        _id: &ConversationId,
        _name: &str,
    ) -> ClientResult<()> {
        self.record("rename_conversation")
    }

    fn delete_conversation(
        &self,
        _token: &str,
        _space: &SpaceId,
        _id: &ConversationId,
    ) -> ClientResult<()> {
        self.record("delete_conversation")
    }

    fn append_interaction(
        &self,
        _token: &str,
        _space: &SpaceId,
        _id: &ConversationId,
        _interaction: &Interaction,
    ) -> ClientResult<()> {
        self.record("append_interaction")
    }

    fn set_system_instruction(
        &self,
        _token: &str,
        _space: &SpaceId,
        _id: &ConversationId,
        _instruction: Option<&str>,
    ) -> ClientResult<()> {
        self.record("set_system_instruction")
    }

    fn checkpoint(&self, _token: &str, _space: &SpaceId, _label: Option<&str>) -> ClientResult<()> {
        self.record("checkpoint")
    }

    fn undo(&self, _token: &str, _space: &SpaceId) -> ClientResult<()> {
        self.record("undo")
    }

    fn redo(&self, _token: &str, _space: &SpaceId) -> ClientResult<()> {
        self.record("redo")
    }

    fn checkpoint_status(&self, _token: &str, _space: &SpaceId) -> ClientResult<CheckpointStatus> {
        self.record("checkpoint_status")?;
        Ok(*self.status.lock())
    }

    fn clear_history(&self, _token: &str, _space: &SpaceId) -> ClientResult<()> {
        self.record("clear_history")
    }
}
