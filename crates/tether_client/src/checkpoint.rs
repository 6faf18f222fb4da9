//! Checkpoint and undo pass-through.

use crate::api::{CheckpointStatus, SpaceApi};
use crate::auth::AuthSession;
use crate::error::ClientResult;
use std::sync::Arc;
use tether_core::SpaceId;

/// Drives the server-side checkpoint history of one space.
///
/// The history lives entirely on the server. Undo and redo answer with
/// no content; the resulting state change arrives through the event
/// stream, either as patches or as a wholesale `space_changed`. The
/// controller only fronts the calls with authentication.
pub struct CheckpointController<A: SpaceApi> {
    api: Arc<A>,
    auth: Arc<AuthSession>,
    space_id: SpaceId,
}

impl<A: SpaceApi> CheckpointController<A> {
    /// Creates a controller for one space.
    pub fn new(api: Arc<A>, auth: Arc<AuthSession>, space_id: SpaceId) -> Self {
        Self {
            api,
            auth,
            space_id,
        }
    }

    /// The space this controller drives.
    #[must_use]
    pub fn space_id(&self) -> &SpaceId {
        &self.space_id
    }

    /// Records a checkpoint, optionally labelled.
    pub fn checkpoint(&self, label: Option<&str>) -> ClientResult<()> {
        let token = self.auth.token()?;
        self.api.checkpoint(&token, &self.space_id, label)
    }

    /// Reverts the space to the previous checkpoint.
    pub fn undo(&self) -> ClientResult<()> {
        let token = self.auth.token()?;
        self.api.undo(&token, &self.space_id)
    }

    /// Re-applies the next checkpoint.
    pub fn redo(&self) -> ClientResult<()> {
        let token = self.auth.token()?;
        self.api.redo(&token, &self.space_id)
    }

    /// Reports whether undo and redo are currently possible.
    pub fn status(&self) -> ClientResult<CheckpointStatus> {
        let token = self.auth.token()?;
        self.api.checkpoint_status(&token, &self.space_id)
    }

    /// Drops the whole history.
    pub fn clear(&self) -> ClientResult<()> {
        let token = self.auth.token()?;
        self.api.clear_history(&token, &self.space_id)
    }
}
