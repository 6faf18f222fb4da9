//! Optimistic synchronization engine for one space.
//!
//! The engine keeps a local [`SpaceState`] mirror and runs every local
//! operation through the same protocol: validate, mutate the mirror,
//! notify subscribers, then send the operation to the server. The server
//! answers every write with a patch on the event stream; because the
//! mirror already holds the result, that patch arrives as a pure echo and
//! is suppressed. Patches from other clients apply normally; a version
//! gap or an unapplicable patch triggers a full resync.
//!
//! Locks are never held across an API call. Remote patches follow a
//! clone-compute-swap scheme: the successor state is computed from the
//! current one, then swapped in whole.

use crate::api::SpaceApi;
use crate::auth::AuthSession;
use crate::checkpoint::CheckpointController;
use crate::config::ClientIdentity;
use crate::error::{ClientError, ClientResult};
use crate::hub::NotificationHub;
use parking_lot::{Condvar, Mutex, RwLock};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use tether_core::{
    apply_patch, ApplyOutcome, AuditStamp, Conversation, ConversationId, CoreError, Interaction,
    Notification, ObjectEntry, ObjectId, SpaceExport, SpaceId, SpaceState, Version,
};
use tether_proto::{ChangeSource, Patch, StreamEvent};

/// Counters describing one engine's sync history.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Server patches applied, echoes included.
    pub patches_applied: u64,
    /// Patches that advanced the version without changing content.
    pub echoes_suppressed: u64,
    /// Stale patches dropped without effect.
    pub patches_dropped: u64,
    /// Version gaps detected.
    pub version_gaps: u64,
    /// Full refetches completed.
    pub resyncs: u64,
    /// Operations acknowledged by the server.
    pub operations_sent: u64,
    /// Most recent failure, cleared by a successful resync.
    pub last_error: Option<String>,
}

/// Single-flight gate for resyncs. Callers arriving while a pass is in
/// flight wait for it and share its outcome instead of stacking fetches.
#[derive(Default)]
struct ResyncGate {
    in_flight: bool,
    epoch: u64,
    last: Option<(u64, Result<(), ClientError>)>,
}

/// What a remote patch asked of us, decided under the state lock and
/// acted on after it is released.
enum RemoteAction {
    Dropped { incoming: u64 },
    Silent,
    Notify(Vec<Notification>),
    Gap { local: Version, incoming: u64 },
    Broken(String),
}

/// Synchronizes one space against the server.
pub struct SpaceSyncEngine<A: SpaceApi> {
    space_id: SpaceId,
    api: Arc<A>,
    auth: Arc<AuthSession>,
    identity: ClientIdentity,
    state: RwLock<SpaceState>,
    hub: Arc<NotificationHub>,
    stats: RwLock<SyncStats>,
    resync_gate: Mutex<ResyncGate>,
    resync_done: Condvar,
    active_conversation: Mutex<Option<ConversationId>>,
}

impl<A: SpaceApi> SpaceSyncEngine<A> {
    /// Fetches the space and builds an engine around it.
    pub fn open(
        api: Arc<A>,
        auth: Arc<AuthSession>,
        identity: ClientIdentity,
        space_id: SpaceId,
    ) -> ClientResult<Arc<Self>> {
        let token = auth.token()?;
        let state = api.fetch_space(&token, &space_id)?;
        tracing::info!(
            space = %space_id,
            version = %state.version,
            objects = state.object_count(),
            "space opened"
        );
        Ok(Arc::new(Self {
            space_id,
            api,
            auth,
            identity,
            state: RwLock::new(state),
            hub: Arc::new(NotificationHub::new()),
            stats: RwLock::new(SyncStats::default()),
            resync_gate: Mutex::new(ResyncGate::default()),
            resync_done: Condvar::new(),
            active_conversation: Mutex::new(None),
        }))
    }

    /// The space this engine serves.
    #[must_use]
    pub fn space_id(&self) -> &SpaceId {
        &self.space_id
    }

    /// The notification hub for this space.
    #[must_use]
    pub fn hub(&self) -> &Arc<NotificationHub> {
        &self.hub
    }

    /// Who this engine writes as.
    #[must_use]
    pub fn identity(&self) -> &ClientIdentity {
        &self.identity
    }

    /// The space's display name, when the server keeps one in `meta`.
    #[must_use]
    pub fn name(&self) -> Option<String> {
        self.meta("name")
            .and_then(|v| v.as_str().map(str::to_string))
    }

    /// Clones the full local state.
    #[must_use]
    pub fn snapshot(&self) -> SpaceState {
        self.state.read().clone()
    }

    /// Current confirmed version.
    #[must_use]
    pub fn version(&self) -> Version {
        self.state.read().version
    }

    /// Looks up one object.
    #[must_use]
    pub fn object(&self, id: &ObjectId) -> Option<ObjectEntry> {
        self.state.read().object(id).cloned()
    }

    /// True if the object exists locally.
    #[must_use]
    pub fn contains_object(&self, id: &ObjectId) -> bool {
        self.state.read().contains_object(id)
    }

    /// All object ids.
    #[must_use]
    pub fn object_ids(&self) -> Vec<ObjectId> {
        self.state.read().objects.keys().cloned().collect()
    }

    /// Live targets of one relation, dangling references filtered out.
    #[must_use]
    pub fn links_of(&self, id: &ObjectId, relation: &str) -> Vec<ObjectId> {
        self.state.read().links_of(id, relation)
    }

    /// Reads one metadata value.
    #[must_use]
    pub fn meta(&self, key: &str) -> Option<Value> {
        self.state.read().meta_value(key).cloned()
    }

    /// Looks up one conversation.
    #[must_use]
    pub fn conversation(&self, id: &ConversationId) -> Option<Conversation> {
        self.state.read().conversation(id).cloned()
    }

    /// All conversation ids.
    #[must_use]
    pub fn conversation_ids(&self) -> Vec<ConversationId> {
        self.state.read().conversations.keys().cloned().collect()
    }

    /// The conversation new interactions go to by default.
    #[must_use]
    pub fn active_conversation(&self) -> Option<ConversationId> {
        self.active_conversation.lock().clone()
    }

    /// Counters snapshot.
    #[must_use]
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    /// A controller for this space's server-side checkpoint history.
    #[must_use]
    pub fn checkpoints(&self) -> CheckpointController<A> {
        CheckpointController::new(self.api.clone(), self.auth.clone(), self.space_id.clone())
    }

    // Local operations

    /// Creates an object. The id comes from `data["id"]` when present,
    /// otherwise one is generated. Returns the entry as the mirror holds
    /// it after the operation.
    pub fn create_object(&self, mut data: Map<String, Value>) -> ClientResult<ObjectEntry> {
        let id = match data.get("id") {
            Some(Value::String(raw)) => ObjectId::parse(raw.clone())?,
            Some(_) => {
                return Err(CoreError::invalid_object_id("id field must be a string").into())
            }
            None => {
                let id = ObjectId::generate();
                data.insert("id".to_string(), Value::String(id.to_string()));
                id
            }
        };
        let mut entry = ObjectEntry::new(data);
        entry.stamp(&self.stamp());
        self.state.write().insert_object(id.clone(), entry.clone())?;
        self.hub.emit(&Notification::ObjectCreated {
            id: id.clone(),
            source: ChangeSource::LocalUser,
        });
        self.send("create_object", |token| {
            self.api.create_object(token, &self.space_id, &id, &entry)
        })?;
        Ok(self.object(&id).unwrap_or(entry))
    }

    /// Merges fields into an object's data. Returns the entry as the
    /// mirror holds it afterwards, `None` if it has since disappeared.
    pub fn update_object(
        &self,
        id: &ObjectId,
        fields: Map<String, Value>,
    ) -> ClientResult<Option<ObjectEntry>> {
        let stamp = self.stamp();
        self.state.write().update_object_fields(id, &fields, &stamp)?;
        self.hub.emit(&Notification::ObjectUpdated {
            id: id.clone(),
            source: ChangeSource::LocalUser,
        });
        self.send("update_object", |token| {
            self.api
                .update_object(token, &self.space_id, id, &fields, &stamp)
        })?;
        Ok(self.object(id))
    }

    /// Deletes objects by id. Missing ids are skipped; when nothing
    /// exists, no request is made.
    pub fn delete_objects(&self, ids: &[ObjectId]) -> ClientResult<()> {
        let mut notifications = Vec::new();
        {
            let mut state = self.state.write();
            let mut seen = BTreeSet::new();
            for id in ids {
                if !seen.insert(id.clone()) || !state.contains_object(id) {
                    continue;
                }
                // Outbound unlinks against the pre-removal state, matching
                // what a server patch for this delete would produce.
                if let Some(entry) = state.object(id) {
                    for (relation, targets) in &entry.links {
                        for to in targets {
                            if state.contains_object(to) {
                                notifications.push(Notification::Unlinked {
                                    from: id.clone(),
                                    relation: relation.clone(),
                                    to: to.clone(),
                                    source: ChangeSource::LocalUser,
                                });
                            }
                        }
                    }
                }
                notifications.push(Notification::ObjectDeleted {
                    id: id.clone(),
                    source: ChangeSource::LocalUser,
                });
            }
            let removed = state.remove_objects(ids);
            if removed.is_empty() {
                return Ok(());
            }
        }
        self.hub.emit_all(&notifications);
        self.send("delete_objects", |token| {
            self.api.delete_objects(token, &self.space_id, ids)
        })
    }

    /// Adds a relation edge. Linking an already-linked pair is a no-op
    /// that makes no request. Returns the relation's live targets.
    pub fn link(
        &self,
        from: &ObjectId,
        relation: &str,
        to: &ObjectId,
    ) -> ClientResult<Vec<ObjectId>> {
        let stamp = self.stamp();
        let changed = self.state.write().link(from, relation, to, &stamp)?;
        if changed {
            self.hub.emit(&Notification::Linked {
                from: from.clone(),
                relation: relation.to_string(),
                to: to.clone(),
                source: ChangeSource::LocalUser,
            });
            self.send("link", |token| {
                self.api
                    .link(token, &self.space_id, from, relation, to, &stamp)
            })?;
        }
        Ok(self.links_of(from, relation))
    }

    /// Removes a relation edge. Unlinking an absent pair is a no-op that
    /// makes no request. Returns the relation's remaining live targets.
    pub fn unlink(
        &self,
        from: &ObjectId,
        relation: &str,
        to: &ObjectId,
    ) -> ClientResult<Vec<ObjectId>> {
        let stamp = self.stamp();
        let changed = self.state.write().unlink(from, relation, to, &stamp)?;
        if changed {
            self.hub.emit(&Notification::Unlinked {
                from: from.clone(),
                relation: relation.to_string(),
                to: to.clone(),
                source: ChangeSource::LocalUser,
            });
            self.send("unlink", |token| {
                self.api
                    .unlink(token, &self.space_id, from, relation, to, &stamp)
            })?;
        }
        Ok(self.links_of(from, relation))
    }

    /// Sets one metadata value.
    pub fn set_metadata(&self, key: &str, value: Value) -> ClientResult<()> {
        self.state.write().set_meta(key, value.clone());
        self.hub.emit(&Notification::MetaChanged {
            key: key.to_string(),
            source: ChangeSource::LocalUser,
        });
        self.send("set_metadata", |token| {
            self.api.set_metadata(token, &self.space_id, key, &value)
        })
    }

    /// Creates a conversation and makes it the active one.
    pub fn create_conversation(&self, name: Option<&str>) -> ClientResult<ConversationId> {
        let id = ConversationId::generate();
        let created_by = self
            .identity
            .user_id
            .clone()
            .unwrap_or_else(|| "anonymous".to_string());
        let mut conversation = Conversation::new(created_by);
        if let Some(name) = name {
            conversation = conversation.with_name(name);
        }
        self.state
            .write()
            .create_conversation(id.clone(), conversation.clone())?;
        *self.active_conversation.lock() = Some(id.clone());
        self.hub.emit(&Notification::ConversationListChanged {
            source: ChangeSource::LocalUser,
        });
        self.send("create_conversation", |token| {
            self.api
                .create_conversation(token, &self.space_id, &id, &conversation)
        })?;
        Ok(id)
    }

    /// Renames a conversation.
    pub fn rename_conversation(&self, id: &ConversationId, name: &str) -> ClientResult<()> {
        self.state.write().rename_conversation(id, name)?;
        self.hub.emit(&Notification::ConversationListChanged {
            source: ChangeSource::LocalUser,
        });
        self.send("rename_conversation", |token| {
            self.api
                .rename_conversation(token, &self.space_id, id, name)
        })
    }

    /// Deletes a conversation. Clears the active conversation if it was
    /// the one deleted.
    pub fn delete_conversation(&self, id: &ConversationId) -> ClientResult<()> {
        self.state.write().delete_conversation(id)?;
        {
            let mut active = self.active_conversation.lock();
            if active.as_ref() == Some(id) {
                *active = None;
            }
        }
        self.hub.emit(&Notification::ConversationListChanged {
            source: ChangeSource::LocalUser,
        });
        self.send("delete_conversation", |token| {
            self.api.delete_conversation(token, &self.space_id, id)
        })
    }

    /// Selects the conversation new interactions go to. `None` clears
    /// the selection.
    pub fn set_active_conversation(&self, id: Option<ConversationId>) -> ClientResult<()> {
        if let Some(id) = &id {
            if self.state.read().conversation(id).is_none() {
                return Err(CoreError::ConversationNotFound(id.to_string()).into());
            }
        }
        *self.active_conversation.lock() = id;
        Ok(())
    }

    /// Appends an interaction to a conversation.
    pub fn append_interaction(
        &self,
        id: &ConversationId,
        interaction: Interaction,
    ) -> ClientResult<()> {
        self.state
            .write()
            .append_interaction(id, interaction.clone())?;
        self.hub.emit(&Notification::ConversationChanged {
            id: id.clone(),
            source: ChangeSource::LocalUser,
        });
        self.send("append_interaction", |token| {
            self.api
                .append_interaction(token, &self.space_id, id, &interaction)
        })
    }

    /// Appends to the active conversation, creating one when none is
    /// selected. Returns the conversation written to.
    pub fn record_interaction(&self, interaction: Interaction) -> ClientResult<ConversationId> {
        let id = match self.active_conversation() {
            Some(id) => id,
            None => self.create_conversation(None)?,
        };
        self.append_interaction(&id, interaction)?;
        Ok(id)
    }

    /// Sets or clears a conversation's system instruction.
    pub fn set_system_instruction(
        &self,
        id: &ConversationId,
        instruction: Option<&str>,
    ) -> ClientResult<()> {
        self.state
            .write()
            .set_system_instruction(id, instruction.map(str::to_string))?;
        self.hub.emit(&Notification::ConversationChanged {
            id: id.clone(),
            source: ChangeSource::LocalUser,
        });
        self.send("set_system_instruction", |token| {
            self.api
                .set_system_instruction(token, &self.space_id, id, instruction)
        })
    }

    /// Dumps the space's objects and live links.
    #[must_use]
    pub fn export(&self) -> SpaceExport {
        self.state.read().export()
    }

    /// Imports previously exported objects, links included. Fails
    /// without touching anything when any imported id already exists.
    /// The objects are replayed to the server one create at a time; a
    /// mid-stream failure resyncs and re-raises, leaving the rest
    /// unsent. Returns the number of objects imported.
    pub fn import(&self, export: SpaceExport) -> ClientResult<usize> {
        let count = export.objects.len();
        self.state.write().import(export.clone())?;
        for id in export.objects.keys() {
            self.hub.emit(&Notification::ObjectCreated {
                id: id.clone(),
                source: ChangeSource::LocalUser,
            });
        }
        for (id, entry) in &export.objects {
            self.send("create_object", |token| {
                self.api.create_object(token, &self.space_id, id, entry)
            })?;
        }
        Ok(count)
    }

    // Remote reconciliation

    /// Reconciles one server patch into the mirror.
    pub fn apply_remote(&self, patch: &Patch, source: ChangeSource) {
        let action = {
            let mut state = self.state.write();
            match apply_patch(&state, patch, source) {
                Ok(ApplyOutcome::AlreadyApplied { incoming }) => {
                    RemoteAction::Dropped { incoming }
                }
                Ok(ApplyOutcome::Gap { local, incoming }) => RemoteAction::Gap { local, incoming },
                Ok(ApplyOutcome::Applied {
                    state: next,
                    changed,
                    notifications,
                }) => {
                    *state = next;
                    if changed {
                        RemoteAction::Notify(notifications)
                    } else {
                        RemoteAction::Silent
                    }
                }
                Err(e) => RemoteAction::Broken(e.to_string()),
            }
        };
        match action {
            RemoteAction::Dropped { incoming } => {
                tracing::debug!(space = %self.space_id, incoming, "dropped stale patch");
                self.stats.write().patches_dropped += 1;
            }
            RemoteAction::Silent => {
                tracing::trace!(space = %self.space_id, "suppressed echo patch");
                let mut stats = self.stats.write();
                stats.patches_applied += 1;
                stats.echoes_suppressed += 1;
            }
            RemoteAction::Notify(notifications) => {
                self.stats.write().patches_applied += 1;
                self.hub.emit_all(&notifications);
            }
            RemoteAction::Gap { local, incoming } => {
                tracing::warn!(
                    space = %self.space_id,
                    local = %local,
                    incoming,
                    "version gap, resyncing"
                );
                self.stats.write().version_gaps += 1;
                let _ = self
                    .resync_for(&format!("version gap: local {local}, incoming {incoming}"));
            }
            RemoteAction::Broken(message) => {
                tracing::warn!(
                    space = %self.space_id,
                    error = %message,
                    "unapplicable patch, resyncing"
                );
                self.stats.write().last_error = Some(message.clone());
                let _ = self.resync_for(&message);
            }
        }
    }

    /// Routes one stream event.
    pub fn handle_event(&self, event: &StreamEvent) {
        match event {
            StreamEvent::Connected { server_version, .. } => {
                if let Some(remote) = server_version {
                    let local = self.version().as_u64();
                    if *remote != local {
                        tracing::info!(
                            space = %self.space_id,
                            local,
                            remote,
                            "version mismatch on connect"
                        );
                        let _ = self.resync_for("version mismatch on connect");
                    }
                }
            }
            StreamEvent::SpacePatched { patch, source, .. } => {
                self.apply_remote(patch, ChangeSource::from_wire(*source));
            }
            StreamEvent::SpaceChanged { .. } => {
                // Wholesale change (undo, redo, restore); the patch
                // stream cannot describe it.
                let _ = self.resync_for("space changed on server");
            }
            StreamEvent::Unknown { event_type } => {
                tracing::warn!(space = %self.space_id, event_type, "ignoring unknown event");
            }
            other => {
                tracing::debug!(
                    space = %self.space_id,
                    event = other.type_name(),
                    "ignoring out-of-scope event"
                );
            }
        }
    }

    /// Drives the engine from a stream receiver on a dedicated thread.
    /// The thread ends when the sender side hangs up.
    pub fn spawn_event_pump(
        engine: Arc<Self>,
        events: mpsc::Receiver<StreamEvent>,
    ) -> JoinHandle<()>
    where
        A: 'static,
    {
        std::thread::spawn(move || {
            while let Ok(event) = events.recv() {
                engine.handle_event(&event);
            }
            tracing::debug!(space = %engine.space_id, "event pump stopped");
        })
    }

    /// Refetches the space and replaces the mirror. Concurrent callers
    /// share a single fetch.
    pub fn resync(&self) -> ClientResult<()> {
        self.resync_for("resync requested")
    }

    /// Resync carrying the trigger's cause. Every caller reports its own
    /// cause as a sync-error notification, even when the fetches coalesce.
    fn resync_for(&self, cause: &str) -> ClientResult<()> {
        self.hub.emit(&Notification::SyncError {
            message: cause.to_string(),
        });
        let awaited = {
            let mut gate = self.resync_gate.lock();
            if gate.in_flight {
                let awaited = gate.epoch;
                while gate.in_flight && gate.epoch == awaited {
                    self.resync_done.wait(&mut gate);
                }
                if let Some((epoch, outcome)) = &gate.last {
                    if *epoch > awaited {
                        return outcome.clone();
                    }
                }
                return Ok(());
            }
            gate.in_flight = true;
            gate.epoch
        };
        let outcome = self.do_resync();
        {
            let mut gate = self.resync_gate.lock();
            gate.epoch = awaited + 1;
            gate.last = Some((gate.epoch, outcome.clone()));
            gate.in_flight = false;
        }
        self.resync_done.notify_all();
        outcome
    }

    fn do_resync(&self) -> ClientResult<()> {
        tracing::info!(space = %self.space_id, "resyncing");
        let fetched = self.auth.token().and_then(|token| {
            let fresh = self.api.fetch_space(&token, &self.space_id)?;
            Ok((token, fresh))
        });
        match fetched {
            Ok((token, fresh)) => {
                let version = fresh.version;
                *self.state.write() = fresh;
                {
                    let mut stats = self.stats.write();
                    stats.resyncs += 1;
                    stats.last_error = None;
                }
                // Undo history predates the reload and no longer lines up
                // with what subscribers saw.
                if let Err(e) = self.api.clear_history(&token, &self.space_id) {
                    tracing::debug!(
                        space = %self.space_id,
                        error = %e,
                        "clear_history after resync failed"
                    );
                }
                tracing::info!(space = %self.space_id, version = %version, "resync complete");
                self.hub.emit(&Notification::FullReset {
                    source: ChangeSource::System,
                });
                Ok(())
            }
            Err(e) => {
                tracing::warn!(space = %self.space_id, error = %e, "resync failed");
                self.stats.write().last_error = Some(e.to_string());
                self.hub.emit(&Notification::SyncError {
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    fn stamp(&self) -> AuditStamp {
        AuditStamp::now(self.identity.user_id.clone(), self.identity.user_name.clone())
    }

    /// Sends one already-applied operation. Failure means the mirror may
    /// diverge from the server, so it resyncs before re-raising.
    fn send<F>(&self, op: &'static str, call: F) -> ClientResult<()>
    where
        F: FnOnce(&str) -> ClientResult<()>,
    {
        match self.auth.token().and_then(|token| call(&token)) {
            Ok(()) => {
                self.stats.write().operations_sent += 1;
                Ok(())
            }
            Err(e) => {
                tracing::warn!(
                    space = %self.space_id,
                    op,
                    error = %e,
                    "operation failed, resyncing"
                );
                self.stats.write().last_error = Some(e.to_string());
                let _ = self.resync_for(&format!("{op} failed: {e}"));
                Err(e)
            }
        }
    }
}
