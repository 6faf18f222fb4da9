//! An in-memory server standing in for the real backend.
//!
//! [`InMemorySpaceServer`] implements both [`SpaceApi`] and
//! [`StreamConnector`]: it holds the authoritative state of every space,
//! answers API calls by mutating that state, and broadcasts each
//! mutation as a patch to the space's stream subscribers, exactly the
//! way clients expect to reconcile it. Failure injection hooks cover
//! request errors, connect errors, and artificial latency.

use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use sha2::Sha256;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;
use tether_client::{
    CheckpointStatus, ClientError, ClientResult, CredentialProvider, Credentials, EventSource,
    SpaceApi, StreamConnector, StreamScope,
};
use tether_core::{
    now_millis, AuditStamp, Conversation, ConversationId, Interaction, ObjectEntry, ObjectId,
    SpaceId, SpaceState,
};
use tether_proto::{Patch, PatchOp, Pointer, StreamEvent, WireSource, VERSION_POINTER};

type HmacSha256 = Hmac<Sha256>;

/// Signs and verifies bearer tokens of the form `user_id.signature`.
#[derive(Clone)]
pub struct TokenMint {
    secret: Vec<u8>,
}

impl TokenMint {
    /// Creates a mint with the given signing secret.
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
        }
    }

    /// Issues a token for a user.
    #[must_use]
    pub fn issue(&self, user_id: &str) -> String {
        format!("{user_id}.{}", self.sign(user_id))
    }

    /// Verifies a token, returning the user it names.
    #[must_use]
    pub fn verify(&self, token: &str) -> Option<String> {
        let (user_id, signature) = token.rsplit_once('.')?;
        (self.sign(user_id) == signature).then(|| user_id.to_string())
    }

    fn sign(&self, user_id: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("hmac accepts any key length");
        mac.update(user_id.as_bytes());
        let digest = mac.finalize().into_bytes();
        let mut hex = String::with_capacity(digest.len() * 2);
        for byte in digest {
            let _ = write!(hex, "{byte:02x}");
        }
        hex
    }
}

/// One retained checkpoint.
struct Snapshot {
    label: Option<String>,
    state: SpaceState,
}

#[derive(Default)]
struct SpaceRecord {
    state: SpaceState,
    history: Vec<Snapshot>,
    future: Vec<Snapshot>,
    subscribers: Vec<mpsc::Sender<StreamEvent>>,
}

impl SpaceRecord {
    fn broadcast(&mut self, event: &StreamEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

struct ServerInner {
    mint: TokenMint,
    spaces: Mutex<BTreeMap<SpaceId, SpaceRecord>>,
    user_storage: Mutex<BTreeMap<String, BTreeMap<String, Value>>>,
    global_subscribers: Mutex<Vec<mpsc::Sender<StreamEvent>>>,
    calls: Mutex<Vec<String>>,
    fail_requests: AtomicU32,
    fail_connects: AtomicU32,
    connect_attempts: AtomicU32,
    fetch_delay: Mutex<Duration>,
}

/// In-memory backend for tests. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct InMemorySpaceServer {
    inner: Arc<ServerInner>,
}

impl Default for InMemorySpaceServer {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemorySpaceServer {
    /// Creates a server with a fixed signing secret.
    pub fn new() -> Self {
        Self::with_secret("tether-testkit-secret")
    }

    /// Creates a server with a chosen signing secret.
    pub fn with_secret(secret: impl AsRef<[u8]>) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                mint: TokenMint::new(secret),
                spaces: Mutex::new(BTreeMap::new()),
                user_storage: Mutex::new(BTreeMap::new()),
                global_subscribers: Mutex::new(Vec::new()),
                calls: Mutex::new(Vec::new()),
                fail_requests: AtomicU32::new(0),
                fail_connects: AtomicU32::new(0),
                connect_attempts: AtomicU32::new(0),
                fetch_delay: Mutex::new(Duration::ZERO),
            }),
        }
    }

    /// Issues a valid token for a user.
    #[must_use]
    pub fn issue_token(&self, user_id: &str) -> String {
        self.inner.mint.issue(user_id)
    }

    /// A credential provider whose tokens this server accepts.
    #[must_use]
    pub fn provider(&self, user_id: &str) -> ServerBackedProvider {
        ServerBackedProvider::new(self.clone(), user_id)
    }

    /// Snapshot of a space's authoritative state. Creates the space if
    /// it does not exist yet.
    #[must_use]
    pub fn state_of(&self, space: &SpaceId) -> SpaceState {
        self.inner
            .spaces
            .lock()
            .entry(space.clone())
            .or_default()
            .state
            .clone()
    }

    /// Replaces a space's authoritative state without broadcasting.
    pub fn seed_space(&self, space: &SpaceId, state: SpaceState) {
        self.inner.spaces.lock().entry(space.clone()).or_default().state = state;
    }

    /// Method names of every API call so far.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.inner.calls.lock().clone()
    }

    /// Fails the next `n` API requests with a retryable transport error.
    pub fn fail_next_requests(&self, n: u32) {
        self.inner.fail_requests.store(n, Ordering::SeqCst);
    }

    /// Fails the next `n` stream connects.
    pub fn fail_next_connects(&self, n: u32) {
        self.inner.fail_connects.store(n, Ordering::SeqCst);
    }

    /// Number of stream connects attempted, failed ones included.
    #[must_use]
    pub fn connect_attempts(&self) -> u32 {
        self.inner.connect_attempts.load(Ordering::SeqCst)
    }

    /// Adds artificial latency to `fetch_space`.
    pub fn set_fetch_delay(&self, delay: Duration) {
        *self.inner.fetch_delay.lock() = delay;
    }

    /// Severs every stream subscribed to a space. Clients observe a
    /// clean end of stream and reconnect.
    pub fn disconnect_space(&self, space: &SpaceId) {
        if let Some(record) = self.inner.spaces.lock().get_mut(space) {
            record.subscribers.clear();
        }
    }

    /// Severs every global stream.
    pub fn disconnect_global(&self) {
        self.inner.global_subscribers.lock().clear();
    }

    /// Broadcasts a hand-built patch to a space's subscribers without
    /// touching the authoritative state. For gap and agent scenarios.
    pub fn broadcast_patch(&self, space: &SpaceId, patch: Patch, source: WireSource) {
        let event = StreamEvent::SpacePatched {
            patch,
            source,
            timestamp: now_millis(),
        };
        if let Some(record) = self.inner.spaces.lock().get_mut(space) {
            record.broadcast(&event);
        }
    }

    /// Broadcasts a wholesale-change marker for a space.
    pub fn broadcast_space_changed(&self, space: &SpaceId) {
        let event = StreamEvent::SpaceChanged {
            timestamp: now_millis(),
        };
        if let Some(record) = self.inner.spaces.lock().get_mut(space) {
            record.broadcast(&event);
        }
    }

    /// Broadcasts an event on the global stream.
    pub fn broadcast_global(&self, event: StreamEvent) {
        self.inner
            .global_subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Reads a user-storage value directly.
    #[must_use]
    pub fn storage_of(&self, user_id: &str, key: &str) -> Option<Value> {
        self.inner
            .user_storage
            .lock()
            .get(user_id)
            .and_then(|map| map.get(key).cloned())
    }

    fn write_storage(&self, user_id: &str, key: &str, value: Value) {
        self.inner
            .user_storage
            .lock()
            .entry(user_id.to_string())
            .or_default()
            .insert(key.to_string(), value);
        self.broadcast_global(StreamEvent::UserStorageChanged {
            timestamp: now_millis(),
        });
    }

    fn check(&self, method: &'static str, token: &str) -> ClientResult<()> {
        self.inner.calls.lock().push(method.to_string());
        let injected = self
            .inner
            .fail_requests
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(ClientError::transport_retryable("injected request failure"));
        }
        if self.inner.mint.verify(token).is_none() {
            return Err(ClientError::server("unauthorized"));
        }
        Ok(())
    }

    /// Runs one mutation: applies `build` to the record, bumps the
    /// version, and broadcasts the returned ops plus the version anchor.
    /// An empty op list means the mutation was a no-op.
    fn mutate(
        &self,
        method: &'static str,
        token: &str,
        space: &SpaceId,
        build: impl FnOnce(&mut SpaceRecord) -> ClientResult<Vec<PatchOp>>,
    ) -> ClientResult<()> {
        self.check(method, token)?;
        let mut spaces = self.inner.spaces.lock();
        let record = spaces.entry(space.clone()).or_default();
        let mut ops = build(record)?;
        if ops.is_empty() {
            return Ok(());
        }
        record.state.version = record.state.version.next();
        ops.push(PatchOp::replace(
            Pointer::parse(VERSION_POINTER).expect("version pointer parses"),
            record.state.version.as_u64(),
        ));
        let event = StreamEvent::SpacePatched {
            patch: Patch::new(ops),
            source: WireSource::User,
            timestamp: now_millis(),
        };
        record.broadcast(&event);
        Ok(())
    }
}

fn object_path(id: &ObjectId, tail: &[&str]) -> Pointer {
    let mut segments = vec!["objects".to_string(), id.to_string()];
    segments.extend(tail.iter().map(|s| (*s).to_string()));
    Pointer::from_segments(segments)
}

fn conversation_path(id: &ConversationId, tail: &[&str]) -> Pointer {
    let mut segments = vec!["conversations".to_string(), id.to_string()];
    segments.extend(tail.iter().map(|s| (*s).to_string()));
    Pointer::from_segments(segments)
}

/// Replace ops for the audit columns a mutation stamped.
fn stamp_ops(id: &ObjectId, stamp: &AuditStamp) -> Vec<PatchOp> {
    vec![
        PatchOp::replace(object_path(id, &["updatedAt"]), stamp.at),
        PatchOp::replace(object_path(id, &["updatedBy"]), stamp.by.clone()),
        PatchOp::replace(object_path(id, &["updatedByName"]), stamp.by_name.clone()),
    ]
}

/// Whole-table replaces describing a restored state. Used for undo and
/// redo, which clients reconcile like any other patch.
fn restore_ops(state: &SpaceState) -> Vec<PatchOp> {
    vec![
        PatchOp::replace(
            Pointer::from_segments(vec!["objects".to_string()]),
            serde_json::to_value(&state.objects).expect("objects serialize"),
        ),
        PatchOp::replace(
            Pointer::from_segments(vec!["meta".to_string()]),
            serde_json::to_value(&state.meta).expect("meta serializes"),
        ),
        PatchOp::replace(
            Pointer::from_segments(vec!["conversations".to_string()]),
            serde_json::to_value(&state.conversations).expect("conversations serialize"),
        ),
    ]
}

impl SpaceApi for InMemorySpaceServer {
    fn fetch_space(&self, token: &str, space: &SpaceId) -> ClientResult<SpaceState> {
        self.check("fetch_space", token)?;
        let delay = *self.inner.fetch_delay.lock();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        Ok(self
            .inner
            .spaces
            .lock()
            .entry(space.clone())
            .or_default()
            .state
            .clone())
    }

    fn create_object(
        &self,
        token: &str,
        space: &SpaceId,
        id: &ObjectId,
        entry: &ObjectEntry,
    ) -> ClientResult<()> {
        self.mutate("create_object", token, space, |record| {
            record.state.insert_object(id.clone(), entry.clone())?;
            let stored = record
                .state
                .object(id)
                .cloned()
                .unwrap_or_else(|| entry.clone());
            Ok(vec![PatchOp::add(
                object_path(id, &[]),
                serde_json::to_value(stored).expect("entry serializes"),
            )])
        })
    }

    fn update_object(
        &self,
        token: &str,
        space: &SpaceId,
        id: &ObjectId,
        fields: &Map<String, Value>,
        stamp: &AuditStamp,
    ) -> ClientResult<()> {
        self.mutate("update_object", token, space, |record| {
            record.state.update_object_fields(id, fields, stamp)?;
            let stored = record
                .state
                .object(id)
                .cloned()
                .expect("updated object exists");
            Ok(vec![PatchOp::replace(
                object_path(id, &[]),
                serde_json::to_value(stored).expect("entry serializes"),
            )])
        })
    }

    fn delete_objects(&self, token: &str, space: &SpaceId, ids: &[ObjectId]) -> ClientResult<()> {
        self.mutate("delete_objects", token, space, |record| {
            let removed = record.state.remove_objects(ids);
            Ok(removed
                .iter()
                .map(|(id, _)| PatchOp::remove(object_path(id, &[])))
                .collect())
        })
    }

    fn link(
        &self,
        token: &str,
        space: &SpaceId,
        from: &ObjectId,
        relation: &str,
        to: &ObjectId,
        stamp: &AuditStamp,
    ) -> ClientResult<()> {
        self.mutate("link", token, space, |record| {
            let had_relation = record
                .state
                .object(from)
                .is_some_and(|e| !e.raw_targets(relation).is_empty());
            if !record.state.link(from, relation, to, stamp)? {
                return Ok(Vec::new());
            }
            // Append to an existing array, or introduce the relation.
            let link_op = if had_relation {
                PatchOp::add(
                    object_path(from, &["links", relation, "-"]),
                    to.to_string(),
                )
            } else {
                PatchOp::add(
                    object_path(from, &["links", relation]),
                    serde_json::json!([to.to_string()]),
                )
            };
            let mut ops = vec![link_op];
            ops.extend(stamp_ops(from, stamp));
            Ok(ops)
        })
    }

    fn unlink(
        &self,
        token: &str,
        space: &SpaceId,
        from: &ObjectId,
        relation: &str,
        to: &ObjectId,
        stamp: &AuditStamp,
    ) -> ClientResult<()> {
        self.mutate("unlink", token, space, |record| {
            if !record.state.unlink(from, relation, to, stamp)? {
                return Ok(Vec::new());
            }
            let remaining = record
                .state
                .object(from)
                .map(|e| e.raw_targets(relation).to_vec())
                .unwrap_or_default();
            let link_op = if remaining.is_empty() {
                PatchOp::remove(object_path(from, &["links", relation]))
            } else {
                PatchOp::replace(
                    object_path(from, &["links", relation]),
                    serde_json::to_value(remaining).expect("targets serialize"),
                )
            };
            let mut ops = vec![link_op];
            ops.extend(stamp_ops(from, stamp));
            Ok(ops)
        })
    }

    fn set_metadata(
        &self,
        token: &str,
        space: &SpaceId,
        key: &str,
        value: &Value,
    ) -> ClientResult<()> {
        self.mutate("set_metadata", token, space, |record| {
            record.state.set_meta(key, value.clone());
            Ok(vec![PatchOp::add(
                Pointer::from_segments(vec!["meta".to_string(), key.to_string()]),
                value.clone(),
            )])
        })
    }

    fn create_conversation(
        &self,
        token: &str,
        space: &SpaceId,
        id: &ConversationId,
        conversation: &Conversation,
    ) -> ClientResult<()> {
        self.mutate("create_conversation", token, space, |record| {
            record
                .state
                .create_conversation(id.clone(), conversation.clone())?;
            Ok(vec![PatchOp::add(
                conversation_path(id, &[]),
                serde_json::to_value(conversation).expect("conversation serializes"),
            )])
        })
    }

    fn rename_conversation(
        &self,
        token: &str,
        space: &SpaceId,
        id: &ConversationId,
        name: &str,
    ) -> ClientResult<()> {
        self.mutate("rename_conversation", token, space, |record| {
            record.state.rename_conversation(id, name)?;
            Ok(vec![PatchOp::replace(
                conversation_path(id, &["name"]),
                name,
            )])
        })
    }

    fn delete_conversation(
        &self,
        token: &str,
        space: &SpaceId,
        id: &ConversationId,
    ) -> ClientResult<()> {
        self.mutate("delete_conversation", token, space, |record| {
            record.state.delete_conversation(id)?;
            Ok(vec![PatchOp::remove(conversation_path(id, &[]))])
        })
    }

    fn append_interaction(
        &self,
        token: &str,
        space: &SpaceId,
        id: &ConversationId,
        interaction: &Interaction,
    ) -> ClientResult<()> {
        self.mutate("append_interaction", token, space, |record| {
            record.state.append_interaction(id, interaction.clone())?;
            Ok(vec![PatchOp::add(
                conversation_path(id, &["interactions", "-"]),
                serde_json::to_value(interaction).expect("interaction serializes"),
            )])
        })
    }

    fn set_system_instruction(
        &self,
        token: &str,
        space: &SpaceId,
        id: &ConversationId,
        instruction: Option<&str>,
    ) -> ClientResult<()> {
        self.mutate("set_system_instruction", token, space, |record| {
            record
                .state
                .set_system_instruction(id, instruction.map(str::to_string))?;
            Ok(vec![PatchOp::replace(
                conversation_path(id, &["systemInstruction"]),
                instruction,
            )])
        })
    }

    fn checkpoint(&self, token: &str, space: &SpaceId, label: Option<&str>) -> ClientResult<()> {
        self.check("checkpoint", token)?;
        let mut spaces = self.inner.spaces.lock();
        let record = spaces.entry(space.clone()).or_default();
        record.history.push(Snapshot {
            label: label.map(str::to_string),
            state: record.state.clone(),
        });
        record.future.clear();
        Ok(())
    }

    fn undo(&self, token: &str, space: &SpaceId) -> ClientResult<()> {
        self.mutate("undo", token, space, |record| {
            let Some(snapshot) = record.history.pop() else {
                return Err(ClientError::server("nothing to undo"));
            };
            record.future.push(Snapshot {
                label: None,
                state: record.state.clone(),
            });
            record.state.objects = snapshot.state.objects;
            record.state.meta = snapshot.state.meta;
            record.state.conversations = snapshot.state.conversations;
            Ok(restore_ops(&record.state))
        })
    }

    fn redo(&self, token: &str, space: &SpaceId) -> ClientResult<()> {
        self.mutate("redo", token, space, |record| {
            let Some(snapshot) = record.future.pop() else {
                return Err(ClientError::server("nothing to redo"));
            };
            record.history.push(Snapshot {
                label: snapshot.label,
                state: record.state.clone(),
            });
            record.state.objects = snapshot.state.objects;
            record.state.meta = snapshot.state.meta;
            record.state.conversations = snapshot.state.conversations;
            Ok(restore_ops(&record.state))
        })
    }

    fn checkpoint_status(&self, token: &str, space: &SpaceId) -> ClientResult<CheckpointStatus> {
        self.check("checkpoint_status", token)?;
        let mut spaces = self.inner.spaces.lock();
        let record = spaces.entry(space.clone()).or_default();
        Ok(CheckpointStatus {
            can_undo: !record.history.is_empty(),
            can_redo: !record.future.is_empty(),
        })
    }

    fn clear_history(&self, token: &str, space: &SpaceId) -> ClientResult<()> {
        self.check("clear_history", token)?;
        let mut spaces = self.inner.spaces.lock();
        let record = spaces.entry(space.clone()).or_default();
        record.history.clear();
        record.future.clear();
        Ok(())
    }
}

struct ServerEventSource {
    rx: mpsc::Receiver<StreamEvent>,
}

impl EventSource for ServerEventSource {
    fn next_event(&mut self) -> ClientResult<Option<StreamEvent>> {
        match self.rx.recv() {
            Ok(event) => Ok(Some(event)),
            // Server dropped the sender: clean end of stream.
            Err(_) => Ok(None),
        }
    }
}

impl StreamConnector for InMemorySpaceServer {
    fn connect(&self, scope: &StreamScope, token: &str) -> ClientResult<Box<dyn EventSource>> {
        self.inner.connect_attempts.fetch_add(1, Ordering::SeqCst);
        let injected = self
            .inner
            .fail_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(ClientError::transport_retryable("injected connect failure"));
        }
        if self.inner.mint.verify(token).is_none() {
            return Err(ClientError::server("unauthorized"));
        }
        let (tx, rx) = mpsc::channel();
        match scope {
            StreamScope::Global => {
                let _ = tx.send(StreamEvent::Connected {
                    server_version: None,
                    timestamp: now_millis(),
                });
                self.inner.global_subscribers.lock().push(tx);
            }
            StreamScope::Space(space) => {
                let mut spaces = self.inner.spaces.lock();
                let record = spaces.entry(space.clone()).or_default();
                let _ = tx.send(StreamEvent::Connected {
                    server_version: Some(record.state.version.as_u64()),
                    timestamp: now_millis(),
                });
                record.subscribers.push(tx);
            }
        }
        Ok(Box::new(ServerEventSource { rx }))
    }
}

/// Credential provider wired to an [`InMemorySpaceServer`].
///
/// Refresh tokens rotate on every refresh; presenting a stale one is a
/// rejection, the same way a real identity provider behaves.
pub struct ServerBackedProvider {
    server: InMemorySpaceServer,
    user_id: String,
    ttl: Duration,
    generation: Mutex<u64>,
    refreshes: AtomicU64,
    reject_next: AtomicBool,
    fail_transient: AtomicU32,
    refresh_delay: Mutex<Duration>,
}

impl ServerBackedProvider {
    fn new(server: InMemorySpaceServer, user_id: &str) -> Self {
        Self {
            server,
            user_id: user_id.to_string(),
            ttl: Duration::from_secs(3600),
            generation: Mutex::new(0),
            refreshes: AtomicU64::new(0),
            reject_next: AtomicBool::new(false),
            fail_transient: AtomicU32::new(0),
            refresh_delay: Mutex::new(Duration::ZERO),
        }
    }

    /// Sets how long issued access tokens live.
    #[must_use]
    pub fn with_token_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Rejects the next refresh as an invalid session.
    pub fn reject_next_refresh(&self) {
        self.reject_next.store(true, Ordering::SeqCst);
    }

    /// Fails the next `n` refreshes with a transient transport error.
    pub fn fail_next_refreshes(&self, n: u32) {
        self.fail_transient.store(n, Ordering::SeqCst);
    }

    /// Adds artificial latency to refreshes.
    pub fn set_refresh_delay(&self, delay: Duration) {
        *self.refresh_delay.lock() = delay;
    }

    /// Number of successful refreshes served.
    #[must_use]
    pub fn refresh_count(&self) -> u64 {
        self.refreshes.load(Ordering::SeqCst)
    }

    fn refresh_token_for(&self, generation: u64) -> String {
        format!("refresh-{}-{generation}", self.user_id)
    }

    fn mint(&self, generation: u64) -> Credentials {
        Credentials::new(
            self.server.issue_token(&self.user_id),
            Some(self.refresh_token_for(generation)),
            now_millis() + self.ttl.as_millis() as u64,
        )
    }
}

impl CredentialProvider for ServerBackedProvider {
    fn refresh(&self, refresh_token: &str) -> ClientResult<Credentials> {
        let delay = *self.refresh_delay.lock();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        let transient = self
            .fail_transient
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if transient {
            return Err(ClientError::transport_retryable("injected refresh failure"));
        }
        if self.reject_next.swap(false, Ordering::SeqCst) {
            return Err(ClientError::CredentialsRejected("session revoked".into()));
        }
        let mut generation = self.generation.lock();
        if refresh_token != self.refresh_token_for(*generation) {
            return Err(ClientError::CredentialsRejected(
                "unknown refresh token".into(),
            ));
        }
        *generation += 1;
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        Ok(self.mint(*generation))
    }

    fn login(&self) -> ClientResult<Credentials> {
        let mut generation = self.generation.lock();
        *generation += 1;
        Ok(self.mint(*generation))
    }

    fn logout(&self, _token: &str) -> ClientResult<()> {
        // Invalidate outstanding refresh tokens.
        *self.generation.lock() += 1;
        Ok(())
    }

    fn get_storage(&self, _token: &str, key: &str) -> ClientResult<Option<Value>> {
        Ok(self.server.storage_of(&self.user_id, key))
    }

    fn set_storage(&self, _token: &str, key: &str, value: &Value) -> ClientResult<()> {
        self.server.write_storage(&self.user_id, key, value.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tether_core::{apply_patch, ApplyOutcome};
    use tether_proto::ChangeSource;

    fn entry(pairs: &[(&str, Value)]) -> ObjectEntry {
        ObjectEntry::new(
            pairs
                .iter()
                .map(|(k, v)| ((*k).to_string(), v.clone()))
                .collect(),
        )
    }

    fn drain(source: &mut Box<dyn EventSource>) -> StreamEvent {
        source.next_event().unwrap().expect("event available")
    }

    #[test]
    fn token_mint_roundtrip() {
        let mint = TokenMint::new("secret");
        let token = mint.issue("u1");
        assert_eq!(mint.verify(&token), Some("u1".to_string()));
        assert_eq!(mint.verify(&format!("{token}x")), None);
        assert_eq!(TokenMint::new("other").verify(&token), None);
    }

    #[test]
    fn rejects_bad_tokens() {
        let server = InMemorySpaceServer::new();
        let err = server
            .fetch_space("forged.deadbeef", &SpaceId::new("s1"))
            .unwrap_err();
        assert!(matches!(err, ClientError::Server(_)));
    }

    #[test]
    fn create_broadcasts_versioned_patch() {
        let server = InMemorySpaceServer::new();
        let token = server.issue_token("u1");
        let space = SpaceId::new("s1");
        let mut stream = server
            .connect(&StreamScope::Space(space.clone()), &token)
            .unwrap();
        assert!(drain(&mut stream).is_connected_marker());

        let id = ObjectId::parse("a").unwrap();
        server
            .create_object(&token, &space, &id, &entry(&[("id", json!("a"))]))
            .unwrap();

        match drain(&mut stream) {
            StreamEvent::SpacePatched { patch, source, .. } => {
                assert_eq!(source, WireSource::User);
                assert_eq!(patch.version_target(), Some(1));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(server.state_of(&space).version.as_u64(), 1);
    }

    #[test]
    fn own_patch_applies_as_pure_echo() {
        // A client that mirrored the mutation locally must see the
        // broadcast as a no-op.
        let server = InMemorySpaceServer::new();
        let token = server.issue_token("u1");
        let space = SpaceId::new("s1");
        let mut stream = server
            .connect(&StreamScope::Space(space.clone()), &token)
            .unwrap();
        let _ = drain(&mut stream);

        let id = ObjectId::parse("a").unwrap();
        let stamp = AuditStamp::new(42, Some("u1".into()), Some("User".into()));
        let mut sent = entry(&[("id", json!("a")), ("title", json!("t"))]);
        sent.stamp(&stamp);

        // Local mirror applies the same mutation first.
        let mut mirror = SpaceState::new();
        mirror.insert_object(id.clone(), sent.clone()).unwrap();

        server.create_object(&token, &space, &id, &sent).unwrap();
        let StreamEvent::SpacePatched { patch, .. } = drain(&mut stream) else {
            panic!("expected patch");
        };
        match apply_patch(&mirror, &patch, ChangeSource::RemoteUser).unwrap() {
            ApplyOutcome::Applied {
                changed,
                notifications,
                state,
            } => {
                assert!(!changed);
                assert!(notifications.is_empty());
                assert_eq!(state.version.as_u64(), 1);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn link_echo_and_foreign_application() {
        let server = InMemorySpaceServer::new();
        let token = server.issue_token("u1");
        let space = SpaceId::new("s1");
        let a = ObjectId::parse("a").unwrap();
        let b = ObjectId::parse("b").unwrap();
        server
            .create_object(&token, &space, &a, &entry(&[("id", json!("a"))]))
            .unwrap();
        server
            .create_object(&token, &space, &b, &entry(&[("id", json!("b"))]))
            .unwrap();

        let mut stream = server
            .connect(&StreamScope::Space(space.clone()), &token)
            .unwrap();
        let _ = drain(&mut stream);

        // A client that never saw the link applies the patch and gains it.
        let mut foreign = server.state_of(&space);
        let stamp = AuditStamp::new(43, Some("u1".into()), None);
        server.link(&token, &space, &a, "refs", &b, &stamp).unwrap();

        let StreamEvent::SpacePatched { patch, .. } = drain(&mut stream) else {
            panic!("expected patch");
        };
        match apply_patch(&foreign, &patch, ChangeSource::RemoteUser).unwrap() {
            ApplyOutcome::Applied {
                changed, state, ..
            } => {
                assert!(changed);
                foreign = state;
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(foreign.links_of(&a, "refs"), vec![b.clone()]);
        assert_eq!(foreign, server.state_of(&space));
    }

    #[test]
    fn undo_restores_previous_content_with_advancing_version() {
        let server = InMemorySpaceServer::new();
        let token = server.issue_token("u1");
        let space = SpaceId::new("s1");
        let id = ObjectId::parse("a").unwrap();
        server
            .create_object(&token, &space, &id, &entry(&[("id", json!("a"))]))
            .unwrap();

        server.checkpoint(&token, &space, Some("before edit")).unwrap();
        let stamp = AuditStamp::new(44, None, None);
        let fields: Map<String, Value> =
            [("title".to_string(), json!("edited"))].into_iter().collect();
        server
            .update_object(&token, &space, &id, &fields, &stamp)
            .unwrap();
        assert_eq!(server.state_of(&space).version.as_u64(), 2);

        let status = server.checkpoint_status(&token, &space).unwrap();
        assert!(status.can_undo && !status.can_redo);

        server.undo(&token, &space).unwrap();
        let state = server.state_of(&space);
        assert_eq!(state.version.as_u64(), 3);
        assert_eq!(state.object(&id).unwrap().data_field("title"), None);

        let status = server.checkpoint_status(&token, &space).unwrap();
        assert!(!status.can_undo && status.can_redo);

        server.redo(&token, &space).unwrap();
        let state = server.state_of(&space);
        assert_eq!(state.version.as_u64(), 4);
        assert_eq!(
            state.object(&id).unwrap().data_field("title"),
            Some(&json!("edited"))
        );
    }

    #[test]
    fn injected_request_failures_are_transient() {
        let server = InMemorySpaceServer::new();
        let token = server.issue_token("u1");
        let space = SpaceId::new("s1");

        server.fail_next_requests(1);
        let err = server.fetch_space(&token, &space).unwrap_err();
        assert!(err.is_retryable());
        assert!(server.fetch_space(&token, &space).is_ok());
    }

    #[test]
    fn injected_connect_failures_then_success() {
        let server = InMemorySpaceServer::new();
        let token = server.issue_token("u1");
        let scope = StreamScope::Space(SpaceId::new("s1"));

        server.fail_next_connects(2);
        assert!(server.connect(&scope, &token).is_err());
        assert!(server.connect(&scope, &token).is_err());
        assert!(server.connect(&scope, &token).is_ok());
        assert_eq!(server.connect_attempts(), 3);
    }

    #[test]
    fn provider_rotates_refresh_tokens() {
        let server = InMemorySpaceServer::new();
        let provider = server.provider("u1");

        let creds = provider.login().unwrap();
        let first_refresh = creds.refresh_token.clone().unwrap();
        let next = provider.refresh(&first_refresh).unwrap();
        assert_ne!(next.refresh_token.as_deref(), Some(first_refresh.as_str()));
        assert_eq!(provider.refresh_count(), 1);

        // The consumed token no longer works.
        let err = provider.refresh(&first_refresh).unwrap_err();
        assert!(err.is_rejection());
    }

    #[test]
    fn provider_storage_broadcasts_change() {
        let server = InMemorySpaceServer::new();
        let provider = server.provider("u1");
        let token = server.issue_token("u1");
        let mut global = server.connect(&StreamScope::Global, &token).unwrap();
        assert!(drain(&mut global).is_connected_marker());

        provider
            .set_storage(&token, "prefs", &json!({"theme": "dark"}))
            .unwrap();
        assert_eq!(
            provider.get_storage(&token, "prefs").unwrap(),
            Some(json!({"theme": "dark"}))
        );
        assert!(matches!(
            drain(&mut global),
            StreamEvent::UserStorageChanged { .. }
        ));
    }

    #[test]
    fn disconnect_ends_streams_cleanly() {
        let server = InMemorySpaceServer::new();
        let token = server.issue_token("u1");
        let space = SpaceId::new("s1");
        let mut stream = server
            .connect(&StreamScope::Space(space.clone()), &token)
            .unwrap();
        let _ = drain(&mut stream);

        server.disconnect_space(&space);
        assert!(stream.next_event().unwrap().is_none());
    }
}
