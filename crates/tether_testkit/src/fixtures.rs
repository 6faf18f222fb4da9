//! Test fixtures and sync-scenario helpers.
//!
//! Provides convenience wiring for clients against the in-memory
//! server, notification collection, and polling helpers for the
//! asynchronous parts of the stack.

use crate::server::InMemorySpaceServer;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tether_client::{
    AuthConfig, AuthSession, BackoffConfig, ClientIdentity, NotificationHub, SpaceSyncEngine,
    StreamConnector, StreamScope, StreamTransport,
};
use tether_core::{
    AuditStamp, Notification, NotificationKind, ObjectEntry, ObjectId, SpaceId, SpaceState,
};
use tether_proto::{Patch, PatchOp, Pointer, VERSION_POINTER};

/// A fully wired client: authenticated session, sync engine, and a live
/// event stream pumping server broadcasts into the engine.
pub struct TestClient {
    /// The server this client talks to. Clones share state, so several
    /// clients can sit on one server.
    pub server: InMemorySpaceServer,
    /// The authenticated session.
    pub auth: Arc<AuthSession>,
    /// The sync engine for the space.
    pub engine: Arc<SpaceSyncEngine<InMemorySpaceServer>>,
    /// The stream transport, exposed for connection-state assertions.
    pub stream: StreamTransport,
}

impl TestClient {
    /// Connects a client for `user_id` to a space on `server`: logs in,
    /// fetches the space, subscribes to its stream, and starts the event
    /// pump.
    pub fn connect(server: &InMemorySpaceServer, user_id: &str, space: &SpaceId) -> Self {
        let provider = Arc::new(server.provider(user_id));
        let auth = AuthSession::new(provider, AuthConfig::new().with_proactive_refresh(false));
        auth.login().expect("login against test server");

        let engine = SpaceSyncEngine::open(
            Arc::new(server.clone()),
            auth.clone(),
            ClientIdentity::new(user_id, user_id),
            space.clone(),
        )
        .expect("open space");

        let stream = StreamTransport::new(
            Arc::new(server.clone()) as Arc<dyn StreamConnector>,
            auth.clone(),
            StreamScope::Space(space.clone()),
            fast_backoff(),
        );
        let events = stream.subscribe().expect("subscribe to space stream");
        SpaceSyncEngine::spawn_event_pump(engine.clone(), events);

        Self {
            server: server.clone(),
            auth,
            engine,
            stream,
        }
    }

    /// Attaches a collector to this client's notification hub.
    pub fn collector(&self) -> CollectingHandler {
        CollectingHandler::attach(self.engine.hub())
    }

    /// Waits until the engine's confirmed version reaches `version`.
    pub fn wait_for_version(&self, version: u64, timeout: Duration) -> bool {
        wait_until(timeout, || self.engine.version().as_u64() >= version)
    }

    /// Closes this client's stream permanently.
    pub fn disconnect(&self) {
        self.stream.unsubscribe();
    }
}

/// Runs a test with one synced client on a fresh server.
pub fn with_synced_client<F, R>(f: F) -> R
where
    F: FnOnce(&TestClient) -> R,
{
    let server = InMemorySpaceServer::new();
    let client = TestClient::connect(&server, "user-1", &SpaceId::new("s1"));
    f(&client)
}

/// Runs a test with two clients sharing one space.
pub fn with_two_clients<F, R>(f: F) -> R
where
    F: FnOnce(&TestClient, &TestClient) -> R,
{
    let server = InMemorySpaceServer::new();
    let space = SpaceId::new("s1");
    let alice = TestClient::connect(&server, "alice", &space);
    let bob = TestClient::connect(&server, "bob", &space);
    f(&alice, &bob)
}

/// Builds a JSON object map from key/value pairs.
pub fn data(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), v.clone()))
        .collect()
}

/// Builds an object entry whose data carries `id` plus the given pairs.
pub fn entry(id: &str, pairs: &[(&str, Value)]) -> ObjectEntry {
    let mut map = data(pairs);
    map.insert("id".to_string(), Value::String(id.to_string()));
    ObjectEntry::new(map)
}

/// A backoff policy quick enough for reconnect tests.
pub fn fast_backoff() -> BackoffConfig {
    BackoffConfig::new()
        .with_initial_delay(Duration::from_millis(2))
        .with_max_delay(Duration::from_millis(10))
}

/// A patch creating `entry` at `id`, anchored at `version`.
pub fn object_add_patch(id: &ObjectId, entry: &ObjectEntry, version: u64) -> Patch {
    Patch::new(vec![
        PatchOp::add(
            Pointer::from_segments(vec!["objects".to_string(), id.to_string()]),
            serde_json::to_value(entry).expect("entry serializes"),
        ),
        version_op(version),
    ])
}

/// A patch that only advances the version anchor.
pub fn version_only_patch(version: u64) -> Patch {
    Patch::new(vec![version_op(version)])
}

fn version_op(version: u64) -> PatchOp {
    PatchOp::replace(
        Pointer::parse(VERSION_POINTER).expect("version pointer parses"),
        version,
    )
}

/// Collects every notification a hub emits, for later assertions.
pub struct CollectingHandler {
    seen: Arc<Mutex<Vec<Notification>>>,
}

impl CollectingHandler {
    /// Subscribes to all notifications on `hub`.
    pub fn attach(hub: &NotificationHub) -> Self {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        hub.subscribe_any(move |n| sink.lock().push(n.clone()));
        Self { seen }
    }

    /// Everything collected so far.
    pub fn notifications(&self) -> Vec<Notification> {
        self.seen.lock().clone()
    }

    /// Kinds of everything collected so far, in order.
    pub fn kinds(&self) -> Vec<NotificationKind> {
        self.seen.lock().iter().map(Notification::kind).collect()
    }

    /// Drains the collection.
    pub fn take(&self) -> Vec<Notification> {
        std::mem::take(&mut *self.seen.lock())
    }

    /// True if nothing has been collected.
    pub fn is_empty(&self) -> bool {
        self.seen.lock().is_empty()
    }

    /// Waits until a notification of `kind` has been collected.
    pub fn wait_for(&self, kind: NotificationKind, timeout: Duration) -> bool {
        wait_until(timeout, || self.kinds().contains(&kind))
    }
}

/// Polls `cond` every few milliseconds until it holds or `timeout`
/// elapses. Returns whether it held.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// Installs a test-friendly tracing subscriber honoring `RUST_LOG`.
/// Safe to call from every test; only the first call wins.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Pre-populated scenario builders.
pub mod scenarios {
    use super::*;

    /// A space holding `count` notes, each linked to the next one with a
    /// `next` relation.
    pub fn chained_notes(count: usize) -> SpaceState {
        let mut state = SpaceState::new();
        let stamp = AuditStamp::new(1000, Some("seed".to_string()), None);
        let ids: Vec<ObjectId> = (0..count)
            .map(|i| ObjectId::parse(format!("note_{i}")).expect("note id parses"))
            .collect();
        for (i, id) in ids.iter().enumerate() {
            let entry = entry(
                id.as_str(),
                &[
                    ("kind", Value::String("note".to_string())),
                    ("index", Value::from(i as u64)),
                ],
            );
            state
                .insert_object(id.clone(), entry)
                .expect("seed insert succeeds");
        }
        for pair in ids.windows(2) {
            state
                .link(&pair[0], "next", &pair[1], &stamp)
                .expect("seed link succeeds");
        }
        state
    }

    /// A server with one space pre-populated with chained notes.
    pub fn seeded_server(space: &SpaceId, count: usize) -> InMemorySpaceServer {
        let server = InMemorySpaceServer::new();
        server.seed_space(space, chained_notes(count));
        server
    }
}
