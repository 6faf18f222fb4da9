//! End-to-end tests: engines, streams, and the in-memory server.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tether_client::{
    AuthConfig, AuthSession, ChangeSource, ClientIdentity, ConnectionState, Interaction,
    Notification, NotificationKind, ObjectId, SessionContext, SpaceApi, SpaceId, SpaceSyncEngine,
    StreamConnector, StreamScope, StreamTransport, WireSource,
};
use tether_testkit::{
    data, entry, fast_backoff, object_add_patch, wait_until, with_synced_client, with_two_clients,
    InMemorySpaceServer, TestClient,
};

const WAIT: Duration = Duration::from_secs(2);

fn oid(s: &str) -> ObjectId {
    ObjectId::parse(s).unwrap()
}

#[test]
fn two_clients_converge() {
    with_two_clients(|alice, bob| {
        alice
            .engine
            .create_object(data(&[("id", json!("a1")), ("title", json!("plan"))]))
            .unwrap();
        assert!(bob.wait_for_version(1, WAIT));

        bob.engine
            .create_object(data(&[("id", json!("b1")), ("title", json!("notes"))]))
            .unwrap();
        assert!(alice.wait_for_version(2, WAIT));

        alice.engine.link(&oid("a1"), "refs", &oid("b1")).unwrap();
        bob.engine
            .update_object(&oid("b1"), data(&[("done", json!(true))]))
            .unwrap();

        assert!(alice.wait_for_version(4, WAIT));
        assert!(bob.wait_for_version(4, WAIT));

        let server_state = alice.server.state_of(alice.engine.space_id());
        assert_eq!(alice.engine.snapshot(), server_state);
        assert_eq!(bob.engine.snapshot(), server_state);
        assert_eq!(bob.engine.links_of(&oid("a1"), "refs"), vec![oid("b1")]);
    });
}

#[test]
fn local_writes_notify_once_and_suppress_echoes() {
    with_synced_client(|client| {
        let seen = client.collector();
        client
            .engine
            .create_object(data(&[("id", json!("n1"))]))
            .unwrap();
        client
            .engine
            .update_object(&oid("n1"), data(&[("title", json!("x"))]))
            .unwrap();
        client.engine.set_metadata("theme", json!("dark")).unwrap();
        assert!(client.wait_for_version(3, WAIT));

        let stats = client.engine.stats();
        assert_eq!(stats.operations_sent, 3);
        assert_eq!(stats.echoes_suppressed, 3);
        assert_eq!(stats.patches_applied, 3);
        assert_eq!(stats.patches_dropped, 0);

        // One notification per write, from the optimistic apply.
        assert_eq!(
            seen.kinds(),
            vec![
                NotificationKind::ObjectCreated,
                NotificationKind::ObjectUpdated,
                NotificationKind::MetaChanged,
            ]
        );
        assert!(matches!(
            seen.notifications()[0],
            Notification::ObjectCreated {
                source: ChangeSource::LocalUser,
                ..
            }
        ));
    });
}

#[test]
fn foreign_patches_notify_with_remote_source() {
    with_two_clients(|alice, bob| {
        let seen = bob.collector();
        alice
            .engine
            .create_object(data(&[("id", json!("n1"))]))
            .unwrap();

        assert!(seen.wait_for(NotificationKind::ObjectCreated, WAIT));
        let created = seen
            .notifications()
            .into_iter()
            .find(|n| n.kind() == NotificationKind::ObjectCreated)
            .unwrap();
        match created {
            Notification::ObjectCreated { id, source } => {
                assert_eq!(id, oid("n1"));
                assert_eq!(source, ChangeSource::RemoteUser);
            }
            other => panic!("unexpected notification {other:?}"),
        }
        assert_eq!(bob.engine.stats().patches_applied, 1);
        assert_eq!(bob.engine.stats().echoes_suppressed, 0);
    });
}

#[test]
fn version_gap_forces_resync() {
    with_synced_client(|client| {
        client
            .engine
            .create_object(data(&[("id", json!("real"))]))
            .unwrap();
        assert!(client.wait_for_version(1, WAIT));

        let seen = client.collector();
        // A patch from the future. The client must reload rather than
        // apply it, and the reload lands on the server's real state,
        // which never held the ghost.
        client.server.broadcast_patch(
            client.engine.space_id(),
            object_add_patch(&oid("ghost"), &entry("ghost", &[]), 9),
            WireSource::User,
        );

        assert!(seen.wait_for(NotificationKind::FullReset, WAIT));
        assert!(!client.engine.contains_object(&oid("ghost")));
        assert_eq!(client.engine.version().as_u64(), 1);
        let stats = client.engine.stats();
        assert_eq!(stats.version_gaps, 1);
        assert_eq!(stats.resyncs, 1);

        // Subscribers hear why the reset happened.
        let causes: Vec<String> = seen
            .notifications()
            .into_iter()
            .filter_map(|n| match n {
                Notification::SyncError { message } => Some(message),
                _ => None,
            })
            .collect();
        assert!(causes.iter().any(|m| m.contains("version gap")));
    });
}

#[test]
fn concurrent_resyncs_share_one_fetch() {
    with_synced_client(|client| {
        client.server.set_fetch_delay(Duration::from_millis(100));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let engine = client.engine.clone();
                std::thread::spawn(move || engine.resync())
            })
            .collect();
        for handle in handles {
            handle.join().unwrap().unwrap();
        }

        // Triggers that arrived mid-flight waited for the running fetch
        // instead of stacking their own.
        let stats = client.engine.stats();
        assert!(stats.resyncs >= 1);
        assert!(stats.resyncs < 4);
    });
}

#[test]
fn missed_writes_heal_after_reconnect() {
    with_synced_client(|client| {
        let space = client.engine.space_id().clone();
        let states = client.stream.on_state_change();

        // Take the stream down and keep the next attempts failing while a
        // write lands server-side behind the client's back.
        client.server.fail_next_connects(3);
        client.server.disconnect_space(&space);
        let token = client.server.issue_token("writer");
        client
            .server
            .create_object(
                &token,
                &space,
                &oid("offline"),
                &entry("offline", &[("kind", json!("note"))]),
            )
            .unwrap();

        assert_eq!(states.recv_timeout(WAIT).unwrap(), ConnectionState::Reconnecting);
        assert_eq!(states.recv_timeout(WAIT).unwrap(), ConnectionState::Connected);

        assert!(wait_until(WAIT, || client.engine.contains_object(&oid("offline"))));
        assert_eq!(client.engine.version().as_u64(), 1);
        // Initial connect, three injected failures, one success.
        assert!(client.server.connect_attempts() >= 5);
    });
}

#[test]
fn expired_tokens_refresh_transparently() {
    let server = InMemorySpaceServer::new();
    let provider = Arc::new(
        server
            .provider("carol")
            .with_token_ttl(Duration::from_millis(1)),
    );
    let auth = AuthSession::new(
        provider.clone(),
        AuthConfig::new().with_proactive_refresh(false),
    );
    auth.login().unwrap();

    let engine = SpaceSyncEngine::open(
        Arc::new(server.clone()),
        auth.clone(),
        ClientIdentity::new("carol", "Carol"),
        SpaceId::new("s1"),
    )
    .unwrap();
    engine
        .create_object(data(&[("id", json!("n1"))]))
        .unwrap();

    // Every call found the previous token inside the refresh buffer.
    assert!(provider.refresh_count() >= 2);
    assert_eq!(server.state_of(&SpaceId::new("s1")).version.as_u64(), 1);
    assert!(auth.is_authenticated());
}

#[test]
fn revoked_sessions_reject_and_clear_credentials() {
    let server = InMemorySpaceServer::new();
    let provider = Arc::new(
        server
            .provider("mallory")
            .with_token_ttl(Duration::from_millis(1)),
    );
    let auth = AuthSession::new(
        provider.clone(),
        AuthConfig::new().with_proactive_refresh(false),
    );
    auth.login().unwrap();
    let engine = SpaceSyncEngine::open(
        Arc::new(server.clone()),
        auth.clone(),
        ClientIdentity::new("mallory", "Mallory"),
        SpaceId::new("s1"),
    )
    .unwrap();

    provider.reject_next_refresh();
    let err = engine
        .create_object(data(&[("id", json!("n1"))]))
        .unwrap_err();

    assert!(err.is_rejection());
    assert!(!auth.is_authenticated());
}

#[test]
fn checkpoint_undo_redo_round_trip() {
    with_synced_client(|client| {
        client
            .engine
            .create_object(data(&[("id", json!("draft")), ("title", json!("first"))]))
            .unwrap();
        assert!(client.wait_for_version(1, WAIT));

        let checkpoints = client.engine.checkpoints();
        checkpoints.checkpoint(Some("before rewrite")).unwrap();
        client
            .engine
            .update_object(&oid("draft"), data(&[("title", json!("second"))]))
            .unwrap();
        assert!(client.wait_for_version(2, WAIT));

        let status = checkpoints.status().unwrap();
        assert!(status.can_undo);
        assert!(!status.can_redo);

        checkpoints.undo().unwrap();
        assert!(client.wait_for_version(3, WAIT));
        let restored = client.engine.object(&oid("draft")).unwrap();
        assert_eq!(restored.data_field("title"), Some(&json!("first")));
        assert!(checkpoints.status().unwrap().can_redo);

        checkpoints.redo().unwrap();
        assert!(client.wait_for_version(4, WAIT));
        let redone = client.engine.object(&oid("draft")).unwrap();
        assert_eq!(redone.data_field("title"), Some(&json!("second")));

        // Undone and redone content arrived like any other patch.
        assert_eq!(client.engine.stats().resyncs, 0);
        assert_eq!(
            client.engine.snapshot(),
            client.server.state_of(client.engine.space_id())
        );
    });
}

#[test]
fn resync_drops_server_checkpoint_history() {
    with_synced_client(|client| {
        client
            .engine
            .create_object(data(&[("id", json!("n1"))]))
            .unwrap();
        assert!(client.wait_for_version(1, WAIT));

        let checkpoints = client.engine.checkpoints();
        checkpoints.checkpoint(None).unwrap();
        assert!(checkpoints.status().unwrap().can_undo);

        client.server.broadcast_space_changed(client.engine.space_id());
        assert!(wait_until(WAIT, || client.engine.stats().resyncs >= 1));
        // The reload invalidated the undo stack along with local state.
        assert!(wait_until(WAIT, || !checkpoints.status().unwrap().can_undo));
    });
}

#[test]
fn conversations_flow_between_clients() {
    with_two_clients(|alice, bob| {
        let conversation = alice.engine.create_conversation(Some("planning")).unwrap();
        alice
            .engine
            .append_interaction(
                &conversation,
                Interaction::new(1_000, "chat", json!({"prompt": "hello"}), json!({"reply": "hi"})),
            )
            .unwrap();
        alice
            .engine
            .set_system_instruction(&conversation, Some("be terse"))
            .unwrap();
        assert!(bob.wait_for_version(3, WAIT));

        let seen = bob.engine.conversation(&conversation).unwrap();
        assert_eq!(seen.name.as_deref(), Some("planning"));
        assert_eq!(seen.created_by, "alice");
        assert_eq!(seen.system_instruction.as_deref(), Some("be terse"));
        assert_eq!(seen.interactions.len(), 1);
        assert_eq!(seen.interactions[0].input, json!({"prompt": "hello"}));
    });
}

#[test]
fn export_import_seeds_a_fresh_space() {
    let server = InMemorySpaceServer::new();
    let source = TestClient::connect(&server, "alice", &SpaceId::new("s1"));
    source
        .engine
        .create_object(data(&[("id", json!("a")), ("kind", json!("note"))]))
        .unwrap();
    source
        .engine
        .create_object(data(&[("id", json!("b"))]))
        .unwrap();
    source.engine.link(&oid("a"), "refs", &oid("b")).unwrap();
    assert!(source.wait_for_version(3, WAIT));

    let target = TestClient::connect(&server, "carol", &SpaceId::new("s2"));
    let imported = target.engine.import(source.engine.export()).unwrap();
    assert_eq!(imported, 2);
    assert!(target.wait_for_version(2, WAIT));

    assert_eq!(target.engine.links_of(&oid("a"), "refs"), vec![oid("b")]);
    assert_eq!(
        target.engine.object(&oid("a")).unwrap().data_field("kind"),
        Some(&json!("note"))
    );
    assert_eq!(
        target.engine.snapshot(),
        server.state_of(&SpaceId::new("s2"))
    );
}

/// Wires one session context for `alice` with a live global stream.
fn device(
    server: &InMemorySpaceServer,
) -> (Arc<SessionContext<InMemorySpaceServer>>, StreamTransport) {
    let auth = AuthSession::new(
        Arc::new(server.provider("alice")),
        AuthConfig::new().with_proactive_refresh(false),
    );
    auth.login().unwrap();
    let context = SessionContext::new(
        Arc::new(server.clone()),
        auth.clone(),
        ClientIdentity::new("alice", "Alice"),
    );
    let stream = StreamTransport::new(
        Arc::new(server.clone()) as Arc<dyn StreamConnector>,
        auth,
        StreamScope::Global,
        fast_backoff(),
    );
    let events = stream.subscribe().unwrap();
    SessionContext::spawn_global_pump(context.clone(), events);
    (context, stream)
}

#[test]
fn storage_changes_invalidate_across_devices() {
    let server = InMemorySpaceServer::new();
    let (first, _first_stream) = device(&server);
    let (second, _second_stream) = device(&server);

    first
        .storage_set("prefs", json!({"theme": "light"}))
        .unwrap();
    assert_eq!(
        second.storage_get("prefs").unwrap(),
        Some(json!({"theme": "light"}))
    );

    // The second device writes; the first learns through the global
    // stream that its cache is stale.
    second
        .storage_set("prefs", json!({"theme": "dark"}))
        .unwrap();
    assert!(wait_until(WAIT, || {
        first.storage_get("prefs").ok().flatten() == Some(json!({"theme": "dark"}))
    }));
}
