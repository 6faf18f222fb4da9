//! Property tests: random operation sequences leave every client
//! mirroring the server.

use proptest::prelude::*;
use std::time::Duration;
use tether_client::ClientResult;
use tether_core::SpaceId;
use tether_testkit::{
    init_tracing, op_sequence_strategy, wait_until, InMemorySpaceServer, PropTestConfig, SpaceOp,
    TestClient,
};

const WAIT: Duration = Duration::from_secs(5);

/// Drives one operation through a client's engine.
///
/// Random sequences hit validation failures (duplicate creates, updates
/// of missing objects) and races against the other client's writes.
/// Those are allowed to fail; divergence is what the properties rule
/// out.
fn drive(client: &TestClient, op: &SpaceOp) -> ClientResult<()> {
    match op {
        SpaceOp::Create { id, data } => {
            let mut data = data.clone();
            data.insert("id".to_string(), serde_json::Value::String(id.to_string()));
            client.engine.create_object(data).map(|_| ())
        }
        SpaceOp::Update { id, fields } => {
            client.engine.update_object(id, fields.clone()).map(|_| ())
        }
        SpaceOp::Delete { id } => client.engine.delete_objects(std::slice::from_ref(id)),
        SpaceOp::Link { from, relation, to } => {
            client.engine.link(from, relation, to).map(|_| ())
        }
        SpaceOp::Unlink { from, relation, to } => {
            client.engine.unlink(from, relation, to).map(|_| ())
        }
    }
}

fn shut_down(client: &TestClient, space: &SpaceId) {
    client.disconnect();
    client.server.disconnect_space(space);
}

proptest! {
    #![proptest_config(PropTestConfig::quick().to_proptest_config())]

    #[test]
    fn one_client_mirrors_the_server(ops in op_sequence_strategy(1, 24)) {
        init_tracing();
        let server = InMemorySpaceServer::new();
        let space = SpaceId::new("prop");
        let client = TestClient::connect(&server, "user-1", &space);

        for op in &ops {
            let _ = drive(&client, op);
        }

        let version = server.state_of(&space).version;
        prop_assert!(wait_until(WAIT, || client.engine.version() == version));
        prop_assert_eq!(client.engine.snapshot(), server.state_of(&space));
        shut_down(&client, &space);
    }

    #[test]
    fn two_clients_converge_on_interleaved_writes(ops in op_sequence_strategy(2, 20)) {
        init_tracing();
        let server = InMemorySpaceServer::new();
        let space = SpaceId::new("prop");
        let alice = TestClient::connect(&server, "alice", &space);
        let bob = TestClient::connect(&server, "bob", &space);

        for (i, op) in ops.iter().enumerate() {
            let side = if i % 2 == 0 { &alice } else { &bob };
            let _ = drive(side, op);
        }

        let version = server.state_of(&space).version;
        prop_assert!(wait_until(
            WAIT,
            || alice.engine.version() == version && bob.engine.version() == version
        ));
        let server_state = server.state_of(&space);
        prop_assert_eq!(alice.engine.snapshot(), server_state.clone());
        prop_assert_eq!(bob.engine.snapshot(), server_state);
        shut_down(&alice, &space);
        shut_down(&bob, &space);
    }
}
