//! Property-based test generators using proptest.
//!
//! Provides strategies for random space content and operation
//! sequences that maintain required invariants.

use proptest::prelude::*;
use serde_json::{Map, Value};
use tether_core::{AuditStamp, ObjectEntry, ObjectId, SpaceState};

/// Strategy for generating valid object ids.
pub fn object_id_strategy() -> impl Strategy<Value = ObjectId> {
    prop::string::string_regex("[A-Za-z0-9_-]{1,24}")
        .expect("Invalid regex")
        .prop_map(|id| ObjectId::parse(id).expect("generated id is valid"))
}

/// Strategy for generating valid relation names.
pub fn relation_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9_]{0,15}").expect("Invalid regex")
}

/// Strategy for generating small JSON scalar values.
pub fn json_value_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        prop::string::string_regex("[a-zA-Z0-9 ]{0,12}")
            .expect("Invalid regex")
            .prop_map(Value::from),
        any::<i64>().prop_map(Value::from),
        any::<bool>().prop_map(Value::from),
    ]
}

/// Strategy for generating object data maps. The reserved `id` member is
/// never produced; callers add it where needed.
pub fn data_strategy() -> impl Strategy<Value = Map<String, Value>> {
    let key = prop::string::string_regex("[a-z]{2,8}")
        .expect("Invalid regex")
        .prop_filter("id is reserved", |k| k != "id");
    prop::collection::btree_map(key, json_value_strategy(), 0..4)
        .prop_map(|map| map.into_iter().collect())
}

/// Strategy for generating whole space states: a handful of objects with
/// random data and random edges between them.
pub fn space_state_strategy() -> impl Strategy<Value = SpaceState> {
    let objects = prop::collection::btree_map(object_id_strategy(), data_strategy(), 0..8);
    let edges = prop::collection::vec(
        (
            any::<prop::sample::Index>(),
            relation_strategy(),
            any::<prop::sample::Index>(),
        ),
        0..12,
    );
    (objects, edges).prop_map(|(objects, edges)| {
        let mut state = SpaceState::new();
        let stamp = AuditStamp::new(1, None, None);
        for (id, data) in objects {
            state
                .insert_object(id, ObjectEntry::new(data))
                .expect("generated ids are unique");
        }
        let ids: Vec<ObjectId> = state.objects.keys().cloned().collect();
        if ids.is_empty() {
            return state;
        }
        for (from, relation, to) in edges {
            let from = from.get(&ids).clone();
            let to = to.get(&ids).clone();
            state
                .link(&from, &relation, &to, &stamp)
                .expect("source object exists");
        }
        state
    })
}

/// One client-level space operation.
#[derive(Debug, Clone)]
pub enum SpaceOp {
    /// Create an object.
    Create {
        /// Object id.
        id: ObjectId,
        /// Object data, without the `id` member.
        data: Map<String, Value>,
    },
    /// Merge fields into an object.
    Update {
        /// Object id.
        id: ObjectId,
        /// Fields to merge.
        fields: Map<String, Value>,
    },
    /// Delete an object.
    Delete {
        /// Object id.
        id: ObjectId,
    },
    /// Add a relation edge.
    Link {
        /// Source object.
        from: ObjectId,
        /// Relation name.
        relation: String,
        /// Target object.
        to: ObjectId,
    },
    /// Remove a relation edge.
    Unlink {
        /// Source object.
        from: ObjectId,
        /// Relation name.
        relation: String,
        /// Target object.
        to: ObjectId,
    },
}

/// Ids drawn from a small pool so a random sequence revisits objects.
fn pooled_id_strategy() -> impl Strategy<Value = ObjectId> {
    prop::sample::select(vec!["a", "b", "c", "d", "e"])
        .prop_map(|id| ObjectId::parse(id).expect("pool ids are valid"))
}

/// Relations drawn from a small pool so edges collide.
fn pooled_relation_strategy() -> impl Strategy<Value = String> {
    prop::sample::select(vec!["refs", "next", "parent"]).prop_map(str::to_string)
}

/// Strategy for generating one space operation.
pub fn space_op_strategy() -> impl Strategy<Value = SpaceOp> {
    prop_oneof![
        3 => (pooled_id_strategy(), data_strategy())
            .prop_map(|(id, data)| SpaceOp::Create { id, data }),
        2 => (pooled_id_strategy(), data_strategy())
            .prop_map(|(id, fields)| SpaceOp::Update { id, fields }),
        1 => pooled_id_strategy().prop_map(|id| SpaceOp::Delete { id }),
        2 => (pooled_id_strategy(), pooled_relation_strategy(), pooled_id_strategy())
            .prop_map(|(from, relation, to)| SpaceOp::Link { from, relation, to }),
        1 => (pooled_id_strategy(), pooled_relation_strategy(), pooled_id_strategy())
            .prop_map(|(from, relation, to)| SpaceOp::Unlink { from, relation, to }),
    ]
}

/// Strategy for generating a sequence of operations.
pub fn op_sequence_strategy(min_ops: usize, max_ops: usize) -> impl Strategy<Value = Vec<SpaceOp>> {
    prop::collection::vec(space_op_strategy(), min_ops..max_ops)
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 32,
            max_shrink_iters: 100,
        }
    }

    /// Creates a configuration for thorough tests.
    #[must_use]
    pub fn thorough() -> Self {
        Self {
            cases: 1024,
            max_shrink_iters: 10000,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}
