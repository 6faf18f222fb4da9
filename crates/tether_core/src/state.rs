//! The space document: objects, links, metadata, conversations.
//!
//! `SpaceState` is a plain value. Whoever owns one mutates it through the
//! typed operations here; the sync layer clones it, computes a successor
//! state, and swaps. Patches address the serialized form, so the serde
//! shape of these structs is the wire shape (`/objects/{id}/data/...`,
//! `/objects/{id}/links/{relation}`, `/meta/...`, `/conversations/{id}`).

use crate::error::{CoreError, CoreResult};
use crate::types::{now_millis, ConversationId, ObjectId, Version};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

/// Audit attribution applied to mutated objects.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuditStamp {
    /// Unix milliseconds of the write.
    pub at: u64,
    /// Modifier id, when known.
    pub by: Option<String>,
    /// Modifier display name, when known.
    pub by_name: Option<String>,
}

impl AuditStamp {
    /// Creates a stamp with an explicit timestamp.
    pub fn new(at: u64, by: Option<String>, by_name: Option<String>) -> Self {
        Self { at, by, by_name }
    }

    /// Creates a stamp at the current wall clock.
    pub fn now(by: Option<String>, by_name: Option<String>) -> Self {
        Self::new(now_millis(), by, by_name)
    }
}

/// One object in a space: free-form data plus named, ordered relations.
///
/// Serialization deliberately emits every field (no skipping) so that two
/// entries built from the same inputs compare equal value-for-value; echo
/// detection relies on that.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectEntry {
    /// Relation name to ordered target ids. No duplicate targets.
    #[serde(default)]
    pub links: BTreeMap<String, Vec<ObjectId>>,
    /// Free-form record. Always carries an `id` member equal to the key
    /// this entry is stored under.
    #[serde(default)]
    pub data: Map<String, Value>,
    /// Unix milliseconds of the last modification.
    #[serde(default)]
    pub updated_at: u64,
    /// Id of the last modifier.
    #[serde(default)]
    pub updated_by: Option<String>,
    /// Display name of the last modifier.
    #[serde(default)]
    pub updated_by_name: Option<String>,
}

impl ObjectEntry {
    /// Creates an entry around `data` with no links and no audit trail.
    pub fn new(data: Map<String, Value>) -> Self {
        Self {
            links: BTreeMap::new(),
            data,
            updated_at: 0,
            updated_by: None,
            updated_by_name: None,
        }
    }

    /// Applies audit attribution.
    pub fn stamp(&mut self, stamp: &AuditStamp) {
        self.updated_at = stamp.at;
        self.updated_by = stamp.by.clone();
        self.updated_by_name = stamp.by_name.clone();
    }

    /// Reads one data field.
    #[must_use]
    pub fn data_field(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Raw (unfiltered) targets of a relation. Use
    /// [`SpaceState::links_of`] for the dangling-free view.
    #[must_use]
    pub fn raw_targets(&self, relation: &str) -> &[ObjectId] {
        self.links.get(relation).map_or(&[], Vec::as_slice)
    }
}

/// A recorded exchange within a conversation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Interaction {
    /// Unix milliseconds when the interaction happened.
    #[serde(default)]
    pub timestamp: u64,
    /// Operation kind (free-form, e.g. `"chat"`).
    #[serde(default)]
    pub operation: String,
    /// Input payload.
    #[serde(default)]
    pub input: Value,
    /// Output payload.
    #[serde(default)]
    pub output: Value,
    /// Tool-call trace, in call order.
    #[serde(default)]
    pub tool_calls: Vec<Value>,
}

impl Interaction {
    /// Creates an interaction with an explicit timestamp.
    pub fn new(timestamp: u64, operation: impl Into<String>, input: Value, output: Value) -> Self {
        Self {
            timestamp,
            operation: operation.into(),
            input,
            output,
            tool_calls: Vec::new(),
        }
    }
}

/// An agent conversation attached to a space.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    /// Optional display name.
    #[serde(default)]
    pub name: Option<String>,
    /// Id of the creator.
    #[serde(default)]
    pub created_by: String,
    /// Optional system instruction applied to the agent.
    #[serde(default)]
    pub system_instruction: Option<String>,
    /// Interactions in chronological order.
    #[serde(default)]
    pub interactions: Vec<Interaction>,
}

impl Conversation {
    /// Creates an empty conversation.
    pub fn new(created_by: impl Into<String>) -> Self {
        Self {
            name: None,
            created_by: created_by.into(),
            system_instruction: None,
            interactions: Vec::new(),
        }
    }

    /// Sets the display name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Portable dump of a space's objects and links.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpaceExport {
    /// Exported objects, links included in each entry.
    pub objects: BTreeMap<ObjectId, ObjectEntry>,
}

impl SpaceExport {
    /// All relation edges as `(from, relation, to)` triples. Order
    /// insensitive by construction.
    #[must_use]
    pub fn edges(&self) -> BTreeSet<(ObjectId, String, ObjectId)> {
        let mut edges = BTreeSet::new();
        for (from, entry) in &self.objects {
            for (relation, targets) in &entry.links {
                for to in targets {
                    edges.insert((from.clone(), relation.clone(), to.clone()));
                }
            }
        }
        edges
    }
}

/// The local mirror of one space's content.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpaceState {
    /// Server-confirmed document version.
    #[serde(default)]
    pub version: Version,
    /// Objects by id.
    #[serde(default)]
    pub objects: BTreeMap<ObjectId, ObjectEntry>,
    /// Space-level metadata, hidden from content consumers.
    #[serde(default)]
    pub meta: BTreeMap<String, Value>,
    /// Conversations by id.
    #[serde(default)]
    pub conversations: BTreeMap<ConversationId, Conversation>,
}

impl SpaceState {
    /// Creates an empty, never-synced state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up an object.
    #[must_use]
    pub fn object(&self, id: &ObjectId) -> Option<&ObjectEntry> {
        self.objects.get(id)
    }

    /// True if the object exists.
    #[must_use]
    pub fn contains_object(&self, id: &ObjectId) -> bool {
        self.objects.contains_key(id)
    }

    /// Number of objects.
    #[must_use]
    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    /// Inserts a new object. The entry's `data.id` is forced to match the
    /// key (set when absent, rejected when different).
    pub fn insert_object(&mut self, id: ObjectId, mut entry: ObjectEntry) -> CoreResult<()> {
        if self.objects.contains_key(&id) {
            return Err(CoreError::ObjectExists(id.to_string()));
        }
        match entry.data.get("id") {
            None => {
                entry
                    .data
                    .insert("id".to_string(), Value::String(id.to_string()));
            }
            Some(Value::String(existing)) if existing == id.as_str() => {}
            Some(_) => return Err(CoreError::ImmutableId(id.to_string())),
        }
        self.objects.insert(id, entry);
        Ok(())
    }

    /// Merges `fields` into an object's data and restamps it. The `id`
    /// field may be repeated but never changed.
    pub fn update_object_fields(
        &mut self,
        id: &ObjectId,
        fields: &Map<String, Value>,
        stamp: &AuditStamp,
    ) -> CoreResult<()> {
        if let Some(new_id) = fields.get("id") {
            if new_id != &Value::String(id.to_string()) {
                return Err(CoreError::ImmutableId(id.to_string()));
            }
        }
        let entry = self
            .objects
            .get_mut(id)
            .ok_or_else(|| CoreError::object_not_found(id.to_string()))?;
        for (key, value) in fields {
            entry.data.insert(key.clone(), value.clone());
        }
        entry.stamp(stamp);
        Ok(())
    }

    /// Removes objects, skipping ids that do not exist. Outbound links go
    /// with the entries; inbound links from survivors are left dangling and
    /// filtered on read. Returns the removed entries in input order.
    pub fn remove_objects(&mut self, ids: &[ObjectId]) -> Vec<(ObjectId, ObjectEntry)> {
        let mut removed = Vec::new();
        for id in ids {
            if let Some(entry) = self.objects.remove(id) {
                removed.push((id.clone(), entry));
            }
        }
        removed
    }

    /// Adds a relation edge. Idempotent: returns `false` when the edge was
    /// already present. The source object must exist; the target may
    /// dangle.
    pub fn link(
        &mut self,
        from: &ObjectId,
        relation: &str,
        to: &ObjectId,
        stamp: &AuditStamp,
    ) -> CoreResult<bool> {
        validate_relation(relation)?;
        let entry = self
            .objects
            .get_mut(from)
            .ok_or_else(|| CoreError::object_not_found(from.to_string()))?;
        let targets = entry.links.entry(relation.to_string()).or_default();
        if targets.contains(to) {
            return Ok(false);
        }
        targets.push(to.clone());
        entry.stamp(stamp);
        Ok(true)
    }

    /// Removes a relation edge. Returns `false` when the edge was not
    /// present. Empty relations are dropped from the table.
    pub fn unlink(
        &mut self,
        from: &ObjectId,
        relation: &str,
        to: &ObjectId,
        stamp: &AuditStamp,
    ) -> CoreResult<bool> {
        validate_relation(relation)?;
        let entry = self
            .objects
            .get_mut(from)
            .ok_or_else(|| CoreError::object_not_found(from.to_string()))?;
        let Some(targets) = entry.links.get_mut(relation) else {
            return Ok(false);
        };
        let before = targets.len();
        targets.retain(|t| t != to);
        let changed = targets.len() != before;
        if targets.is_empty() {
            entry.links.remove(relation);
        }
        if changed {
            entry.stamp(stamp);
        }
        Ok(changed)
    }

    /// Targets of one relation with dangling ids filtered out.
    #[must_use]
    pub fn links_of(&self, id: &ObjectId, relation: &str) -> Vec<ObjectId> {
        self.object(id).map_or_else(Vec::new, |entry| {
            entry
                .raw_targets(relation)
                .iter()
                .filter(|to| self.objects.contains_key(*to))
                .cloned()
                .collect()
        })
    }

    /// All relations of an object with dangling targets filtered out and
    /// empty relations omitted.
    #[must_use]
    pub fn links_table(&self, id: &ObjectId) -> BTreeMap<String, Vec<ObjectId>> {
        let Some(entry) = self.object(id) else {
            return BTreeMap::new();
        };
        let mut table = BTreeMap::new();
        for (relation, targets) in &entry.links {
            let live: Vec<ObjectId> = targets
                .iter()
                .filter(|to| self.objects.contains_key(*to))
                .cloned()
                .collect();
            if !live.is_empty() {
                table.insert(relation.clone(), live);
            }
        }
        table
    }

    /// Sets one metadata value.
    pub fn set_meta(&mut self, key: impl Into<String>, value: Value) {
        self.meta.insert(key.into(), value);
    }

    /// Removes one metadata value.
    pub fn remove_meta(&mut self, key: &str) -> Option<Value> {
        self.meta.remove(key)
    }

    /// Reads one metadata value.
    #[must_use]
    pub fn meta_value(&self, key: &str) -> Option<&Value> {
        self.meta.get(key)
    }

    /// Looks up a conversation.
    #[must_use]
    pub fn conversation(&self, id: &ConversationId) -> Option<&Conversation> {
        self.conversations.get(id)
    }

    /// Adds a conversation under a fresh id.
    pub fn create_conversation(
        &mut self,
        id: ConversationId,
        conversation: Conversation,
    ) -> CoreResult<()> {
        if self.conversations.contains_key(&id) {
            return Err(CoreError::ConversationExists(id.to_string()));
        }
        self.conversations.insert(id, conversation);
        Ok(())
    }

    /// Renames a conversation.
    pub fn rename_conversation(
        &mut self,
        id: &ConversationId,
        name: impl Into<String>,
    ) -> CoreResult<()> {
        let conversation = self
            .conversations
            .get_mut(id)
            .ok_or_else(|| CoreError::ConversationNotFound(id.to_string()))?;
        conversation.name = Some(name.into());
        Ok(())
    }

    /// Deletes a conversation, returning it.
    pub fn delete_conversation(&mut self, id: &ConversationId) -> CoreResult<Conversation> {
        self.conversations
            .remove(id)
            .ok_or_else(|| CoreError::ConversationNotFound(id.to_string()))
    }

    /// Appends an interaction to a conversation.
    pub fn append_interaction(
        &mut self,
        id: &ConversationId,
        interaction: Interaction,
    ) -> CoreResult<()> {
        let conversation = self
            .conversations
            .get_mut(id)
            .ok_or_else(|| CoreError::ConversationNotFound(id.to_string()))?;
        conversation.interactions.push(interaction);
        Ok(())
    }

    /// Sets or clears a conversation's system instruction.
    pub fn set_system_instruction(
        &mut self,
        id: &ConversationId,
        instruction: Option<String>,
    ) -> CoreResult<()> {
        let conversation = self
            .conversations
            .get_mut(id)
            .ok_or_else(|| CoreError::ConversationNotFound(id.to_string()))?;
        conversation.system_instruction = instruction;
        Ok(())
    }

    /// Dumps objects and links. Dangling link targets are filtered so the
    /// export is self-contained.
    #[must_use]
    pub fn export(&self) -> SpaceExport {
        let mut objects = BTreeMap::new();
        for (id, entry) in &self.objects {
            let mut copy = entry.clone();
            copy.links = self.links_table(id);
            objects.insert(id.clone(), copy);
        }
        SpaceExport { objects }
    }

    /// Loads an export produced by [`SpaceState::export`]. Ids colliding
    /// with existing objects abort the import before any change.
    pub fn import(&mut self, export: SpaceExport) -> CoreResult<()> {
        for id in export.objects.keys() {
            if self.objects.contains_key(id) {
                return Err(CoreError::Import(format!("object {id} already exists")));
            }
        }
        for (id, entry) in export.objects {
            self.insert_object(id, entry)?;
        }
        Ok(())
    }

    /// Serializes to the wire-shaped JSON value patches address.
    pub fn to_value(&self) -> CoreResult<Value> {
        serde_json::to_value(self).map_err(|e| CoreError::invalid_state(e.to_string()))
    }

    /// Rebuilds a state from its wire-shaped JSON value, normalizing links
    /// and checking id consistency.
    pub fn from_value(value: Value) -> CoreResult<Self> {
        let mut state: SpaceState =
            serde_json::from_value(value).map_err(|e| CoreError::invalid_state(e.to_string()))?;
        state.normalize();
        state.validate()?;
        Ok(state)
    }

    /// Restores link invariants: duplicate targets collapse to the first
    /// occurrence, empty relations are dropped.
    pub fn normalize(&mut self) {
        for entry in self.objects.values_mut() {
            for targets in entry.links.values_mut() {
                let mut seen = BTreeSet::new();
                targets.retain(|t| seen.insert(t.clone()));
            }
            entry.links.retain(|_, targets| !targets.is_empty());
        }
    }

    /// Checks that every object's `data.id` matches its key.
    pub fn validate(&self) -> CoreResult<()> {
        for (id, entry) in &self.objects {
            match entry.data.get("id") {
                Some(Value::String(data_id)) if data_id == id.as_str() => {}
                _ => {
                    return Err(CoreError::invalid_state(format!(
                        "object {id} data id mismatch"
                    )))
                }
            }
        }
        Ok(())
    }
}

/// Relation names must be non-empty.
fn validate_relation(relation: &str) -> CoreResult<()> {
    if relation.is_empty() {
        return Err(CoreError::InvalidRelation("empty relation name".into()));
    }
    Ok(())
}
