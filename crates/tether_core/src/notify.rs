//! Change notifications and their derivation from applied patches.
//!
//! Local mutations know exactly what they changed and build notifications
//! directly. Remote patches only carry paths, so [`derive_notifications`]
//! reconstructs object-level meaning by diffing the document before and
//! after application. Derivation is per patch: one logical change never
//! produces duplicate notifications, and a pure version bump produces
//! none.

use crate::types::{ConversationId, ObjectId};
use serde_json::Value;
use std::collections::BTreeSet;
use tether_proto::{ChangeSource, Patch, PatchOp, Pointer};

/// Something observable happened to the space.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// An object appeared.
    ObjectCreated {
        /// Created object.
        id: ObjectId,
        /// Who caused it.
        source: ChangeSource,
    },
    /// An object's data changed.
    ObjectUpdated {
        /// Updated object.
        id: ObjectId,
        /// Who caused it.
        source: ChangeSource,
    },
    /// An object disappeared.
    ObjectDeleted {
        /// Deleted object.
        id: ObjectId,
        /// Who caused it.
        source: ChangeSource,
    },
    /// A relation edge was added.
    Linked {
        /// Source object.
        from: ObjectId,
        /// Relation name.
        relation: String,
        /// Target object.
        to: ObjectId,
        /// Who caused it.
        source: ChangeSource,
    },
    /// A relation edge was removed.
    Unlinked {
        /// Source object.
        from: ObjectId,
        /// Relation name.
        relation: String,
        /// Target object.
        to: ObjectId,
        /// Who caused it.
        source: ChangeSource,
    },
    /// A relation changed in a way not broken down per edge. Consumers
    /// re-read the relation.
    LinksChanged {
        /// Source object.
        from: ObjectId,
        /// Relation name.
        relation: String,
        /// Who caused it.
        source: ChangeSource,
    },
    /// A metadata value changed.
    MetaChanged {
        /// Metadata key.
        key: String,
        /// Who caused it.
        source: ChangeSource,
    },
    /// Conversations were added, removed, or renamed.
    ConversationListChanged {
        /// Who caused it.
        source: ChangeSource,
    },
    /// A conversation's content changed.
    ConversationChanged {
        /// Affected conversation.
        id: ConversationId,
        /// Who caused it.
        source: ChangeSource,
    },
    /// The whole local state was replaced; re-read everything.
    FullReset {
        /// Who caused it.
        source: ChangeSource,
    },
    /// Synchronization hit an error; the engine is recovering.
    SyncError {
        /// Human-readable cause.
        message: String,
    },
}

impl Notification {
    /// The subscription key for this notification.
    #[must_use]
    pub fn kind(&self) -> NotificationKind {
        match self {
            Notification::ObjectCreated { .. } => NotificationKind::ObjectCreated,
            Notification::ObjectUpdated { .. } => NotificationKind::ObjectUpdated,
            Notification::ObjectDeleted { .. } => NotificationKind::ObjectDeleted,
            Notification::Linked { .. } => NotificationKind::Linked,
            Notification::Unlinked { .. } => NotificationKind::Unlinked,
            Notification::LinksChanged { .. } => NotificationKind::LinksChanged,
            Notification::MetaChanged { .. } => NotificationKind::MetaChanged,
            Notification::ConversationListChanged { .. } => {
                NotificationKind::ConversationListChanged
            }
            Notification::ConversationChanged { .. } => NotificationKind::ConversationChanged,
            Notification::FullReset { .. } => NotificationKind::FullReset,
            Notification::SyncError { .. } => NotificationKind::SyncError,
        }
    }
}

/// Fieldless notification discriminant, used as a subscription key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NotificationKind {
    /// See [`Notification::ObjectCreated`].
    ObjectCreated,
    /// See [`Notification::ObjectUpdated`].
    ObjectUpdated,
    /// See [`Notification::ObjectDeleted`].
    ObjectDeleted,
    /// See [`Notification::Linked`].
    Linked,
    /// See [`Notification::Unlinked`].
    Unlinked,
    /// See [`Notification::LinksChanged`].
    LinksChanged,
    /// See [`Notification::MetaChanged`].
    MetaChanged,
    /// See [`Notification::ConversationListChanged`].
    ConversationListChanged,
    /// See [`Notification::ConversationChanged`].
    ConversationChanged,
    /// See [`Notification::FullReset`].
    FullReset,
    /// See [`Notification::SyncError`].
    SyncError,
}

impl std::fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            NotificationKind::ObjectCreated => "object_created",
            NotificationKind::ObjectUpdated => "object_updated",
            NotificationKind::ObjectDeleted => "object_deleted",
            NotificationKind::Linked => "linked",
            NotificationKind::Unlinked => "unlinked",
            NotificationKind::LinksChanged => "links_changed",
            NotificationKind::MetaChanged => "meta_changed",
            NotificationKind::ConversationListChanged => "conversation_list_changed",
            NotificationKind::ConversationChanged => "conversation_changed",
            NotificationKind::FullReset => "full_reset",
            NotificationKind::SyncError => "sync_error",
        };
        f.write_str(name)
    }
}

/// Tracks what has already been emitted for one patch so repeated ops on
/// the same target collapse into one notification.
#[derive(Default)]
struct Dedup {
    created: BTreeSet<ObjectId>,
    updated: BTreeSet<ObjectId>,
    deleted: BTreeSet<ObjectId>,
    relations: BTreeSet<(ObjectId, String)>,
    meta: BTreeSet<String>,
    conversations: BTreeSet<ConversationId>,
    list_changed: bool,
    full_reset: bool,
}

/// Derives object-level notifications for a patch applied between two
/// document snapshots.
pub fn derive_notifications(
    patch: &Patch,
    before: &Value,
    after: &Value,
    source: ChangeSource,
) -> Vec<Notification> {
    let mut out = Vec::new();
    let mut seen = Dedup::default();
    for op in patch.iter() {
        for pointer in touched_paths(op) {
            describe_path(pointer, before, after, source, &mut seen, &mut out);
        }
    }
    out
}

/// Paths an op can affect. `move` touches both ends.
fn touched_paths(op: &PatchOp) -> Vec<&Pointer> {
    match op {
        PatchOp::Move { from, path } => vec![from, path],
        PatchOp::Add { path, .. }
        | PatchOp::Remove { path }
        | PatchOp::Replace { path, .. }
        | PatchOp::Copy { path, .. }
        | PatchOp::Test { path, .. } => vec![path],
    }
}

fn describe_path(
    pointer: &Pointer,
    before: &Value,
    after: &Value,
    source: ChangeSource,
    seen: &mut Dedup,
    out: &mut Vec<Notification>,
) {
    let segments = pointer.segments();
    match segments.first().map(String::as_str) {
        Some("version") => {}
        Some("objects") => describe_object_path(&segments[1..], before, after, source, seen, out),
        Some("meta") => {
            if let Some(key) = segments.get(1) {
                if seen.meta.insert(key.clone()) {
                    out.push(Notification::MetaChanged {
                        key: key.clone(),
                        source,
                    });
                }
            }
        }
        Some("conversations") => {
            describe_conversation_path(&segments[1..], source, seen, out);
        }
        Some(other) => {
            tracing::debug!(segment = other, "patch touched unknown top-level path");
        }
        // A root-level replace swaps the whole document.
        None => {
            if !seen.full_reset {
                seen.full_reset = true;
                out.push(Notification::FullReset { source });
            }
        }
    }
}

fn describe_object_path(
    rest: &[String],
    before: &Value,
    after: &Value,
    source: ChangeSource,
    seen: &mut Dedup,
    out: &mut Vec<Notification>,
) {
    let Some(raw_id) = rest.first() else {
        // The whole object table changed; diff by id.
        diff_object_tables(before, after, source, seen, out);
        return;
    };
    let Ok(id) = ObjectId::parse(raw_id) else {
        tracing::warn!(id = %raw_id, "patch addressed an invalid object id");
        return;
    };
    if seen.deleted.contains(&id) {
        return;
    }

    let existed = object_value(before, &id).is_some();
    let exists = object_value(after, &id).is_some();

    match (existed, exists) {
        (false, true) => {
            if seen.created.insert(id.clone()) {
                out.push(Notification::ObjectCreated { id, source });
            }
        }
        (true, false) => {
            emit_outbound_unlinks(before, &id, source, out);
            seen.deleted.insert(id.clone());
            out.push(Notification::ObjectDeleted { id, source });
        }
        (true, true) => match rest.get(1).map(String::as_str) {
            Some("links") => {
                diff_relations(before, after, &id, rest.get(2), source, seen, out);
            }
            // Data edits, audit restamps, or a whole-entry replace.
            _ => {
                if !seen.created.contains(&id) && seen.updated.insert(id.clone()) {
                    out.push(Notification::ObjectUpdated { id, source });
                }
            }
        },
        (false, false) => {}
    }
}

/// Emits one `Unlinked` per live outbound edge of an object about to be
/// reported deleted. Dangling targets are skipped, matching the read API.
fn emit_outbound_unlinks(
    before: &Value,
    id: &ObjectId,
    source: ChangeSource,
    out: &mut Vec<Notification>,
) {
    for (relation, targets) in relations_of(before, id) {
        for to in targets {
            if object_value(before, &to).is_some() {
                out.push(Notification::Unlinked {
                    from: id.clone(),
                    relation: relation.clone(),
                    to,
                    source,
                });
            }
        }
    }
}

/// Diffs one relation (or all relations of an object) between snapshots.
/// Added targets are reported edge by edge; removals collapse into a
/// single `LinksChanged` per relation.
fn diff_relations(
    before: &Value,
    after: &Value,
    id: &ObjectId,
    relation: Option<&String>,
    source: ChangeSource,
    seen: &mut Dedup,
    out: &mut Vec<Notification>,
) {
    let mut names = BTreeSet::new();
    match relation {
        Some(name) => {
            names.insert(name.clone());
        }
        None => {
            names.extend(relations_of(before, id).into_iter().map(|(n, _)| n));
            names.extend(relations_of(after, id).into_iter().map(|(n, _)| n));
        }
    }

    for name in names {
        if !seen.relations.insert((id.clone(), name.clone())) {
            continue;
        }
        let old: BTreeSet<ObjectId> = targets_of(before, id, &name).into_iter().collect();
        let new_order = targets_of(after, id, &name);
        let new: BTreeSet<ObjectId> = new_order.iter().cloned().collect();

        for to in &new_order {
            if !old.contains(to) {
                out.push(Notification::Linked {
                    from: id.clone(),
                    relation: name.clone(),
                    to: to.clone(),
                    source,
                });
            }
        }
        if old.difference(&new).next().is_some() {
            out.push(Notification::LinksChanged {
                from: id.clone(),
                relation: name,
                source,
            });
        }
    }
}

fn describe_conversation_path(
    rest: &[String],
    source: ChangeSource,
    seen: &mut Dedup,
    out: &mut Vec<Notification>,
) {
    let list_changed = match rest {
        // The table itself, one entry, or a rename: all surface in lists.
        [] | [_] => true,
        [_, field] if field == "name" => true,
        _ => false,
    };
    if list_changed {
        if !seen.list_changed {
            seen.list_changed = true;
            out.push(Notification::ConversationListChanged { source });
        }
        return;
    }
    let id = ConversationId::new(rest[0].clone());
    if seen.conversations.insert(id.clone()) {
        out.push(Notification::ConversationChanged { id, source });
    }
}

/// Whole-table diff for the rare patch that replaces `/objects` outright.
fn diff_object_tables(
    before: &Value,
    after: &Value,
    source: ChangeSource,
    seen: &mut Dedup,
    out: &mut Vec<Notification>,
) {
    let old_ids = object_ids(before);
    let new_ids = object_ids(after);
    for id in old_ids.union(&new_ids) {
        let in_both = old_ids.contains(id) && new_ids.contains(id);
        if in_both && object_value(before, id) == object_value(after, id) {
            continue;
        }
        let path = vec![id.to_string()];
        describe_object_path(&path, before, after, source, seen, out);
    }
}

fn object_value<'a>(root: &'a Value, id: &ObjectId) -> Option<&'a Value> {
    root.get("objects")?.get(id.as_str())
}

fn object_ids(root: &Value) -> BTreeSet<ObjectId> {
    root.get("objects")
        .and_then(Value::as_object)
        .map(|table| table.keys().filter_map(|k| ObjectId::parse(k).ok()).collect())
        .unwrap_or_default()
}

fn relations_of(root: &Value, id: &ObjectId) -> Vec<(String, Vec<ObjectId>)> {
    let Some(links) = object_value(root, id).and_then(|o| o.get("links")).and_then(Value::as_object)
    else {
        return Vec::new();
    };
    links
        .iter()
        .map(|(name, _)| (name.clone(), targets_of(root, id, name)))
        .collect()
}

fn targets_of(root: &Value, id: &ObjectId, relation: &str) -> Vec<ObjectId> {
    object_value(root, id)
        .and_then(|o| o.get("links"))
        .and_then(|l| l.get(relation))
        .and_then(Value::as_array)
        .map(|targets| {
            targets
                .iter()
                .filter_map(Value::as_str)
                .filter_map(|s| ObjectId::parse(s).ok())
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{AuditStamp, ObjectEntry, SpaceState};
    use serde_json::{json, Map};
    use tether_proto::Pointer;

    fn oid(s: &str) -> ObjectId {
        ObjectId::parse(s).unwrap()
    }

    fn state_with(ids: &[&str]) -> SpaceState {
        let mut state = SpaceState::new();
        for id in ids {
            let mut data = Map::new();
            data.insert("id".into(), json!(id));
            state
                .insert_object(oid(id), ObjectEntry::new(data))
                .unwrap();
        }
        state
    }

    fn ptr(s: &str) -> Pointer {
        Pointer::parse(s).unwrap()
    }

    fn derive(patch: Patch, before: &SpaceState, after: &SpaceState) -> Vec<Notification> {
        derive_notifications(
            &patch,
            &before.to_value().unwrap(),
            &after.to_value().unwrap(),
            ChangeSource::RemoteUser,
        )
    }

    #[test]
    fn add_of_new_object_is_created() {
        let before = state_with(&[]);
        let after = state_with(&["a"]);
        let patch = Patch::new(vec![PatchOp::add(ptr("/objects/a"), json!({}))]);
        let notes = derive(patch, &before, &after);
        assert_eq!(
            notes,
            vec![Notification::ObjectCreated {
                id: oid("a"),
                source: ChangeSource::RemoteUser
            }]
        );
    }

    #[test]
    fn data_edits_dedup_to_one_update() {
        let before = state_with(&["a"]);
        let mut after = before.clone();
        let mut fields = Map::new();
        fields.insert("x".into(), json!(1));
        fields.insert("y".into(), json!(2));
        after
            .update_object_fields(&oid("a"), &fields, &AuditStamp::new(5, None, None))
            .unwrap();

        let patch = Patch::new(vec![
            PatchOp::add(ptr("/objects/a/data/x"), json!(1)),
            PatchOp::add(ptr("/objects/a/data/y"), json!(2)),
            PatchOp::replace(ptr("/objects/a/updatedAt"), json!(5)),
        ]);
        let notes = derive(patch, &before, &after);
        assert_eq!(notes.len(), 1);
        assert!(matches!(notes[0], Notification::ObjectUpdated { .. }));
    }

    #[test]
    fn delete_reports_unlinks_then_deleted() {
        let stamp = AuditStamp::new(1, None, None);
        let mut before = state_with(&["a", "b", "c"]);
        before.link(&oid("a"), "refs", &oid("b"), &stamp).unwrap();
        before.link(&oid("a"), "refs", &oid("c"), &stamp).unwrap();
        let mut after = before.clone();
        after.remove_objects(&[oid("a")]);

        let patch = Patch::new(vec![PatchOp::remove(ptr("/objects/a"))]);
        let notes = derive(patch, &before, &after);
        assert_eq!(notes.len(), 3);
        assert!(matches!(&notes[0], Notification::Unlinked { to, .. } if *to == oid("b")));
        assert!(matches!(&notes[1], Notification::Unlinked { to, .. } if *to == oid("c")));
        assert!(matches!(&notes[2], Notification::ObjectDeleted { id, .. } if *id == oid("a")));
    }

    #[test]
    fn delete_skips_dangling_unlinks() {
        let stamp = AuditStamp::new(1, None, None);
        let mut before = state_with(&["a", "b"]);
        before.link(&oid("a"), "refs", &oid("b"), &stamp).unwrap();
        before.remove_objects(&[oid("b")]);
        let mut after = before.clone();
        after.remove_objects(&[oid("a")]);

        let patch = Patch::new(vec![PatchOp::remove(ptr("/objects/a"))]);
        let notes = derive(patch, &before, &after);
        assert_eq!(
            notes,
            vec![Notification::ObjectDeleted {
                id: oid("a"),
                source: ChangeSource::RemoteUser
            }]
        );
    }

    #[test]
    fn link_append_is_precise() {
        let stamp = AuditStamp::new(1, None, None);
        let before = state_with(&["a", "b"]);
        let mut after = before.clone();
        after.link(&oid("a"), "refs", &oid("b"), &stamp).unwrap();

        let patch = Patch::new(vec![PatchOp::add(ptr("/objects/a/links/refs"), json!(["b"]))]);
        let notes = derive(patch, &before, &after);
        assert_eq!(
            notes,
            vec![Notification::Linked {
                from: oid("a"),
                relation: "refs".into(),
                to: oid("b"),
                source: ChangeSource::RemoteUser
            }]
        );
    }

    #[test]
    fn link_removal_is_coarse() {
        let stamp = AuditStamp::new(1, None, None);
        let mut before = state_with(&["a", "b", "c"]);
        before.link(&oid("a"), "refs", &oid("b"), &stamp).unwrap();
        before.link(&oid("a"), "refs", &oid("c"), &stamp).unwrap();
        let mut after = before.clone();
        after.unlink(&oid("a"), "refs", &oid("b"), &stamp).unwrap();

        let patch = Patch::new(vec![PatchOp::replace(
            ptr("/objects/a/links/refs"),
            json!(["c"]),
        )]);
        let notes = derive(patch, &before, &after);
        assert_eq!(
            notes,
            vec![Notification::LinksChanged {
                from: oid("a"),
                relation: "refs".into(),
                source: ChangeSource::RemoteUser
            }]
        );
    }

    #[test]
    fn version_only_patch_is_silent() {
        let mut before = state_with(&["a"]);
        before.version = crate::types::Version::new(4);
        let mut after = before.clone();
        after.version = crate::types::Version::new(5);

        let patch = Patch::new(vec![PatchOp::replace(ptr("/version"), json!(5))]);
        assert!(derive(patch, &before, &after).is_empty());
    }

    #[test]
    fn meta_changes_dedup_by_key() {
        let before = state_with(&[]);
        let mut after = before.clone();
        after.set_meta("theme", json!("dark"));

        let patch = Patch::new(vec![
            PatchOp::add(ptr("/meta/theme"), json!("light")),
            PatchOp::replace(ptr("/meta/theme"), json!("dark")),
        ]);
        let notes = derive(patch, &before, &after);
        assert_eq!(
            notes,
            vec![Notification::MetaChanged {
                key: "theme".into(),
                source: ChangeSource::RemoteUser
            }]
        );
    }

    #[test]
    fn conversation_rename_surfaces_in_list() {
        let before = state_with(&[]);
        let after = before.clone();
        let patch = Patch::new(vec![PatchOp::replace(
            ptr("/conversations/c1/name"),
            json!("New name"),
        )]);
        let notes = derive(patch, &before, &after);
        assert_eq!(
            notes,
            vec![Notification::ConversationListChanged {
                source: ChangeSource::RemoteUser
            }]
        );
    }

    #[test]
    fn conversation_content_targets_the_conversation() {
        let before = state_with(&[]);
        let after = before.clone();
        let patch = Patch::new(vec![
            PatchOp::add(ptr("/conversations/c1/interactions/-"), json!({})),
            PatchOp::replace(ptr("/conversations/c1/systemInstruction"), json!("short")),
        ]);
        let notes = derive(patch, &before, &after);
        assert_eq!(
            notes,
            vec![Notification::ConversationChanged {
                id: ConversationId::new("c1"),
                source: ChangeSource::RemoteUser
            }]
        );
    }

    #[test]
    fn created_absorbs_follow_up_edits() {
        let before = state_with(&[]);
        let after = state_with(&["a"]);
        let patch = Patch::new(vec![
            PatchOp::add(ptr("/objects/a"), json!({})),
            PatchOp::add(ptr("/objects/a/data/x"), json!(1)),
        ]);
        let notes = derive(patch, &before, &after);
        assert_eq!(notes.len(), 1);
        assert!(matches!(notes[0], Notification::ObjectCreated { .. }));
    }

    #[test]
    fn kind_display_names() {
        assert_eq!(NotificationKind::ObjectCreated.to_string(), "object_created");
        assert_eq!(NotificationKind::SyncError.to_string(), "sync_error");
    }
}
