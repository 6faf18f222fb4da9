//! Reconciliation of server patches against the local document.
//!
//! Incoming patches are screened by their version anchor first: stale
//! patches are dropped, gapped patches are reported so the caller can
//! resync, and only the immediate successor applies. Before anything is
//! applied the patch is checked against the current document; a patch
//! whose every operation is already reflected locally is an echo of our
//! own write, and it advances the version without touching content or
//! producing notifications.
//!
//! Application itself is all-or-nothing against a scratch copy. One
//! deviation from strict RFC 6902: removing an already-absent path is
//! skipped instead of failing, so a delete echo arriving inside a mixed
//! patch cannot force a recovery cycle.

use crate::error::{CoreError, CoreResult};
use crate::notify::{derive_notifications, Notification};
use crate::state::SpaceState;
use crate::types::Version;
use serde_json::Value;
use tether_proto::{ChangeSource, Patch, PatchOp, Pointer};

/// What became of one incoming patch.
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    /// The patch targets a version at or below the local one; it was
    /// dropped without effect.
    AlreadyApplied {
        /// Version the patch would have produced.
        incoming: u64,
    },
    /// The patch applied (or was recognized as a pure echo).
    Applied {
        /// Successor state to swap in.
        state: SpaceState,
        /// False for a pure echo: the version advanced but no content
        /// moved and no notifications were produced.
        changed: bool,
        /// Object-level notifications derived from the applied change.
        notifications: Vec<Notification>,
    },
    /// The patch skips past the next expected version; intermediate
    /// patches were lost and the caller must resync.
    Gap {
        /// Local version at the time of the check.
        local: Version,
        /// Version the patch targets.
        incoming: u64,
    },
}

/// Applies one server patch against `current`, returning the outcome
/// without mutating `current`.
///
/// Errors mean the patch could not be applied cleanly (bad operation,
/// resulting document invalid). Callers treat errors like a gap: the
/// local mirror can no longer be trusted and needs a resync.
pub fn apply_patch(
    current: &SpaceState,
    patch: &Patch,
    source: ChangeSource,
) -> CoreResult<ApplyOutcome> {
    let target = match patch.version_target() {
        Some(incoming) => {
            if incoming <= current.version.as_u64() {
                return Ok(ApplyOutcome::AlreadyApplied { incoming });
            }
            if current.version.gapped_by(incoming) {
                return Ok(ApplyOutcome::Gap {
                    local: current.version,
                    incoming,
                });
            }
            Version::new(incoming)
        }
        // Version-less patches mutate content without advancing the anchor.
        None => current.version,
    };

    let before = current.to_value()?;
    let changed = patch
        .iter()
        .any(|op| !op.is_version_op() && op_changes(op, &before));

    if !changed {
        let mut state = current.clone();
        state.version = target;
        return Ok(ApplyOutcome::Applied {
            state,
            changed: false,
            notifications: Vec::new(),
        });
    }

    let mut scratch = before.clone();
    for (index, op) in patch.iter().enumerate() {
        if let PatchOp::Remove { path } = op {
            if path.resolve(&scratch).is_none() {
                tracing::debug!(path = %path, "skipping remove of absent path");
                continue;
            }
        }
        op.apply(&mut scratch)
            .map_err(|e| CoreError::patch_apply(format!("op {index} at {}: {e}", op.path())))?;
    }

    let notifications = derive_notifications(patch, &before, &scratch, source);
    let mut state = SpaceState::from_value(scratch)?;
    state.version = target;

    Ok(ApplyOutcome::Applied {
        state,
        changed: true,
        notifications,
    })
}

/// True if applying `op` would alter the document. Version-anchor ops are
/// screened out by the caller; `test` assertions never count as changes.
fn op_changes(op: &PatchOp, root: &Value) -> bool {
    match op {
        PatchOp::Add { path, value } => add_changes(path, value, root),
        PatchOp::Remove { path } => path.resolve(root).is_some(),
        PatchOp::Replace { path, value } => path.resolve(root) != Some(value),
        PatchOp::Move { from, path } => from != path,
        PatchOp::Copy { from, path } => match from.resolve(root) {
            Some(source) => add_changes(path, source, root),
            None => true,
        },
        PatchOp::Test { .. } => false,
    }
}

/// Change check for add-like placement of `value` at `path`.
///
/// Appends to an array that already holds the value are the signature of
/// a link echo and count as no change. Positional array inserts always
/// shift elements, so they always count.
fn add_changes(path: &Pointer, value: &Value, root: &Value) -> bool {
    if path.is_root() {
        return root != value;
    }
    let Some(parent) = path.parent() else {
        return true;
    };
    match parent.resolve(root) {
        Some(Value::Array(items)) => {
            if path.is_append() {
                !items.contains(value)
            } else {
                true
            }
        }
        Some(Value::Object(_)) => path.resolve(root) != Some(value),
        _ => true,
    }
}
