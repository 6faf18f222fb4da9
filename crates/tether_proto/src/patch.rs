//! Incremental patches over a space document.
//!
//! A patch is an ordered batch of operations in the RFC 6902 wire shape
//! (`{op, path, value?, from?}`). Servers stamp each content patch with a
//! `replace` (or `add`) of the top-level `/version` pointer; that update is
//! the reconciliation anchor clients order patches by.

use crate::error::{ProtoError, ProtoResult};
use crate::pointer::Pointer;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Pointer string of the version anchor.
pub const VERSION_POINTER: &str = "/version";

/// A single patch operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOp {
    /// Creates or replaces an object member, or inserts into an array.
    Add {
        /// Target location.
        path: Pointer,
        /// Value to add.
        value: Value,
    },
    /// Removes the value at an existing location.
    Remove {
        /// Target location.
        path: Pointer,
    },
    /// Replaces the value at an existing location.
    Replace {
        /// Target location.
        path: Pointer,
        /// Replacement value.
        value: Value,
    },
    /// Moves the value at `from` to `path`.
    Move {
        /// Source location.
        from: Pointer,
        /// Target location.
        path: Pointer,
    },
    /// Copies the value at `from` to `path`.
    Copy {
        /// Source location.
        from: Pointer,
        /// Target location.
        path: Pointer,
    },
    /// Asserts that the value at `path` equals `value`.
    Test {
        /// Target location.
        path: Pointer,
        /// Expected value.
        value: Value,
    },
}

impl PatchOp {
    /// Creates an add operation.
    pub fn add(path: Pointer, value: impl Into<Value>) -> Self {
        Self::Add {
            path,
            value: value.into(),
        }
    }

    /// Creates a remove operation.
    pub fn remove(path: Pointer) -> Self {
        Self::Remove { path }
    }

    /// Creates a replace operation.
    pub fn replace(path: Pointer, value: impl Into<Value>) -> Self {
        Self::Replace {
            path,
            value: value.into(),
        }
    }

    /// Creates a move operation.
    pub fn mv(from: Pointer, path: Pointer) -> Self {
        Self::Move { from, path }
    }

    /// Creates a copy operation.
    pub fn copy(from: Pointer, path: Pointer) -> Self {
        Self::Copy { from, path }
    }

    /// Creates a test operation.
    pub fn test(path: Pointer, value: impl Into<Value>) -> Self {
        Self::Test {
            path,
            value: value.into(),
        }
    }

    /// The operation's target pointer.
    #[must_use]
    pub fn path(&self) -> &Pointer {
        match self {
            Self::Add { path, .. }
            | Self::Remove { path }
            | Self::Replace { path, .. }
            | Self::Move { path, .. }
            | Self::Copy { path, .. }
            | Self::Test { path, .. } => path,
        }
    }

    /// The carried value, for operations that have one.
    #[must_use]
    pub fn value(&self) -> Option<&Value> {
        match self {
            Self::Add { value, .. } | Self::Replace { value, .. } | Self::Test { value, .. } => {
                Some(value)
            }
            _ => None,
        }
    }

    /// True if this operation targets the version anchor.
    #[must_use]
    pub fn is_version_op(&self) -> bool {
        self.path().segments() == ["version"]
    }

    /// Applies the operation to `root` with strict RFC 6902 semantics.
    pub fn apply(&self, root: &mut Value) -> ProtoResult<()> {
        match self {
            Self::Add { path, value } => path.add(root, value.clone()),
            Self::Remove { path } => path.remove(root).map(|_| ()),
            Self::Replace { path, value } => path.replace(root, value.clone()).map(|_| ()),
            Self::Move { from, path } => {
                if from == path {
                    return Ok(());
                }
                let moved = from.remove(root)?;
                path.add(root, moved)
            }
            Self::Copy { from, path } => {
                let copied = from
                    .resolve(root)
                    .cloned()
                    .ok_or_else(|| ProtoError::path_not_found(from.to_string()))?;
                path.add(root, copied)
            }
            Self::Test { path, value } => match path.resolve(root) {
                Some(current) if current == value => Ok(()),
                _ => Err(ProtoError::TestFailed {
                    path: path.to_string(),
                }),
            },
        }
    }
}

/// An ordered batch of patch operations. On the wire this is a JSON array.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Patch {
    /// Operations in application order.
    pub ops: Vec<PatchOp>,
}

impl Patch {
    /// Creates a patch from operations.
    pub fn new(ops: Vec<PatchOp>) -> Self {
        Self { ops }
    }

    /// Number of operations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// True if the patch carries no operations.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Iterates the operations in order.
    pub fn iter(&self) -> std::slice::Iter<'_, PatchOp> {
        self.ops.iter()
    }

    /// Extracts the version this patch advances the document to, if it
    /// carries a version anchor (an `add` or `replace` of `/version` with an
    /// unsigned integer value).
    #[must_use]
    pub fn version_target(&self) -> Option<u64> {
        self.ops.iter().find_map(|op| match op {
            PatchOp::Add { path, value } | PatchOp::Replace { path, value }
                if path.segments() == ["version"] =>
            {
                value.as_u64()
            }
            _ => None,
        })
    }

    /// Applies every operation in order, strictly. Stops at the first
    /// failure, leaving `root` partially modified; callers that need
    /// all-or-nothing behavior apply against a scratch copy.
    pub fn apply_all(&self, root: &mut Value) -> ProtoResult<()> {
        for op in &self.ops {
            op.apply(root)?;
        }
        Ok(())
    }
}

impl FromIterator<PatchOp> for Patch {
    fn from_iter<I: IntoIterator<Item = PatchOp>>(iter: I) -> Self {
        Self {
            ops: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a Patch {
    type Item = &'a PatchOp;
    type IntoIter = std::slice::Iter<'a, PatchOp>;

    fn into_iter(self) -> Self::IntoIter {
        self.ops.iter()
    }
}
