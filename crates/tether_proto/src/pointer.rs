//! Slash-separated paths into a JSON document.
//!
//! Pointers follow the RFC 6901 syntax: `""` is the document root, every
//! other pointer starts with `/`, and segment text escapes `~` as `~0` and
//! `/` as `~1`. Resolution and mutation work on `serde_json::Value` trees
//! with RFC 6902 semantics (`add` upserts object members and inserts into
//! arrays, `-` appends).

use crate::error::{ProtoError, ProtoResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Array-append segment (`/-`).
const APPEND: &str = "-";

/// A parsed JSON pointer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Pointer {
    segments: Vec<String>,
}

impl Pointer {
    /// The root pointer (`""`), addressing the whole document.
    pub fn root() -> Self {
        Self {
            segments: Vec::new(),
        }
    }

    /// Parses a pointer from its string form.
    pub fn parse(raw: &str) -> ProtoResult<Self> {
        if raw.is_empty() {
            return Ok(Self::root());
        }
        if !raw.starts_with('/') {
            return Err(ProtoError::invalid_pointer(format!(
                "pointer must start with '/': {raw}"
            )));
        }
        let mut segments = Vec::new();
        for part in raw[1..].split('/') {
            segments.push(unescape(part)?);
        }
        Ok(Self { segments })
    }

    /// Builds a pointer from already-unescaped segments.
    pub fn from_segments(segments: Vec<String>) -> Self {
        Self { segments }
    }

    /// Returns the unescaped segments.
    #[must_use]
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// True if this is the root pointer.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// Number of segments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// True if the pointer has no segments.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Returns the segment at `index`, if present.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&str> {
        self.segments.get(index).map(String::as_str)
    }

    /// Returns the final segment, if any.
    #[must_use]
    pub fn last(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    /// Returns a new pointer with `segment` appended.
    #[must_use]
    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.segments.clone();
        segments.push(segment.into());
        Self { segments }
    }

    /// Returns the parent pointer, or `None` for the root.
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        if self.segments.is_empty() {
            return None;
        }
        Some(Self {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    /// True if the pointer's leading segments equal `prefix`.
    #[must_use]
    pub fn starts_with(&self, prefix: &[&str]) -> bool {
        self.segments.len() >= prefix.len()
            && self.segments.iter().zip(prefix).all(|(s, p)| s == p)
    }

    /// True if the final segment is the array-append marker.
    #[must_use]
    pub fn is_append(&self) -> bool {
        self.last() == Some(APPEND)
    }

    /// Resolves the pointer against `root`, returning the addressed value.
    #[must_use]
    pub fn resolve<'a>(&self, root: &'a Value) -> Option<&'a Value> {
        let mut current = root;
        for segment in &self.segments {
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(array_index(segment)?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Adds `value` at the pointer location.
    ///
    /// Object members are created or replaced; array segments insert before
    /// the index, with `-` appending. The parent location must exist.
    pub fn add(&self, root: &mut Value, value: Value) -> ProtoResult<()> {
        if self.is_root() {
            *root = value;
            return Ok(());
        }
        let (parent, leaf) = self.descend_to_parent(root)?;
        match parent {
            Value::Object(map) => {
                map.insert(leaf.to_string(), value);
                Ok(())
            }
            Value::Array(items) => {
                if leaf == APPEND {
                    items.push(value);
                    return Ok(());
                }
                let index = array_index(leaf).ok_or_else(|| {
                    ProtoError::invalid_operation(format!("bad array index '{leaf}' in {self}"))
                })?;
                if index > items.len() {
                    return Err(ProtoError::invalid_operation(format!(
                        "index {index} out of bounds in {self}"
                    )));
                }
                items.insert(index, value);
                Ok(())
            }
            _ => Err(ProtoError::invalid_operation(format!(
                "cannot add into a scalar at {self}"
            ))),
        }
    }

    /// Replaces the existing value at the pointer location, returning the
    /// previous value. The location must exist.
    pub fn replace(&self, root: &mut Value, value: Value) -> ProtoResult<Value> {
        if self.is_root() {
            return Ok(std::mem::replace(root, value));
        }
        let (parent, leaf) = self.descend_to_parent(root)?;
        match parent {
            Value::Object(map) => match map.get_mut(leaf) {
                Some(slot) => Ok(std::mem::replace(slot, value)),
                None => Err(ProtoError::path_not_found(self.to_string())),
            },
            Value::Array(items) => {
                let index = array_index(leaf)
                    .ok_or_else(|| ProtoError::path_not_found(self.to_string()))?;
                match items.get_mut(index) {
                    Some(slot) => Ok(std::mem::replace(slot, value)),
                    None => Err(ProtoError::path_not_found(self.to_string())),
                }
            }
            _ => Err(ProtoError::path_not_found(self.to_string())),
        }
    }

    /// Removes and returns the value at the pointer location, which must
    /// exist.
    pub fn remove(&self, root: &mut Value) -> ProtoResult<Value> {
        if self.is_root() {
            return Err(ProtoError::invalid_operation(
                "cannot remove the document root",
            ));
        }
        let pointer = self.to_string();
        let (parent, leaf) = self.descend_to_parent(root)?;
        match parent {
            Value::Object(map) => map
                .remove(leaf)
                .ok_or_else(|| ProtoError::path_not_found(pointer)),
            Value::Array(items) => {
                let index = array_index(leaf)
                    .ok_or_else(|| ProtoError::path_not_found(pointer.clone()))?;
                if index >= items.len() {
                    return Err(ProtoError::path_not_found(pointer));
                }
                Ok(items.remove(index))
            }
            _ => Err(ProtoError::path_not_found(pointer)),
        }
    }

    /// Walks to the parent container of the addressed location.
    fn descend_to_parent<'a>(&self, root: &'a mut Value) -> ProtoResult<(&'a mut Value, &str)> {
        let (leaf, inner) = self
            .segments
            .split_last()
            .ok_or_else(|| ProtoError::invalid_operation("root pointer has no parent"))?;
        let mut current = root;
        for segment in inner {
            current = match current {
                Value::Object(map) => map
                    .get_mut(segment)
                    .ok_or_else(|| ProtoError::path_not_found(self.to_string()))?,
                Value::Array(items) => {
                    let index = array_index(segment)
                        .ok_or_else(|| ProtoError::path_not_found(self.to_string()))?;
                    items
                        .get_mut(index)
                        .ok_or_else(|| ProtoError::path_not_found(self.to_string()))?
                }
                _ => return Err(ProtoError::path_not_found(self.to_string())),
            };
        }
        Ok((current, leaf))
    }
}

impl fmt::Display for Pointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for segment in &self.segments {
            write!(f, "/{}", escape(segment))?;
        }
        Ok(())
    }
}

impl TryFrom<String> for Pointer {
    type Error = ProtoError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Self::parse(&raw)
    }
}

impl From<Pointer> for String {
    fn from(pointer: Pointer) -> Self {
        pointer.to_string()
    }
}

/// Interprets `segment` as an array index. `-` is not an index and leading
/// zeros are rejected per RFC 6901. Bounds are the caller's concern.
fn array_index(segment: &str) -> Option<usize> {
    if segment == APPEND {
        return None;
    }
    if segment.len() > 1 && segment.starts_with('0') {
        return None;
    }
    segment.parse().ok()
}

fn escape(segment: &str) -> String {
    segment.replace('~', "~0").replace('/', "~1")
}

fn unescape(segment: &str) -> ProtoResult<String> {
    let mut out = String::with_capacity(segment.len());
    let mut chars = segment.chars();
    while let Some(c) = chars.next() {
        if c != '~' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('0') => out.push('~'),
            Some('1') => out.push('/'),
            _ => {
                return Err(ProtoError::invalid_pointer(format!(
                    "dangling escape in segment '{segment}'"
                )))
            }
        }
    }
    Ok(out)
}
