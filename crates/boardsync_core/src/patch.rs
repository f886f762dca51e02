//! Patch and path primitives.
//!
//! A [`Patch`] is the unit of change notification and of undo/redo: one
//! structural operation (`add`/`replace`/`remove`) at a typed [`Path`] into a
//! JSON-shaped state tree. Paths are typed segment lists rather than parsed
//! strings, so construction mistakes fail at compile time instead of at
//! subscription-match time.
//!
//! By convention, an `add`/`remove` whose path has exactly two segments
//! (`[collection, id]`) denotes whole-resource creation/deletion; deeper
//! paths denote field mutation within a resource.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use ts_rs::TS;

use crate::error::{BoardsyncError, Result};

/// The kind of structural change a patch performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
#[serde(rename_all = "lowercase")]
pub enum PatchOp {
    /// Insert a value that was not present before.
    Add,
    /// Overwrite a value that was present before.
    Replace,
    /// Delete a value.
    Remove,
}

/// One step into a JSON tree: an object key or an array index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
#[serde(untagged)]
pub enum PathSegment {
    /// Object member key.
    Key(String),
    /// Array element index.
    Index(usize),
}

impl From<&str> for PathSegment {
    fn from(key: &str) -> Self {
        PathSegment::Key(key.to_string())
    }
}

impl From<String> for PathSegment {
    fn from(key: String) -> Self {
        PathSegment::Key(key)
    }
}

impl From<usize> for PathSegment {
    fn from(index: usize) -> Self {
        PathSegment::Index(index)
    }
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSegment::Key(key) => write!(f, "{key}"),
            PathSegment::Index(index) => write!(f, "{index}"),
        }
    }
}

/// A typed path into a JSON-shaped state tree.
///
/// The empty path addresses the root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct Path(pub Vec<PathSegment>);

impl Path {
    /// The root path.
    pub fn root() -> Self {
        Path(Vec::new())
    }

    /// Append an object key (builder style).
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.0.push(PathSegment::Key(key.into()));
        self
    }

    /// Append an array index (builder style).
    pub fn index(mut self, index: usize) -> Self {
        self.0.push(PathSegment::Index(index));
        self
    }

    /// Number of segments.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether this is the root path.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Segment at position `i`.
    pub fn get(&self, i: usize) -> Option<&PathSegment> {
        self.0.get(i)
    }

    /// Whether `prefix` is a (possibly equal) prefix of this path.
    pub fn starts_with(&self, prefix: &Path) -> bool {
        prefix.len() <= self.len() && self.0[..prefix.len()] == prefix.0[..]
    }

    /// Whether two paths lie on one root-to-leaf line: either is a prefix of
    /// the other. This is the subscription overlap rule: a subscription at
    /// `[boards, b1]` overlaps a patch at `[boards, b1, title]` and a patch
    /// at `[boards]`, but not one at `[cards, c1]`.
    pub fn overlaps(&self, other: &Path) -> bool {
        self.starts_with(other) || other.starts_with(self)
    }

    /// The first segment past `prefix`, when this path extends it.
    pub fn segment_after(&self, prefix: &Path) -> Option<&PathSegment> {
        if self.starts_with(prefix) {
            self.0.get(prefix.len())
        } else {
            None
        }
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for segment in &self.0 {
            write!(f, "/{segment}")?;
        }
        Ok(())
    }
}

impl<S: Into<PathSegment>> FromIterator<S> for Path {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Path(iter.into_iter().map(Into::into).collect())
    }
}

/// A single structural change record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct Patch {
    /// What kind of change this is.
    pub op: PatchOp,
    /// Where in the tree the change applies.
    pub path: Path,
    /// The new value for `add`/`replace`; absent for `remove`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl Patch {
    /// An `add` patch.
    pub fn add(path: Path, value: Value) -> Self {
        Patch {
            op: PatchOp::Add,
            path,
            value: Some(value),
        }
    }

    /// A `replace` patch.
    pub fn replace(path: Path, value: Value) -> Self {
        Patch {
            op: PatchOp::Replace,
            path,
            value: Some(value),
        }
    }

    /// A `remove` patch.
    pub fn remove(path: Path) -> Self {
        Patch {
            op: PatchOp::Remove,
            path,
            value: None,
        }
    }

    /// Whether this patch creates or deletes a whole resource
    /// (`[collection, id]` path).
    pub fn is_whole_resource(&self) -> bool {
        self.path.len() == 2 && matches!(self.op, PatchOp::Add | PatchOp::Remove)
    }
}

/// Navigate to the parent container of `path`'s last segment.
fn parent_of<'a, 'p>(
    target: &'a mut Value,
    path: &'p Path,
) -> Result<(&'a mut Value, &'p PathSegment)> {
    let Some((last, parents)) = path.0.split_last() else {
        return Err(BoardsyncError::InvalidPatchPath(path.clone()));
    };
    let mut current = target;
    for segment in parents {
        current = match (segment, current) {
            (PathSegment::Key(key), Value::Object(map)) => map
                .get_mut(key)
                .ok_or_else(|| BoardsyncError::UnknownPath(path.clone()))?,
            (PathSegment::Index(index), Value::Array(items)) => items
                .get_mut(*index)
                .ok_or_else(|| BoardsyncError::UnknownPath(path.clone()))?,
            _ => return Err(BoardsyncError::UnknownPath(path.clone())),
        };
    }
    Ok((current, last))
}

/// Apply one patch to a JSON tree in place.
///
/// `add`/`replace` both set object members (a replace of a missing member is
/// tolerated, matching the draft-produced patches this crate generates);
/// array adds insert, array replaces overwrite. `remove` of a missing target
/// is an error: replayed patches are expected to match the tree exactly.
pub fn apply_patch(target: &mut Value, patch: &Patch) -> Result<()> {
    if patch.path.is_empty() {
        // Whole-tree replacement; a root remove has no meaning.
        let value = patch
            .value
            .clone()
            .ok_or_else(|| BoardsyncError::InvalidPatchPath(patch.path.clone()))?;
        *target = value;
        return Ok(());
    }
    let (parent, last) = parent_of(target, &patch.path)?;
    match patch.op {
        PatchOp::Add | PatchOp::Replace => {
            let value = patch
                .value
                .clone()
                .ok_or_else(|| BoardsyncError::InvalidPatchPath(patch.path.clone()))?;
            match (last, parent) {
                (PathSegment::Key(key), Value::Object(map)) => {
                    map.insert(key.clone(), value);
                }
                (PathSegment::Index(index), Value::Array(items)) => {
                    if patch.op == PatchOp::Add {
                        if *index > items.len() {
                            return Err(BoardsyncError::UnknownPath(patch.path.clone()));
                        }
                        items.insert(*index, value);
                    } else {
                        let slot = items
                            .get_mut(*index)
                            .ok_or_else(|| BoardsyncError::UnknownPath(patch.path.clone()))?;
                        *slot = value;
                    }
                }
                _ => return Err(BoardsyncError::UnknownPath(patch.path.clone())),
            }
        }
        PatchOp::Remove => match (last, parent) {
            (PathSegment::Key(key), Value::Object(map)) => {
                map.remove(key)
                    .ok_or_else(|| BoardsyncError::UnknownPath(patch.path.clone()))?;
            }
            (PathSegment::Index(index), Value::Array(items)) => {
                if *index >= items.len() {
                    return Err(BoardsyncError::UnknownPath(patch.path.clone()));
                }
                items.remove(*index);
            }
            _ => return Err(BoardsyncError::UnknownPath(patch.path.clone())),
        },
    }
    Ok(())
}

/// Apply a list of patches in order.
pub fn apply_patches(target: &mut Value, patches: &[Patch]) -> Result<()> {
    for patch in patches {
        apply_patch(target, patch)?;
    }
    Ok(())
}

/// Read the value at `path`, if present.
pub fn value_at<'a>(target: &'a Value, path: &Path) -> Option<&'a Value> {
    let mut current = target;
    for segment in &path.0 {
        current = match (segment, current) {
            (PathSegment::Key(key), Value::Object(map)) => map.get(key)?,
            (PathSegment::Index(index), Value::Array(items)) => items.get(*index)?,
            _ => return None,
        };
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_overlap_rule() {
        let sub = Path::root().key("boards").key("b1");
        let deeper = Path::root().key("boards").key("b1").key("title");
        let shallower = Path::root().key("boards");
        let sibling = Path::root().key("cards").key("c1");

        assert!(deeper.overlaps(&sub));
        assert!(shallower.overlaps(&sub));
        assert!(sub.overlaps(&sub));
        assert!(!sibling.overlaps(&sub));
    }

    #[test]
    fn test_segment_after() {
        let prefix = Path::root().key("boards").key("b1");
        let patch_path = Path::root().key("boards").key("b1").key("title");
        assert_eq!(
            patch_path.segment_after(&prefix),
            Some(&PathSegment::Key("title".to_string()))
        );
        assert_eq!(prefix.segment_after(&patch_path), None);
    }

    #[test]
    fn test_apply_object_patches() {
        let mut value = json!({"boards": {}});

        apply_patch(
            &mut value,
            &Patch::add(Path::root().key("boards").key("b1"), json!({"id": "b1"})),
        )
        .unwrap();
        apply_patch(
            &mut value,
            &Patch::replace(
                Path::root().key("boards").key("b1").key("title"),
                json!("hello"),
            ),
        )
        .unwrap();
        assert_eq!(value, json!({"boards": {"b1": {"id": "b1", "title": "hello"}}}));

        apply_patch(&mut value, &Patch::remove(Path::root().key("boards").key("b1"))).unwrap();
        assert_eq!(value, json!({"boards": {}}));
    }

    #[test]
    fn test_apply_array_patches() {
        let mut value = json!({"order": ["a", "c"]});
        apply_patch(
            &mut value,
            &Patch::add(Path::root().key("order").index(1), json!("b")),
        )
        .unwrap();
        assert_eq!(value, json!({"order": ["a", "b", "c"]}));

        apply_patch(&mut value, &Patch::remove(Path::root().key("order").index(0))).unwrap();
        assert_eq!(value, json!({"order": ["b", "c"]}));
    }

    #[test]
    fn test_remove_missing_is_an_error() {
        let mut value = json!({"boards": {}});
        let result = apply_patch(&mut value, &Patch::remove(Path::root().key("boards").key("nope")));
        assert!(matches!(result, Err(BoardsyncError::UnknownPath(_))));
    }

    #[test]
    fn test_missing_intermediate_is_an_error() {
        let mut value = json!({});
        let result = apply_patch(
            &mut value,
            &Patch::replace(Path::root().key("boards").key("b1").key("title"), json!("x")),
        );
        assert!(matches!(result, Err(BoardsyncError::UnknownPath(_))));
    }

    #[test]
    fn test_path_serializes_as_segment_array() {
        let patch = Patch::add(Path::root().key("boards").key("b1"), json!({"id": "b1"}));
        let json = serde_json::to_value(&patch).unwrap();
        assert_eq!(json["op"], json!("add"));
        assert_eq!(json["path"], json!(["boards", "b1"]));
    }

    #[test]
    fn test_value_at() {
        let value = json!({"boards": {"b1": {"title": "t"}}, "order": [1, 2]});
        assert_eq!(
            value_at(&value, &Path::root().key("boards").key("b1").key("title")),
            Some(&json!("t"))
        );
        assert_eq!(value_at(&value, &Path::root().key("order").index(1)), Some(&json!(2)));
        assert_eq!(value_at(&value, &Path::root().key("missing")), None);
    }
}
