//! Abstract optimistic synchronization engine.
//!
//! [`ResourceRepo`] owns two copies of a set of named resource collections:
//! the *working copy* the UI observes and edits, and the *remote copy*
//! holding the last confirmed server truth. Local edits land in the working
//! copy immediately; a debounced push diffs the copies into minimal
//! create/update/destroy batches; server responses are folded back in
//! per-group, gated by a version-staleness check so a slow response never
//! clobbers a newer local edit.
//!
//! What the server accepts, which field changes are material, and how
//! batches are ordered is domain knowledge, kept behind the
//! [`ResourceAdapter`] trait.

mod repo;

pub use repo::{CommitOptions, ResourceRepo};

use std::future::Future;
use std::pin::Pin;

use indexmap::IndexMap;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::{ApiError, BoardsyncError, Result};
use crate::patch::{Patch, Path};

/// A boxed future for object-safe async adapter methods.
///
/// Futures are `Send` for compatibility with multi-threaded runtimes.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// All resource collections, keyed by collection name, then by resource id.
///
/// Insertion order is preserved so diffs and batches keep a stable,
/// predictable order.
pub type ResourceSets = IndexMap<String, IndexMap<String, Value>>;

/// Read the immutable `id` field of a resource record.
pub fn resource_id(resource: &Value) -> Option<&str> {
    resource.get("id").and_then(Value::as_str)
}

/// Read the `id` field or fail with [`BoardsyncError::ResourceWithoutId`].
pub fn require_resource_id<'a>(name: &str, resource: &'a Value) -> Result<&'a str> {
    resource_id(resource).ok_or_else(|| BoardsyncError::ResourceWithoutId(name.to_string()))
}

/// Build an `add` patch inserting a whole resource at `[name, id]`.
pub fn resource_add_patch(name: &str, resource: &Value) -> Result<Patch> {
    let id = require_resource_id(name, resource)?;
    Ok(Patch::add(Path::root().key(name).key(id), resource.clone()))
}

/// Build an `add` patch from a typed resource.
pub fn typed_add_patch<T: serde::Serialize>(name: &str, resource: &T) -> Result<Patch> {
    let value = serde_json::to_value(resource)?;
    resource_add_patch(name, &value)
}

/// Build a `remove` patch deleting the whole resource at `[name, id]`.
pub fn resource_remove_patch(name: &str, id: &str) -> Patch {
    Patch::remove(Path::root().key(name).key(id))
}

/// Build a `replace` patch for one field of a resource.
pub fn resource_field_patch(name: &str, id: &str, field: &str, value: Value) -> Patch {
    Patch::replace(Path::root().key(name).key(id).key(field), value)
}

/// What to fetch for one resource collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchSelection {
    /// Fetch the whole collection.
    All,
    /// Fetch exactly these ids.
    Ids(Vec<String>),
}

/// Per-collection fetch request; `None` at the call site means "everything".
pub type FetchQuery = IndexMap<String, FetchSelection>;

/// The computed difference between working and remote copies for one
/// collection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceDiff {
    /// Resources present locally but not remotely (full records).
    pub create: Vec<Value>,
    /// Materially changed resources, as update DTOs keyed by id.
    pub update: IndexMap<String, Value>,
    /// Ids present remotely but deleted locally.
    pub destroy: Vec<String>,
}

impl ResourceDiff {
    /// Whether there is nothing to send.
    pub fn is_empty(&self) -> bool {
        self.create.is_empty() && self.update.is_empty() && self.destroy.is_empty()
    }
}

/// One outgoing batch: a diff per resource collection, in collection
/// declaration order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchMutation(pub IndexMap<String, ResourceDiff>);

impl BatchMutation {
    /// Whether every collection's diff is empty.
    pub fn is_empty(&self) -> bool {
        self.0.values().all(ResourceDiff::is_empty)
    }
}

/// Group result type: the server reports each group independently.
pub type GroupResult<T> = std::result::Result<T, ApiError>;

/// The server's answer for one collection of a batch mutation.
///
/// The three groups succeed or fail independently; a failing group carries
/// the server's error as a value, never as a thrown error.
#[derive(Debug, Clone)]
pub struct MutationOutcome {
    /// Authoritative records for the resources that were created.
    pub created: GroupResult<Vec<Value>>,
    /// Authoritative records for the resources that were updated.
    pub updated: GroupResult<Vec<Value>>,
    /// Ids the server confirms as destroyed.
    pub destroyed: GroupResult<Vec<String>>,
}

impl Default for MutationOutcome {
    fn default() -> Self {
        Self {
            created: Ok(Vec::new()),
            updated: Ok(Vec::new()),
            destroyed: Ok(Vec::new()),
        }
    }
}

impl MutationOutcome {
    /// A fully successful outcome.
    pub fn ok(created: Vec<Value>, updated: Vec<Value>, destroyed: Vec<String>) -> Self {
        Self {
            created: Ok(created),
            updated: Ok(updated),
            destroyed: Ok(destroyed),
        }
    }

    /// The group errors, if any, for UI surfacing.
    pub fn errors(&self) -> Vec<&ApiError> {
        [
            self.created.as_ref().err(),
            self.updated.as_ref().err(),
            self.destroyed.as_ref().err(),
        ]
        .into_iter()
        .flatten()
        .collect()
    }
}

/// Per-collection outcomes of one batch mutation.
pub type BatchMutationResult = IndexMap<String, MutationOutcome>;

/// Where the repo currently is in its request lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// No request in flight.
    Idle,
    /// A push batch is in flight.
    Pushing,
    /// A pull fetch is in flight.
    Pulling,
}

/// The domain contract a concrete repo implements.
///
/// All methods are called by the engine only; implementations perform the
/// actual network I/O and own the projection rules between full local
/// records and the DTOs the server accepts.
pub trait ResourceAdapter: Send + Sync + 'static {
    /// The fixed, finite set of collection names, in dependency order
    /// (referenced collections before the collections referencing them).
    fn resource_names(&self) -> &[&'static str];

    /// Fetch server state. `None` means everything; per-name selections
    /// choose whole collections or exact id lists. `cancel` aborts the
    /// underlying request; an aborted fetch resolves to an error.
    fn fetch<'a>(
        &'a self,
        query: Option<&'a FetchQuery>,
        cancel: Option<&'a CancellationToken>,
    ) -> BoxFuture<'a, Result<ResourceSets>>;

    /// Project a full local record down to what the create endpoint
    /// accepts. Errors when `name` is not a creatable collection.
    fn create_params(&self, name: &str, resource: &Value) -> Result<Value>;

    /// Project the material difference between two records into an update
    /// DTO. `None` means no transmittable change. Must narrow by resource
    /// subtype and reject structurally incompatible transitions.
    fn update_params(&self, name: &str, next: &Value, prev: &Value) -> Result<Option<Value>>;

    /// Perform the batch call(s), preserving relative ordering between
    /// dependent collections.
    fn mutate<'a>(&'a self, batch: &'a BatchMutation) -> BoxFuture<'a, Result<BatchMutationResult>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_resource_id() {
        assert_eq!(resource_id(&json!({"id": "a", "n": 1})), Some("a"));
        assert_eq!(resource_id(&json!({"n": 1})), None);
        assert_eq!(resource_id(&json!({"id": 7})), None);
        assert!(require_resource_id("cards", &json!({})).is_err());
    }

    #[test]
    fn test_batch_emptiness() {
        let mut batch = BatchMutation::default();
        batch.0.insert("cards".to_string(), ResourceDiff::default());
        assert!(batch.is_empty());

        batch
            .0
            .get_mut("cards")
            .unwrap()
            .destroy
            .push("c1".to_string());
        assert!(!batch.is_empty());
    }

    #[test]
    fn test_outcome_errors() {
        let outcome = MutationOutcome {
            created: Ok(vec![]),
            updated: Err(ApiError::new("update failed")),
            destroyed: Ok(vec![]),
        };
        let errors = outcome.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message, "update failed");
    }
}
