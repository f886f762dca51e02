//! Reactive value container.
//!
//! [`Observable<T>`] holds one value and turns every mutation into a list of
//! structural [`Patch`]es plus the inverse list that undoes them. Mutations
//! run against a cloned draft; the draft is committed and listeners are
//! notified exactly once, only when something actually changed. A failing
//! mutation closure discards the draft and notifies nobody.
//!
//! Listeners live in an explicit registry (atomic ids, panic isolation);
//! there is no reflection-based event binding anywhere in this crate.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::diff::diff_values;
use crate::error::Result;
use crate::patch::{self, Patch};

/// A unique identifier for a change subscription.
pub type ListenerId = u64;

/// Callback type for change notifications.
///
/// Callbacks receive the committed patches and the mutation source and
/// should not block for extended periods.
pub type ChangeListener = Arc<dyn Fn(&[Patch], MutationSource) + Send + Sync>;

/// Where a mutation came from.
///
/// Subscribers use this to tell user edits apart from programmatic
/// rollback (`Undo`/`Redo`) and from server-originated folds (`Remote`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, ts_rs::TS)]
#[ts(export, export_to = "bindings/")]
#[serde(rename_all = "lowercase")]
pub enum MutationSource {
    /// A direct local edit.
    Edit,
    /// Replay of inverse patches from an undo stack.
    Undo,
    /// Replay of forward patches from an undo stack.
    Redo,
    /// A confirmed server response or remote push folded in.
    Remote,
}

impl MutationSource {
    /// Whether this source is an undo/redo replay.
    pub fn is_replay(self) -> bool {
        matches!(self, MutationSource::Undo | MutationSource::Redo)
    }
}

/// The patches committed by one mutation, with their inverse.
#[derive(Debug, Clone, Default)]
pub struct UpdateOutcome {
    /// Patches that were applied, in application order.
    pub patches: Vec<Patch>,
    /// Patches that undo them, in application order.
    pub inverse: Vec<Patch>,
}

impl UpdateOutcome {
    /// Whether the mutation changed anything.
    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }
}

/// A reactive value holder.
///
/// External mutation without going through [`update`](Observable::update) or
/// [`apply_patches`](Observable::apply_patches) is structurally prevented:
/// reads hand out clones or borrow under the lock.
pub struct Observable<T> {
    value: RwLock<T>,
    listeners: RwLock<HashMap<ListenerId, ChangeListener>>,
    next_listener_id: AtomicU64,
}

impl<T: Clone + Serialize + DeserializeOwned> Observable<T> {
    /// Create an observable holding `value`.
    pub fn new(value: T) -> Self {
        Self {
            value: RwLock::new(value),
            listeners: RwLock::new(HashMap::new()),
            next_listener_id: AtomicU64::new(1),
        }
    }

    /// Clone the current value.
    pub fn get(&self) -> T {
        self.value.read().unwrap().clone()
    }

    /// Read the current value through a closure without cloning.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.value.read().unwrap())
    }

    /// Snapshot the current value as a JSON tree.
    pub fn snapshot(&self) -> Result<Value> {
        Ok(serde_json::to_value(&*self.value.read().unwrap())?)
    }

    /// Subscribe to change notifications.
    ///
    /// Returns a listener id that can be passed to
    /// [`unsubscribe`](Observable::unsubscribe).
    pub fn subscribe(&self, listener: ChangeListener) -> ListenerId {
        let id = self.next_listener_id.fetch_add(1, Ordering::SeqCst);
        self.listeners.write().unwrap().insert(id, listener);
        id
    }

    /// Remove a subscription. Returns `true` if it existed.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.listeners.write().unwrap().remove(&id).is_some()
    }

    /// Number of active subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.listeners.read().unwrap().len()
    }

    /// Mutate the value through a draft.
    ///
    /// The closure runs against a clone; when it succeeds, the draft is
    /// diffed against the previous snapshot, committed, and listeners fire
    /// once with the resulting patches. When it fails, or when it changes
    /// nothing, no notification happens.
    pub fn update(
        &self,
        source: MutationSource,
        f: impl FnOnce(&mut T) -> Result<()>,
    ) -> Result<UpdateOutcome> {
        let outcome;
        {
            let mut guard = self.value.write().unwrap();
            let before = serde_json::to_value(&*guard)?;
            let mut draft = guard.clone();
            f(&mut draft)?;
            let after = serde_json::to_value(&draft)?;
            let (patches, inverse) = diff_values(&before, &after);
            if patches.is_empty() {
                return Ok(UpdateOutcome::default());
            }
            *guard = draft;
            outcome = UpdateOutcome { patches, inverse };
        }
        self.notify(&outcome.patches, source);
        Ok(outcome)
    }

    /// Apply explicit patches (undo/redo replay, remote folds).
    ///
    /// Returns the inverse patches. An empty input is a no-op.
    pub fn apply_patches(&self, source: MutationSource, patches: &[Patch]) -> Result<Vec<Patch>> {
        if patches.is_empty() {
            return Ok(Vec::new());
        }
        let inverse;
        {
            let mut guard = self.value.write().unwrap();
            let before = serde_json::to_value(&*guard)?;
            let mut tree = before.clone();
            patch::apply_patches(&mut tree, patches)?;
            inverse = diff_values(&before, &tree).1;
            *guard = serde_json::from_value(tree)?;
        }
        self.notify(patches, source);
        Ok(inverse)
    }

    /// Replace the whole value.
    pub fn replace(&self, source: MutationSource, value: T) -> Result<UpdateOutcome> {
        self.update(source, |draft| {
            *draft = value;
            Ok(())
        })
    }

    fn notify(&self, patches: &[Patch], source: MutationSource) {
        // Snapshot the callbacks so a listener may subscribe/unsubscribe
        // from inside its own notification.
        let listeners: Vec<ChangeListener> =
            self.listeners.read().unwrap().values().cloned().collect();
        for listener in listeners {
            // One panicking listener must not starve the others.
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                listener(patches, source);
            }));
            if result.is_err() {
                log::warn!("[Observable] change listener panicked");
            }
        }
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Observable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observable")
            .field("value", &*self.value.read().unwrap())
            .field("subscriber_count", &self.listeners.read().unwrap().len())
            .finish()
    }
}
