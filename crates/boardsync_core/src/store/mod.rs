//! Application-state store.
//!
//! [`Store<S>`] wraps an [`Observable`] with the pieces the UI layer needs:
//! path-scoped subscriptions (listen to a sub-tree and optionally a field
//! subset of it), a dispatch of composable [`StoreCommand`]s that all run
//! against one shared draft, and a predicate-selected undo facade
//! ([`undo::UndoRouter`]).
//!
//! None of this performs I/O. Failures are programming errors (an unknown
//! path, a command that rejects the draft) and surface immediately as `Err`;
//! a failed dispatch commits nothing and notifies nobody.

pub mod undo;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{BoardsyncError, Result};
use crate::observable::{MutationSource, Observable, UpdateOutcome};
use crate::patch::{Patch, Path, PathSegment, value_at};

use undo::{HistoryEntry, UndoRouter};

/// A unique identifier for a store subscription.
pub type SubscriptionId = u64;

/// Callback type for store subscriptions.
///
/// Receives only the patches overlapping the subscription, plus the
/// mutation source.
pub type SubscriptionCallback = Arc<dyn Fn(&[Patch], MutationSource) + Send + Sync>;

/// A mutation command run against the dispatch draft.
///
/// Commands compose: a command may dispatch further commands through its
/// [`CommandContext`], synchronously, against the same draft; later
/// commands observe earlier commands' effects.
pub trait StoreCommand<S>: Send + Sync {
    /// Apply this command to the draft.
    fn run(&self, ctx: &mut CommandContext<'_, S>) -> Result<()>;
}

impl<S, F> StoreCommand<S> for F
where
    F: Fn(&mut CommandContext<'_, S>) -> Result<()> + Send + Sync,
{
    fn run(&self, ctx: &mut CommandContext<'_, S>) -> Result<()> {
        self(ctx)
    }
}

/// The draft handed to commands during a dispatch.
pub struct CommandContext<'a, S> {
    draft: &'a mut S,
}

impl<'a, S> CommandContext<'a, S> {
    /// Read the in-flight draft (draft-aware: includes the effects of
    /// commands that already ran in this dispatch).
    pub fn get(&self) -> &S {
        self.draft
    }

    /// Mutate the in-flight draft.
    pub fn state(&mut self) -> &mut S {
        self.draft
    }

    /// Run another command against the same draft, synchronously.
    pub fn dispatch(&mut self, command: &dyn StoreCommand<S>) -> Result<()> {
        command.run(self)
    }
}

/// Options for [`Store::dispatch`].
#[derive(Default)]
pub struct DispatchOptions {
    /// Source tag delivered to subscribers. Defaults to
    /// [`MutationSource::Edit`]; replay sources skip history recording.
    pub source: Option<MutationSource>,
    /// Label recorded on the history entry.
    pub label: Option<String>,
}

struct StoreSubscription {
    path: Path,
    fields: Option<HashSet<String>>,
    callback: SubscriptionCallback,
}

impl StoreSubscription {
    /// Patches from `patches` that this subscription should see.
    fn matching(&self, patches: &[Patch]) -> Vec<Patch> {
        patches
            .iter()
            .filter(|patch| {
                if !patch.path.overlaps(&self.path) {
                    return false;
                }
                match (&self.fields, patch.path.segment_after(&self.path)) {
                    // Field filter applies only to patches below the
                    // subscription path; a patch at or above it touches an
                    // unknown field set and always fires.
                    (Some(fields), Some(PathSegment::Key(key))) => fields.contains(key),
                    (Some(_), Some(PathSegment::Index(_))) => true,
                    _ => true,
                }
            })
            .cloned()
            .collect()
    }
}

/// Generic application-state container.
pub struct Store<S> {
    observable: Observable<S>,
    subscriptions: RwLock<HashMap<SubscriptionId, StoreSubscription>>,
    next_subscription_id: AtomicU64,
    undo: Mutex<UndoRouter<S>>,
}

impl<S: Clone + Serialize + DeserializeOwned> Store<S> {
    /// Create a store with no undo routes.
    pub fn new(initial: S) -> Self {
        Self::with_undo(initial, UndoRouter::new())
    }

    /// Create a store with a configured undo router.
    pub fn with_undo(initial: S, mut undo: UndoRouter<S>) -> Self {
        undo.select(&initial);
        Self {
            observable: Observable::new(initial),
            subscriptions: RwLock::new(HashMap::new()),
            next_subscription_id: AtomicU64::new(1),
            undo: Mutex::new(undo),
        }
    }

    /// Clone the whole state.
    pub fn state(&self) -> S {
        self.observable.get()
    }

    /// Read the value at `path`. Unknown paths are programming errors.
    pub fn get(&self, path: &Path) -> Result<Value> {
        let snapshot = self.observable.snapshot()?;
        value_at(&snapshot, path)
            .cloned()
            .ok_or_else(|| BoardsyncError::UnknownPath(path.clone()))
    }

    /// Read the object at `path` projected down to `fields`.
    pub fn get_fields(&self, path: &Path, fields: &[&str]) -> Result<Value> {
        let value = self.get(path)?;
        let Value::Object(map) = value else {
            return Err(BoardsyncError::UnknownPath(path.clone()));
        };
        let projected = map
            .into_iter()
            .filter(|(key, _)| fields.contains(&key.as_str()))
            .collect();
        Ok(Value::Object(projected))
    }

    /// Subscribe to patches overlapping `path` (and `fields`, when given).
    pub fn subscribe(
        &self,
        path: Path,
        fields: Option<HashSet<String>>,
        callback: SubscriptionCallback,
    ) -> SubscriptionId {
        let id = self.next_subscription_id.fetch_add(1, Ordering::SeqCst);
        self.subscriptions.write().unwrap().insert(
            id,
            StoreSubscription {
                path,
                fields,
                callback,
            },
        );
        id
    }

    /// Remove a subscription. Returns `true` if it existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscriptions.write().unwrap().remove(&id).is_some()
    }

    /// Run `commands` in order against one draft.
    ///
    /// Produces one combined patch/inverse set, one notification pass, and
    /// (for non-replay sources) one history entry on the active undo stack.
    /// A failing command aborts the whole dispatch: nothing commits, nobody
    /// is notified.
    pub fn dispatch(
        &self,
        commands: &[&dyn StoreCommand<S>],
        options: DispatchOptions,
    ) -> Result<UpdateOutcome> {
        let source = options.source.unwrap_or(MutationSource::Edit);
        let outcome = self.observable.update(source, |draft| {
            let mut ctx = CommandContext { draft };
            for command in commands {
                command.run(&mut ctx)?;
            }
            Ok(())
        })?;

        if !outcome.is_empty() {
            self.notify_subscriptions(&outcome.patches, source);
        }

        // The facade re-evaluates ownership against the post-mutation state
        // after every dispatch, replays included.
        let mut undo = self.undo.lock().unwrap();
        self.observable.with(|state| undo.select(state));
        if !outcome.is_empty() && !source.is_replay() {
            let mut entry = HistoryEntry::new(outcome.patches.clone(), outcome.inverse.clone());
            entry.label = options.label;
            undo.record(entry);
        }

        Ok(outcome)
    }

    /// Undo the active stack's most recent step. Returns `false` when there
    /// is nothing to undo.
    pub fn undo(&self) -> Result<bool> {
        let entry = { self.undo.lock().unwrap().undo() };
        let Some(entry) = entry else {
            return Ok(false);
        };
        self.observable
            .apply_patches(MutationSource::Undo, &entry.inverse)?;
        self.notify_subscriptions(&entry.inverse, MutationSource::Undo);
        let mut undo = self.undo.lock().unwrap();
        self.observable.with(|state| undo.select(state));
        Ok(true)
    }

    /// Redo the active stack's most recently undone step. Returns `false`
    /// when there is nothing to redo.
    pub fn redo(&self) -> Result<bool> {
        let entry = { self.undo.lock().unwrap().redo() };
        let Some(entry) = entry else {
            return Ok(false);
        };
        self.observable
            .apply_patches(MutationSource::Redo, &entry.patches)?;
        self.notify_subscriptions(&entry.patches, MutationSource::Redo);
        let mut undo = self.undo.lock().unwrap();
        self.observable.with(|state| undo.select(state));
        Ok(true)
    }

    /// Whether the active undo stack has a step to undo.
    pub fn can_undo(&self) -> bool {
        self.undo.lock().unwrap().can_undo()
    }

    /// Whether the active undo stack has a step to redo.
    pub fn can_redo(&self) -> bool {
        self.undo.lock().unwrap().can_redo()
    }

    fn notify_subscriptions(&self, patches: &[Patch], source: MutationSource) {
        let subscriptions = self.subscriptions.read().unwrap();
        let mut deliveries: Vec<(SubscriptionCallback, Vec<Patch>)> = Vec::new();
        for subscription in subscriptions.values() {
            let matching = subscription.matching(patches);
            if !matching.is_empty() {
                deliveries.push((Arc::clone(&subscription.callback), matching));
            }
        }
        drop(subscriptions);
        for (callback, matching) in deliveries {
            callback(&matching, source);
        }
    }
}

impl<S: std::fmt::Debug> std::fmt::Debug for Store<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("observable", &"Observable")
            .field(
                "subscription_count",
                &self.subscriptions.read().unwrap().len(),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::undo::LinearUndoStack;
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    fn counting_callback() -> (SubscriptionCallback, Arc<Mutex<Vec<(usize, MutationSource)>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let callback: SubscriptionCallback = Arc::new(move |patches, source| {
            seen_clone.lock().unwrap().push((patches.len(), source));
        });
        (callback, seen)
    }

    #[test]
    fn test_dispatch_applies_commands_in_order() {
        let store = Store::new(json!({"log": []}));
        let push_a = |ctx: &mut CommandContext<'_, Value>| {
            ctx.state()["log"].as_array_mut().unwrap().push(json!("a"));
            Ok(())
        };
        let push_b = |ctx: &mut CommandContext<'_, Value>| {
            ctx.state()["log"].as_array_mut().unwrap().push(json!("b"));
            Ok(())
        };

        store
            .dispatch(&[&push_a, &push_b], DispatchOptions::default())
            .unwrap();
        assert_eq!(store.state()["log"], json!(["a", "b"]));
    }

    #[test]
    fn test_nested_dispatch_observes_draft() {
        let store = Store::new(json!({"n": 1}));
        let double = |ctx: &mut CommandContext<'_, Value>| {
            let n = ctx.get()["n"].as_i64().unwrap();
            ctx.state()["n"] = json!(n * 2);
            Ok(())
        };
        let double_twice = move |ctx: &mut CommandContext<'_, Value>| {
            ctx.dispatch(&double)?;
            ctx.dispatch(&double)?;
            Ok(())
        };

        store
            .dispatch(&[&double_twice], DispatchOptions::default())
            .unwrap();
        assert_eq!(store.state()["n"], json!(4));
    }

    #[test]
    fn test_failed_command_commits_nothing() {
        let store = Store::new(json!({"n": 1}));
        let (callback, seen) = counting_callback();
        store.subscribe(Path::root(), None, callback);

        let bad = |ctx: &mut CommandContext<'_, Value>| {
            ctx.state()["n"] = json!(99);
            Err(BoardsyncError::UnknownResource("nope".to_string()))
        };
        assert!(store.dispatch(&[&bad], DispatchOptions::default()).is_err());
        assert_eq!(store.state()["n"], json!(1));
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_subscription_path_scoping() {
        let store = Store::new(json!({"boards": {"b1": {"title": "t"}}, "ui": {"zoom": 1.0}}));
        let (board_cb, board_seen) = counting_callback();
        let (ui_cb, ui_seen) = counting_callback();
        store.subscribe(Path::root().key("boards"), None, board_cb);
        store.subscribe(Path::root().key("ui"), None, ui_cb);

        let rename = |ctx: &mut CommandContext<'_, Value>| {
            ctx.state()["boards"]["b1"]["title"] = json!("renamed");
            Ok(())
        };
        store.dispatch(&[&rename], DispatchOptions::default()).unwrap();

        assert_eq!(board_seen.lock().unwrap().len(), 1);
        assert!(ui_seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_subscription_field_filter() {
        let store = Store::new(json!({"boards": {"b1": {"title": "t", "zoom": 1.0}}}));
        let (callback, seen) = counting_callback();
        let fields = HashSet::from(["title".to_string()]);
        store.subscribe(
            Path::root().key("boards").key("b1"),
            Some(fields),
            callback,
        );

        let change_zoom = |ctx: &mut CommandContext<'_, Value>| {
            ctx.state()["boards"]["b1"]["zoom"] = json!(2.0);
            Ok(())
        };
        store
            .dispatch(&[&change_zoom], DispatchOptions::default())
            .unwrap();
        assert!(seen.lock().unwrap().is_empty(), "zoom is not subscribed");

        let change_title = |ctx: &mut CommandContext<'_, Value>| {
            ctx.state()["boards"]["b1"]["title"] = json!("new");
            Ok(())
        };
        store
            .dispatch(&[&change_title], DispatchOptions::default())
            .unwrap();
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_get_and_get_fields() {
        let store = Store::new(json!({"boards": {"b1": {"title": "t", "zoom": 1.0}}}));
        assert_eq!(
            store.get(&Path::root().key("boards").key("b1").key("title")).unwrap(),
            json!("t")
        );
        assert_eq!(
            store
                .get_fields(&Path::root().key("boards").key("b1"), &["title"])
                .unwrap(),
            json!({"title": "t"})
        );
        assert!(matches!(
            store.get(&Path::root().key("missing")),
            Err(BoardsyncError::UnknownPath(_))
        ));
    }

    #[test]
    fn test_undo_redo_roundtrip() {
        let initial = json!({"cards": {}, "selection": null});
        let store = Store::with_undo(
            initial.clone(),
            UndoRouter::new().route(|_: &Value| true, LinearUndoStack::with_max_levels(100)),
        );

        for i in 1..=3 {
            let add = move |ctx: &mut CommandContext<'_, Value>| {
                let id = format!("c{i}");
                ctx.state()["cards"][&id] = json!({"id": id, "n": i});
                ctx.state()["selection"] = json!(format!("c{i}"));
                Ok(())
            };
            store.dispatch(&[&add], DispatchOptions::default()).unwrap();
        }
        let after = store.state();

        assert!(store.undo().unwrap());
        assert!(store.undo().unwrap());
        assert!(store.undo().unwrap());
        assert!(!store.undo().unwrap(), "history exhausted");
        assert_eq!(store.state(), initial);

        assert!(store.redo().unwrap());
        assert!(store.redo().unwrap());
        assert!(store.redo().unwrap());
        assert_eq!(store.state(), after);
    }

    #[test]
    fn test_replay_sources_are_tagged_and_not_rerecorded() {
        let store = Store::with_undo(
            json!({"n": 0}),
            UndoRouter::new().route(|_: &Value| true, LinearUndoStack::with_max_levels(100)),
        );
        let (callback, seen) = counting_callback();
        store.subscribe(Path::root(), None, callback);

        let bump = |ctx: &mut CommandContext<'_, Value>| {
            let n = ctx.get()["n"].as_i64().unwrap();
            ctx.state()["n"] = json!(n + 1);
            Ok(())
        };
        store.dispatch(&[&bump], DispatchOptions::default()).unwrap();
        store.undo().unwrap();
        store.redo().unwrap();

        {
            let seen = seen.lock().unwrap();
            assert_eq!(seen.len(), 3);
            assert_eq!(seen[1].1, MutationSource::Undo);
            assert_eq!(seen[2].1, MutationSource::Redo);
        }

        // Undo/redo replays never grew the history: one more undo empties it.
        assert!(store.undo().unwrap());
        assert!(!store.can_undo());
    }

    #[test]
    fn test_predicate_switches_active_stack() {
        #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
        struct AppState {
            presenting: bool,
            canvas_edits: u32,
            step_edits: u32,
        }

        let store = Store::with_undo(
            AppState {
                presenting: false,
                canvas_edits: 0,
                step_edits: 0,
            },
            UndoRouter::new()
                .route(|s: &AppState| s.presenting, LinearUndoStack::with_max_levels(10))
                .route(|_: &AppState| true, LinearUndoStack::with_max_levels(10)),
        );

        let edit_canvas = |ctx: &mut CommandContext<'_, AppState>| {
            ctx.state().canvas_edits += 1;
            Ok(())
        };
        store
            .dispatch(&[&edit_canvas], DispatchOptions::default())
            .unwrap();

        // Entering presentation mode moves ownership to the first stack,
        // whose history is empty.
        let enter = |ctx: &mut CommandContext<'_, AppState>| {
            ctx.state().presenting = true;
            Ok(())
        };
        store.dispatch(&[&enter], DispatchOptions::default()).unwrap();
        let edit_steps = |ctx: &mut CommandContext<'_, AppState>| {
            ctx.state().step_edits += 1;
            Ok(())
        };
        store
            .dispatch(&[&edit_steps], DispatchOptions::default())
            .unwrap();

        assert!(store.undo().unwrap());
        assert_eq!(store.state().step_edits, 0);
        assert!(store.state().presenting, "canvas history untouched");
    }
}
