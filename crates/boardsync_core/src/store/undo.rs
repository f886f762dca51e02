//! Undo/redo stacks and the predicate-selected router.
//!
//! Every dispatch records a [`HistoryEntry`]: the committed patches and the
//! inverse list that undoes them. Undo replays the inverse, redo replays the
//! original patches; both go back through the store tagged so subscribers
//! can tell replay from editing.
//!
//! A store owns several stacks at once ("editing the canvas" and "editing a
//! presentation sequence" keep separate histories), and the [`UndoRouter`]
//! decides after every state change which stack currently owns the state.

use crate::patch::Patch;

/// One undoable step: the patches of a dispatch and their inverse.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    /// Patches in application order (replayed on redo).
    pub patches: Vec<Patch>,
    /// Inverse patches in application order (replayed on undo).
    pub inverse: Vec<Patch>,
    /// Optional description of the step.
    pub label: Option<String>,
}

impl HistoryEntry {
    /// Create an unlabeled entry.
    pub fn new(patches: Vec<Patch>, inverse: Vec<Patch>) -> Self {
        Self {
            patches,
            inverse,
            label: None,
        }
    }

    /// Attach a description.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

/// An undo history implementation.
///
/// `undo`/`redo` hand back the entry to replay and move it to the opposite
/// pile; the caller (the store) performs the actual patch replay.
pub trait UndoStack: Send {
    /// Record a new step. Implementations clear their redo pile.
    fn record(&mut self, entry: HistoryEntry);

    /// Take the most recent step for undoing, moving it to the redo pile.
    fn undo(&mut self) -> Option<HistoryEntry>;

    /// Take the most recently undone step for redoing, moving it back.
    fn redo(&mut self) -> Option<HistoryEntry>;

    /// Whether a step is available to undo.
    fn can_undo(&self) -> bool;

    /// Whether a step is available to redo.
    fn can_redo(&self) -> bool;

    /// Drop all history.
    fn clear(&mut self);
}

/// A bounded linear undo stack.
#[derive(Debug, Default)]
pub struct LinearUndoStack {
    undo_stack: Vec<HistoryEntry>,
    redo_stack: Vec<HistoryEntry>,
    /// Maximum number of undo levels (0 = unlimited).
    max_levels: usize,
}

impl LinearUndoStack {
    /// Create a stack with the given depth bound (0 = unlimited).
    pub fn with_max_levels(max_levels: usize) -> Self {
        Self {
            undo_stack: Vec::new(),
            redo_stack: Vec::new(),
            max_levels,
        }
    }

    /// Number of undo levels available.
    pub fn undo_levels(&self) -> usize {
        self.undo_stack.len()
    }

    /// Number of redo levels available.
    pub fn redo_levels(&self) -> usize {
        self.redo_stack.len()
    }

    /// Description of the next undo step, if any.
    pub fn undo_label(&self) -> Option<&str> {
        self.undo_stack.last().and_then(|entry| entry.label.as_deref())
    }
}

impl UndoStack for LinearUndoStack {
    fn record(&mut self, entry: HistoryEntry) {
        self.undo_stack.push(entry);
        if self.max_levels > 0 && self.undo_stack.len() > self.max_levels {
            self.undo_stack.remove(0);
        }
        // A new edit invalidates the redone future.
        self.redo_stack.clear();
    }

    fn undo(&mut self) -> Option<HistoryEntry> {
        let entry = self.undo_stack.pop()?;
        self.redo_stack.push(entry.clone());
        Some(entry)
    }

    fn redo(&mut self) -> Option<HistoryEntry> {
        let entry = self.redo_stack.pop()?;
        self.undo_stack.push(entry.clone());
        Some(entry)
    }

    fn can_undo(&self) -> bool {
        !self.undo_stack.is_empty()
    }

    fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }

    fn clear(&mut self) {
        self.undo_stack.clear();
        self.redo_stack.clear();
    }
}

/// Predicate deciding whether a stack owns the current state.
pub type UndoPredicate<S> = Box<dyn Fn(&S) -> bool + Send + Sync>;

/// Routes undo history to whichever stack currently owns the state.
///
/// Holds an ordered list of `(predicate, stack)` pairs; after every state
/// change the store calls [`select`](UndoRouter::select) with the
/// post-mutation state and the first matching predicate wins. `record`,
/// `undo` and `redo` all forward to the selected stack only.
pub struct UndoRouter<S> {
    routes: Vec<(UndoPredicate<S>, Box<dyn UndoStack>)>,
    active: Option<usize>,
}

impl<S> UndoRouter<S> {
    /// An empty router (undo/redo are no-ops until routes are added).
    pub fn new() -> Self {
        Self {
            routes: Vec::new(),
            active: None,
        }
    }

    /// Append a `(predicate, stack)` pair (builder style). Order matters:
    /// the first matching predicate owns the state.
    pub fn route(
        mut self,
        predicate: impl Fn(&S) -> bool + Send + Sync + 'static,
        stack: impl UndoStack + 'static,
    ) -> Self {
        self.routes.push((Box::new(predicate), Box::new(stack)));
        self
    }

    /// Re-evaluate which stack owns `state`.
    pub fn select(&mut self, state: &S) {
        self.active = self
            .routes
            .iter()
            .position(|(predicate, _)| predicate(state));
    }

    /// Index of the active route, if any. Mostly useful in tests.
    pub fn active_index(&self) -> Option<usize> {
        self.active
    }

    /// Record a step on the active stack.
    pub fn record(&mut self, entry: HistoryEntry) {
        if let Some(index) = self.active {
            self.routes[index].1.record(entry);
        } else {
            log::debug!("[UndoRouter] no active stack, dropping history entry");
        }
    }

    /// Take the active stack's next undo step.
    pub fn undo(&mut self) -> Option<HistoryEntry> {
        self.routes[self.active?].1.undo()
    }

    /// Take the active stack's next redo step.
    pub fn redo(&mut self) -> Option<HistoryEntry> {
        self.routes[self.active?].1.redo()
    }

    /// Whether the active stack can undo.
    pub fn can_undo(&self) -> bool {
        self.active
            .map(|index| self.routes[index].1.can_undo())
            .unwrap_or(false)
    }

    /// Whether the active stack can redo.
    pub fn can_redo(&self) -> bool {
        self.active
            .map(|index| self.routes[index].1.can_redo())
            .unwrap_or(false)
    }

    /// Clear every stack.
    pub fn clear(&mut self) {
        for (_, stack) in &mut self.routes {
            stack.clear();
        }
    }
}

impl<S> Default for UndoRouter<S> {
    fn default() -> Self {
        Self::new()
    }
}
