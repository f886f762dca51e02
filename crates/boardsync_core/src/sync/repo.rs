//! The optimistic synchronization engine.
//!
//! One [`ResourceRepo`] instance owns the full sync lifecycle for a set of
//! resource collections:
//!
//! - `init` seeds working and remote copies from one full fetch;
//! - `commit`/`commit_patches` apply local edits immediately, stamp version
//!   numbers, and arm the debounced push;
//! - `push` diffs working against remote into one batch, sends it, and
//!   reconciles the response per create/update/destroy group;
//! - `pull` refreshes from the server without discarding newer local edits;
//! - `apply_remote_delta` folds collaborator changes from the push channel
//!   into both copies as one transaction.
//!
//! Push and pull are serialized through one fair FIFO queue so they never
//! interleave; remote deltas bypass the queue but are each atomic. Request
//! failures are caught and logged at the queue boundary; callers of
//! `commit`/`commit_patches` are fire-and-forget. There is no automatic
//! retry after a transport failure; only a later local edit re-dirties the
//! push cycle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use indexmap::IndexMap;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::config::SyncConfig;
use crate::error::{BoardsyncError, Result};
use crate::observable::{ChangeListener, ListenerId, MutationSource, Observable};
use crate::patch::{Patch, PatchOp, PathSegment};
use crate::socket::ResourceDelta;

use super::{
    BatchMutation, BatchMutationResult, FetchQuery, FetchSelection, RequestState, ResourceAdapter,
    ResourceDiff, ResourceSets, require_resource_id, resource_id,
};

/// Options for [`ResourceRepo::commit`] and [`ResourceRepo::commit_patches`].
#[derive(Debug, Clone, Copy)]
pub struct CommitOptions {
    /// Do not arm the push debounce (bulk reloads, undo of synced state).
    pub skip_push: bool,
    /// Source tag delivered to working-copy subscribers.
    pub source: MutationSource,
}

impl Default for CommitOptions {
    fn default() -> Self {
        Self {
            skip_push: false,
            source: MutationSource::Edit,
        }
    }
}

/// Everything the engine mutates besides the working copy.
///
/// Private to the repo instance; cross-cutting coordination happens through
/// the head/version scheme, not through additional locking.
struct SyncState {
    /// Last confirmed server truth. Only server responses write here.
    remote: ResourceSets,
    /// Per-resource head value at the last local modification.
    versions: IndexMap<String, HashMap<String, u64>>,
    /// Monotonic push-generation counter.
    head: u64,
    request_state: RequestState,
    push_timer_armed: bool,
    dirty: bool,
}

/// Abstract optimistic sync engine over a [`ResourceAdapter`].
pub struct ResourceRepo<A: ResourceAdapter> {
    adapter: A,
    working: Observable<ResourceSets>,
    state: Mutex<SyncState>,
    /// Fair async mutex: pushes and pulls run strictly in arrival order.
    request_queue: tokio::sync::Mutex<()>,
    throttle: Duration,
    disposed: AtomicBool,
}

impl<A: ResourceAdapter> ResourceRepo<A> {
    /// Create a repo around `adapter`. Both copies start empty; call
    /// [`init`](ResourceRepo::init) before editing.
    pub fn new(adapter: A, config: &SyncConfig) -> Arc<Self> {
        let empty: ResourceSets = adapter
            .resource_names()
            .iter()
            .map(|name| (name.to_string(), IndexMap::new()))
            .collect();
        let versions = adapter
            .resource_names()
            .iter()
            .map(|name| (name.to_string(), HashMap::new()))
            .collect();
        Arc::new(Self {
            adapter,
            working: Observable::new(empty.clone()),
            state: Mutex::new(SyncState {
                remote: empty,
                versions,
                head: 0,
                request_state: RequestState::Idle,
                push_timer_armed: false,
                dirty: false,
            }),
            request_queue: tokio::sync::Mutex::new(()),
            throttle: config.push_throttle(),
            disposed: AtomicBool::new(false),
        })
    }

    /// The underlying adapter.
    pub fn adapter(&self) -> &A {
        &self.adapter
    }

    /// Seed both copies from one unconditional full fetch.
    ///
    /// Afterwards the working copy equals the remote copy, no push is
    /// pending, and the head counter is 1.
    pub async fn init(self: &Arc<Self>, cancel: Option<&CancellationToken>) -> Result<()> {
        let fetched = self.adapter.fetch(None, cancel).await?;
        let sets = self.normalized(fetched);
        {
            let mut state = self.state.lock().unwrap();
            state.remote = sets.clone();
        }
        self.commit(
            sets,
            CommitOptions {
                skip_push: true,
                source: MutationSource::Remote,
            },
        )?;
        self.state.lock().unwrap().head = 1;
        log::info!("[ResourceRepo] initialized");
        Ok(())
    }

    /// Replace the entire working copy.
    ///
    /// Every contained resource is stamped at the current head; unless
    /// `skip_push` is set, a push is scheduled.
    pub fn commit(self: &Arc<Self>, resources: ResourceSets, options: CommitOptions) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(BoardsyncError::Disposed);
        }
        let resources = self.normalized(resources);
        {
            let mut state = self.state.lock().unwrap();
            let head = state.head;
            state.versions = resources
                .iter()
                .map(|(name, by_id)| {
                    let stamps = by_id.keys().map(|id| (id.clone(), head)).collect();
                    (name.clone(), stamps)
                })
                .collect();
        }
        self.working.replace(options.source, resources)?;
        if !options.skip_push {
            self.request_push();
        }
        Ok(())
    }

    /// Apply fine-grained patches to the working copy.
    ///
    /// Used by undo/redo replays and by field-level local edits. Each patch
    /// must address a resource (`[collection, id, ...]`): a whole-resource
    /// remove drops the version stamp, everything else stamps the resource
    /// at the current head.
    pub fn commit_patches(self: &Arc<Self>, patches: &[Patch], options: CommitOptions) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(BoardsyncError::Disposed);
        }
        // Validate addressing before mutating anything.
        let mut stamps: Vec<(String, String, bool)> = Vec::with_capacity(patches.len());
        for patch in patches {
            let (Some(PathSegment::Key(name)), Some(PathSegment::Key(id))) =
                (patch.path.get(0), patch.path.get(1))
            else {
                return Err(BoardsyncError::InvalidPatchPath(patch.path.clone()));
            };
            if !self.adapter.resource_names().contains(&name.as_str()) {
                return Err(BoardsyncError::UnknownResource(name.clone()));
            }
            let removes_resource = patch.op == PatchOp::Remove && patch.path.len() == 2;
            stamps.push((name.clone(), id.clone(), removes_resource));
        }

        self.working.apply_patches(options.source, patches)?;

        {
            let mut state = self.state.lock().unwrap();
            let head = state.head;
            for (name, id, removes_resource) in stamps {
                let by_id = state.versions.entry(name).or_default();
                if removes_resource {
                    by_id.remove(&id);
                } else {
                    by_id.insert(id, head);
                }
            }
        }

        if !options.skip_push {
            self.request_push();
        }
        Ok(())
    }

    /// Arm the debounced push.
    ///
    /// If a timer is already armed or a push is in flight, this only marks
    /// the repo dirty; an armed timer is never reset.
    pub fn request_push(self: &Arc<Self>) {
        if self.disposed.load(Ordering::SeqCst) {
            return;
        }
        {
            let mut state = self.state.lock().unwrap();
            if state.push_timer_armed || state.request_state == RequestState::Pushing {
                state.dirty = true;
                return;
            }
            state.push_timer_armed = true;
        }
        let repo = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(repo.throttle).await;
            {
                let mut state = repo.state.lock().unwrap();
                state.push_timer_armed = false;
                state.dirty = false;
            }
            if repo.disposed.load(Ordering::SeqCst) {
                return;
            }
            if let Err(error) = repo.push().await {
                log::warn!("[ResourceRepo] push failed: {error}");
            }
        });
    }

    /// Push the current working/remote diff as one batch.
    ///
    /// Skips the network entirely when the diff is empty. Returns the
    /// server's per-group outcomes for UI surfacing (`None` for a no-op
    /// push). Transport errors propagate after the after-push bookkeeping
    /// has run; the scheduled-push task logs them.
    pub async fn push(self: &Arc<Self>) -> Result<Option<BatchMutationResult>> {
        let _guard = self.request_queue.lock().await;
        if self.disposed.load(Ordering::SeqCst) {
            return Ok(None);
        }
        self.state.lock().unwrap().request_state = RequestState::Pushing;
        let result = self.push_inner().await;
        let repush = {
            let mut state = self.state.lock().unwrap();
            state.request_state = RequestState::Idle;
            state.dirty
        };
        if repush {
            // Edits arrived during the round-trip; schedule the next cycle.
            self.request_push();
        }
        result
    }

    async fn push_inner(&self) -> Result<Option<BatchMutationResult>> {
        let (batch, commit_version) = {
            let mut state = self.state.lock().unwrap();
            let working = self.working.get();
            let mut batch = BatchMutation::default();
            for name in self.adapter.resource_names() {
                let diff = self.diff_for(name, &working, &state.remote)?;
                batch.0.insert(name.to_string(), diff);
            }
            if batch.is_empty() {
                log::debug!("[ResourceRepo] push skipped: no local changes");
                return Ok(None);
            }
            let commit_version = state.head;
            state.head += 1;
            (batch, commit_version)
        };

        log::debug!(
            "[ResourceRepo] pushing generation {} ({} collections)",
            commit_version,
            batch.0.len()
        );
        let result = self.adapter.mutate(&batch).await?;
        self.reconcile_push(&batch, &result, commit_version)?;
        Ok(Some(result))
    }

    /// Fold one batch response into both copies.
    ///
    /// Success groups write server truth into the remote copy and into the
    /// working copy only where the resource was not locally modified after
    /// the push was computed (`version <= commit_version`). Failure groups
    /// roll the affected subset of the working copy back to remote truth.
    /// All working-copy writes land as one notification.
    fn reconcile_push(
        &self,
        batch: &BatchMutation,
        result: &BatchMutationResult,
        commit_version: u64,
    ) -> Result<()> {
        let mut upserts: Vec<(String, String, Value)> = Vec::new();
        let mut removals: Vec<(String, String)> = Vec::new();

        {
            let mut state = self.state.lock().unwrap();
            for (name, diff) in &batch.0 {
                let fallback = super::MutationOutcome::default();
                let outcome = result.get(name).unwrap_or(&fallback);

                match &outcome.created {
                    Ok(records) => {
                        for record in records {
                            let id = require_resource_id(name, record)?.to_string();
                            let version = state
                                .versions
                                .get(name)
                                .and_then(|by_id| by_id.get(&id))
                                .copied()
                                .unwrap_or(0);
                            state
                                .remote
                                .entry(name.clone())
                                .or_default()
                                .insert(id.clone(), record.clone());
                            if version <= commit_version {
                                upserts.push((name.clone(), id, record.clone()));
                            }
                        }
                    }
                    Err(error) => {
                        log::warn!("[ResourceRepo] create group failed for '{name}': {error}");
                        for dto in &diff.create {
                            if let Some(id) = resource_id(dto) {
                                removals.push((name.clone(), id.to_string()));
                                if let Some(by_id) = state.versions.get_mut(name) {
                                    by_id.remove(id);
                                }
                            }
                        }
                    }
                }

                match &outcome.updated {
                    Ok(records) => {
                        for record in records {
                            let id = require_resource_id(name, record)?.to_string();
                            let version = state
                                .versions
                                .get(name)
                                .and_then(|by_id| by_id.get(&id))
                                .copied()
                                .unwrap_or(0);
                            state
                                .remote
                                .entry(name.clone())
                                .or_default()
                                .insert(id.clone(), record.clone());
                            if version <= commit_version {
                                upserts.push((name.clone(), id, record.clone()));
                            }
                        }
                    }
                    Err(error) => {
                        log::warn!("[ResourceRepo] update group failed for '{name}': {error}");
                        for id in diff.update.keys() {
                            if let Some(remote_value) =
                                state.remote.get(name).and_then(|by_id| by_id.get(id))
                            {
                                upserts.push((name.clone(), id.clone(), remote_value.clone()));
                            }
                        }
                    }
                }

                match &outcome.destroyed {
                    Ok(confirmed) => {
                        for id in &diff.destroy {
                            if confirmed.contains(id) {
                                if let Some(by_id) = state.remote.get_mut(name) {
                                    by_id.shift_remove(id);
                                }
                            } else if let Some(remote_value) =
                                state.remote.get(name).and_then(|by_id| by_id.get(id))
                            {
                                // Requested but not confirmed: revert the
                                // local deletion.
                                upserts.push((name.clone(), id.clone(), remote_value.clone()));
                            }
                        }
                    }
                    Err(error) => {
                        log::warn!("[ResourceRepo] destroy group failed for '{name}': {error}");
                        for id in &diff.destroy {
                            if let Some(remote_value) =
                                state.remote.get(name).and_then(|by_id| by_id.get(id))
                            {
                                upserts.push((name.clone(), id.clone(), remote_value.clone()));
                            }
                        }
                    }
                }
            }
        }

        if upserts.is_empty() && removals.is_empty() {
            return Ok(());
        }
        self.working.update(MutationSource::Remote, |draft| {
            for (name, id, record) in &upserts {
                draft.entry(name.clone()).or_default().insert(id.clone(), record.clone());
            }
            for (name, id) in &removals {
                if let Some(by_id) = draft.get_mut(name) {
                    by_id.shift_remove(id);
                }
            }
            Ok(())
        })?;
        Ok(())
    }

    /// Compute the working/remote diff for one collection.
    pub fn resource_diff(&self, name: &str) -> Result<ResourceDiff> {
        if !self.adapter.resource_names().contains(&name) {
            return Err(BoardsyncError::UnknownResource(name.to_string()));
        }
        let state = self.state.lock().unwrap();
        let working = self.working.get();
        self.diff_for(name, &working, &state.remote)
    }

    fn diff_for(
        &self,
        name: &str,
        working: &ResourceSets,
        remote: &ResourceSets,
    ) -> Result<ResourceDiff> {
        let empty = IndexMap::new();
        let local = working.get(name).unwrap_or(&empty);
        let confirmed = remote.get(name).unwrap_or(&empty);

        let mut diff = ResourceDiff::default();
        for (id, record) in local {
            match confirmed.get(id) {
                None => diff.create.push(self.adapter.create_params(name, record)?),
                Some(previous) => {
                    if let Some(dto) = self.adapter.update_params(name, record, previous)? {
                        diff.update.insert(id.clone(), dto);
                    }
                }
            }
        }
        for id in confirmed.keys() {
            if !local.contains_key(id) {
                diff.destroy.push(id.clone());
            }
        }
        Ok(diff)
    }

    /// Fetch server state and reconcile it.
    ///
    /// `query = None` refreshes everything. The remote copy takes the
    /// fetched truth unconditionally; the working copy only where the
    /// resource is absent locally or not modified in the current generation
    /// (`version < head`). Failures (including cancellation) are caught and
    /// logged here, leaving state unchanged.
    pub async fn pull(&self, query: Option<&FetchQuery>, cancel: Option<&CancellationToken>) {
        let _guard = self.request_queue.lock().await;
        if self.disposed.load(Ordering::SeqCst) {
            return;
        }
        self.state.lock().unwrap().request_state = RequestState::Pulling;
        let result = self.pull_inner(query, cancel).await;
        self.state.lock().unwrap().request_state = RequestState::Idle;
        if let Err(error) = result {
            log::warn!("[ResourceRepo] pull failed: {error}");
        }
    }

    async fn pull_inner(
        &self,
        query: Option<&FetchQuery>,
        cancel: Option<&CancellationToken>,
    ) -> Result<()> {
        let fetched = self.adapter.fetch(query, cancel).await?;

        let mut upserts: Vec<(String, String, Value)> = Vec::new();
        let mut removals: Vec<(String, String)> = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            let head = state.head;
            let pulled_stamp = head.saturating_sub(1);

            for name in self.adapter.resource_names() {
                let scope = match query {
                    None => Some(FetchSelection::All),
                    Some(map) => map.get(*name).cloned(),
                };
                let Some(scope) = scope else {
                    continue;
                };
                let empty = IndexMap::new();
                let incoming = fetched.get(*name).unwrap_or(&empty);

                // Created/updated: compare fetched values against remote.
                for (id, record) in incoming {
                    let known = state.remote.get(*name).and_then(|by_id| by_id.get(id));
                    if known == Some(record) {
                        continue;
                    }
                    state
                        .remote
                        .entry(name.to_string())
                        .or_default()
                        .insert(id.clone(), record.clone());
                    let version = state
                        .versions
                        .get(*name)
                        .and_then(|by_id| by_id.get(id))
                        .copied();
                    let exists_locally = self
                        .working
                        .with(|sets| sets.get(*name).is_some_and(|by_id| by_id.contains_key(id)));
                    if !exists_locally || version.unwrap_or(0) < head {
                        upserts.push((name.to_string(), id.clone(), record.clone()));
                        state
                            .versions
                            .entry(name.to_string())
                            .or_default()
                            .insert(id.clone(), pulled_stamp);
                    }
                }

                // Destroyed: expected ids the server no longer returned.
                let expected: Vec<String> = match &scope {
                    FetchSelection::All => state
                        .remote
                        .get(*name)
                        .map(|by_id| by_id.keys().cloned().collect())
                        .unwrap_or_default(),
                    FetchSelection::Ids(ids) => ids
                        .iter()
                        .filter(|id| {
                            state
                                .remote
                                .get(*name)
                                .is_some_and(|by_id| by_id.contains_key(*id))
                        })
                        .cloned()
                        .collect(),
                };
                for id in expected {
                    if incoming.contains_key(&id) {
                        continue;
                    }
                    if let Some(by_id) = state.remote.get_mut(*name) {
                        by_id.shift_remove(&id);
                    }
                    let version = state
                        .versions
                        .get(*name)
                        .and_then(|by_id| by_id.get(&id))
                        .copied()
                        .unwrap_or(0);
                    // A resource re-created (or touched) in the current
                    // generation survives the remote deletion.
                    if version >= head {
                        continue;
                    }
                    let exists_locally = self
                        .working
                        .with(|sets| sets.get(*name).is_some_and(|by_id| by_id.contains_key(&id)));
                    if exists_locally {
                        removals.push((name.to_string(), id.clone()));
                        if let Some(by_id) = state.versions.get_mut(*name) {
                            by_id.remove(&id);
                        }
                    }
                }
            }
        }

        if upserts.is_empty() && removals.is_empty() {
            return Ok(());
        }
        self.working.update(MutationSource::Remote, |draft| {
            for (name, id, record) in &upserts {
                draft.entry(name.clone()).or_default().insert(id.clone(), record.clone());
            }
            for (name, id) in &removals {
                if let Some(by_id) = draft.get_mut(name) {
                    by_id.shift_remove(id);
                }
            }
            Ok(())
        })?;
        Ok(())
    }

    /// Fold one remote push event into both copies as one transaction.
    ///
    /// `order` is the dependency order of collections: upserts apply in that
    /// order, removals in reverse, so a fold deleting a container together
    /// with its members never implies a dangling reference. The working copy
    /// is gated by the same staleness rule as pull.
    pub fn apply_remote_delta(
        &self,
        changes: &IndexMap<String, ResourceDelta>,
        order: &[&str],
    ) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Ok(());
        }
        let mut upserts: Vec<(String, String, Value)> = Vec::new();
        let mut removals: Vec<(String, String)> = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            let head = state.head;
            let pulled_stamp = head.saturating_sub(1);

            for name in order {
                let Some(delta) = changes.get(*name) else {
                    continue;
                };
                if !self.adapter.resource_names().contains(name) {
                    log::warn!("[ResourceRepo] remote delta for unknown collection '{name}'");
                    continue;
                }
                for record in &delta.upsert {
                    let id = require_resource_id(name, record)?.to_string();
                    state
                        .remote
                        .entry(name.to_string())
                        .or_default()
                        .insert(id.clone(), record.clone());
                    let version = state
                        .versions
                        .get(*name)
                        .and_then(|by_id| by_id.get(&id))
                        .copied();
                    let exists_locally = self
                        .working
                        .with(|sets| sets.get(*name).is_some_and(|by_id| by_id.contains_key(&id)));
                    if !exists_locally || version.unwrap_or(0) < head {
                        upserts.push((name.to_string(), id.clone(), record.clone()));
                        state
                            .versions
                            .entry(name.to_string())
                            .or_default()
                            .insert(id, pulled_stamp);
                    }
                }
            }
            for name in order.iter().rev() {
                let Some(delta) = changes.get(*name) else {
                    continue;
                };
                for id in &delta.remove {
                    if let Some(by_id) = state.remote.get_mut(*name) {
                        by_id.shift_remove(id);
                    }
                    let version = state
                        .versions
                        .get(*name)
                        .and_then(|by_id| by_id.get(id))
                        .copied()
                        .unwrap_or(0);
                    if version >= head {
                        continue;
                    }
                    let exists_locally = self
                        .working
                        .with(|sets| sets.get(*name).is_some_and(|by_id| by_id.contains_key(id)));
                    if exists_locally {
                        removals.push((name.to_string(), id.clone()));
                        if let Some(by_id) = state.versions.get_mut(*name) {
                            by_id.remove(id);
                        }
                    }
                }
            }
        }

        if upserts.is_empty() && removals.is_empty() {
            return Ok(());
        }
        self.working.update(MutationSource::Remote, |draft| {
            for (name, id, record) in &upserts {
                draft.entry(name.clone()).or_default().insert(id.clone(), record.clone());
            }
            for (name, id) in &removals {
                if let Some(by_id) = draft.get_mut(name) {
                    by_id.shift_remove(id);
                }
            }
            Ok(())
        })?;
        Ok(())
    }

    /// Detach the repo: pending timers become no-ops and no further
    /// synchronization is scheduled.
    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
        log::info!("[ResourceRepo] disposed");
    }

    /// Whether [`dispose`](ResourceRepo::dispose) has been called.
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Bulk-read the working copy (cold-start warm-up for a local mirror).
    pub fn snapshot(&self) -> ResourceSets {
        self.working.get()
    }

    /// Subscribe to the committed patch stream of the working copy.
    pub fn subscribe(&self, listener: ChangeListener) -> ListenerId {
        self.working.subscribe(listener)
    }

    /// Remove a working-copy subscription.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.working.unsubscribe(id)
    }

    /// Current head (push generation) value.
    pub fn head(&self) -> u64 {
        self.state.lock().unwrap().head
    }

    /// Current request lifecycle state.
    pub fn request_state(&self) -> RequestState {
        self.state.lock().unwrap().request_state
    }

    #[cfg(test)]
    fn remote_snapshot(&self) -> ResourceSets {
        self.state.lock().unwrap().remote.clone()
    }

    /// Keep only declared collections, warn about the rest, and make sure
    /// every declared collection has an entry.
    fn normalized(&self, sets: ResourceSets) -> ResourceSets {
        let names = self.adapter.resource_names();
        let mut normalized: ResourceSets = names
            .iter()
            .map(|name| (name.to_string(), IndexMap::new()))
            .collect();
        for (name, by_id) in sets {
            if let Some(slot) = normalized.get_mut(&name) {
                *slot = by_id;
            } else {
                log::warn!("[ResourceRepo] dropping undeclared collection '{name}'");
            }
        }
        normalized
    }
}

impl<A: ResourceAdapter> std::fmt::Debug for ResourceRepo<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("ResourceRepo")
            .field("head", &state.head)
            .field("request_state", &state.request_state)
            .field("dirty", &state.dirty)
            .finish()
    }
}
