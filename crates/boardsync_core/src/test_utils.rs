//! Test utilities for boardsync_core
//!
//! Shared testing infrastructure: an in-memory server behind the
//! [`ResourceAdapter`] contract, with failure injection per mutation group
//! and a hold gate to keep requests in flight while a test edits state.

use std::sync::{Arc, Mutex};

use indexmap::IndexMap;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::board::{BoardApi, RESOURCE_ORDER};
use crate::error::{ApiError, BoardsyncError, Result};
use crate::sync::{
    BatchMutation, BatchMutationResult, BoxFuture, FetchQuery, FetchSelection, MutationOutcome,
    ResourceAdapter, ResourceDiff, ResourceSets,
};

/// Project server state through a fetch query.
fn select_sets(server: &ResourceSets, names: &[&str], query: Option<&FetchQuery>) -> ResourceSets {
    let mut sets = ResourceSets::new();
    for name in names {
        let Some(by_id) = server.get(*name) else {
            continue;
        };
        let selection = match query {
            None => Some(FetchSelection::All),
            Some(map) => map.get(*name).cloned(),
        };
        match selection {
            None => {}
            Some(FetchSelection::All) => {
                sets.insert(name.to_string(), by_id.clone());
            }
            Some(FetchSelection::Ids(ids)) => {
                let picked = ids
                    .iter()
                    .filter_map(|id| by_id.get(id).map(|v| (id.clone(), v.clone())))
                    .collect();
                sets.insert(name.to_string(), picked);
            }
        }
    }
    sets
}

/// Keeps mock requests in flight until the test releases them.
#[derive(Default)]
pub struct HoldGate {
    held: Mutex<bool>,
    notify: tokio::sync::Notify,
}

impl HoldGate {
    /// Make subsequent requests wait.
    pub fn hold(&self) {
        *self.held.lock().unwrap() = true;
    }

    /// Release all waiting requests.
    pub fn release(&self) {
        *self.held.lock().unwrap() = false;
        self.notify.notify_waiters();
    }

    /// Wait until released.
    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if !*self.held.lock().unwrap() {
                return;
            }
            notified.await;
        }
    }
}

/// An in-memory server implementing [`ResourceAdapter`].
///
/// Created resources are echoed back with a server-stamped `rev` field, so
/// tests can tell an authoritative echo from the optimistic row. Cloning
/// shares the underlying server state.
#[derive(Clone)]
pub struct TestAdapter {
    names: Vec<&'static str>,
    server: Arc<Mutex<ResourceSets>>,
    rev: Arc<Mutex<u64>>,
    mutate_calls: Arc<Mutex<Vec<BatchMutation>>>,
    fetch_calls: Arc<Mutex<usize>>,
    fail_created: Arc<Mutex<Option<ApiError>>>,
    fail_updated: Arc<Mutex<Option<ApiError>>>,
    fail_destroyed: Arc<Mutex<Option<ApiError>>>,
    fail_transport: Arc<Mutex<Option<ApiError>>>,
    /// Gate held across `fetch` and `mutate` calls.
    pub gate: Arc<HoldGate>,
}

impl TestAdapter {
    /// A fresh adapter with the given collection names and an empty server.
    pub fn new(names: &[&'static str]) -> Self {
        let server = names
            .iter()
            .map(|name| (name.to_string(), IndexMap::new()))
            .collect();
        Self {
            names: names.to_vec(),
            server: Arc::new(Mutex::new(server)),
            // Stamps start well above anything a test seeds by hand.
            rev: Arc::new(Mutex::new(100)),
            mutate_calls: Arc::new(Mutex::new(Vec::new())),
            fetch_calls: Arc::new(Mutex::new(0)),
            fail_created: Arc::new(Mutex::new(None)),
            fail_updated: Arc::new(Mutex::new(None)),
            fail_destroyed: Arc::new(Mutex::new(None)),
            fail_transport: Arc::new(Mutex::new(None)),
            gate: Arc::new(HoldGate::default()),
        }
    }

    /// Seed a server-side resource (builder pattern).
    pub fn with_resource(self, name: &str, resource: Value) -> Self {
        let id = resource["id"].as_str().expect("seed resource needs an id").to_string();
        self.server
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_default()
            .insert(id, resource);
        self
    }

    /// Overwrite a server-side resource directly (simulates another
    /// collaborator writing through a different channel).
    pub fn set_server_resource(&self, name: &str, resource: Value) {
        let id = resource["id"].as_str().expect("resource needs an id").to_string();
        self.server
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_default()
            .insert(id, resource);
    }

    /// Delete a server-side resource directly.
    pub fn delete_server_resource(&self, name: &str, id: &str) {
        if let Some(by_id) = self.server.lock().unwrap().get_mut(name) {
            by_id.shift_remove(id);
        }
    }

    /// Server-side record, for assertions.
    pub fn server_resource(&self, name: &str, id: &str) -> Option<Value> {
        self.server.lock().unwrap().get(name)?.get(id).cloned()
    }

    /// Number of `mutate` calls so far.
    pub fn mutate_count(&self) -> usize {
        self.mutate_calls.lock().unwrap().len()
    }

    /// Number of `fetch` calls so far.
    pub fn fetch_count(&self) -> usize {
        *self.fetch_calls.lock().unwrap()
    }

    /// The batch sent by the `n`th mutate call.
    pub fn sent_batch(&self, n: usize) -> BatchMutation {
        self.mutate_calls.lock().unwrap()[n].clone()
    }

    /// Fail the next created group(s) with this error.
    pub fn fail_created(&self, error: ApiError) {
        *self.fail_created.lock().unwrap() = Some(error);
    }

    /// Fail the next updated group(s) with this error.
    pub fn fail_updated(&self, error: ApiError) {
        *self.fail_updated.lock().unwrap() = Some(error);
    }

    /// Fail the next destroyed group(s) with this error.
    pub fn fail_destroyed(&self, error: ApiError) {
        *self.fail_destroyed.lock().unwrap() = Some(error);
    }

    /// Fail whole requests at the transport level.
    pub fn fail_transport(&self, error: ApiError) {
        *self.fail_transport.lock().unwrap() = Some(error);
    }

    fn next_rev(&self) -> u64 {
        let mut rev = self.rev.lock().unwrap();
        *rev += 1;
        *rev
    }
}

impl ResourceAdapter for TestAdapter {
    fn resource_names(&self) -> &[&'static str] {
        &self.names
    }

    fn fetch<'a>(
        &'a self,
        query: Option<&'a FetchQuery>,
        cancel: Option<&'a CancellationToken>,
    ) -> BoxFuture<'a, Result<ResourceSets>> {
        Box::pin(async move {
            *self.fetch_calls.lock().unwrap() += 1;
            if let Some(cancel) = cancel {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(BoardsyncError::Aborted),
                    _ = self.gate.wait() => {}
                }
            } else {
                self.gate.wait().await;
            }
            if let Some(error) = self.fail_transport.lock().unwrap().take() {
                return Err(error.into());
            }

            let server = self.server.lock().unwrap();
            Ok(select_sets(&server, &self.names, query))
        })
    }

    fn create_params(&self, _name: &str, resource: &Value) -> Result<Value> {
        Ok(resource.clone())
    }

    fn update_params(&self, _name: &str, next: &Value, prev: &Value) -> Result<Option<Value>> {
        let (Value::Object(next_map), Value::Object(prev_map)) = (next, prev) else {
            return Ok(Some(next.clone()));
        };
        let mut dto = serde_json::Map::new();
        for (key, value) in next_map {
            if key == "id" {
                continue;
            }
            if prev_map.get(key) != Some(value) {
                dto.insert(key.clone(), value.clone());
            }
        }
        if dto.is_empty() {
            Ok(None)
        } else {
            Ok(Some(Value::Object(dto)))
        }
    }

    fn mutate<'a>(&'a self, batch: &'a BatchMutation) -> BoxFuture<'a, Result<BatchMutationResult>> {
        Box::pin(async move {
            self.mutate_calls.lock().unwrap().push(batch.clone());
            self.gate.wait().await;
            if let Some(error) = self.fail_transport.lock().unwrap().take() {
                return Err(error.into());
            }

            let fail_created = self.fail_created.lock().unwrap().take();
            let fail_updated = self.fail_updated.lock().unwrap().take();
            let fail_destroyed = self.fail_destroyed.lock().unwrap().take();

            let mut server = self.server.lock().unwrap();
            let mut result = BatchMutationResult::new();
            for (name, diff) in &batch.0 {
                let created = match &fail_created {
                    Some(error) if !diff.create.is_empty() => Err(error.clone()),
                    _ => {
                        let mut echoes = Vec::new();
                        for dto in &diff.create {
                            let id = dto["id"].as_str().expect("create dto needs an id");
                            let mut record = dto.clone();
                            record["rev"] = json!(self.next_rev());
                            server
                                .entry(name.clone())
                                .or_default()
                                .insert(id.to_string(), record.clone());
                            echoes.push(record);
                        }
                        Ok(echoes)
                    }
                };

                let updated = match &fail_updated {
                    Some(error) if !diff.update.is_empty() => Err(error.clone()),
                    _ => {
                        let mut echoes = Vec::new();
                        for (id, dto) in &diff.update {
                            let Some(record) =
                                server.get_mut(name).and_then(|by_id| by_id.get_mut(id))
                            else {
                                continue;
                            };
                            if let (Value::Object(record_map), Value::Object(dto_map)) =
                                (&mut *record, dto)
                            {
                                for (key, value) in dto_map {
                                    record_map.insert(key.clone(), value.clone());
                                }
                            }
                            record["rev"] = json!(self.next_rev());
                            echoes.push(record.clone());
                        }
                        Ok(echoes)
                    }
                };

                let destroyed = match &fail_destroyed {
                    Some(error) if !diff.destroy.is_empty() => Err(error.clone()),
                    _ => {
                        let mut confirmed = Vec::new();
                        for id in &diff.destroy {
                            let removed = server
                                .get_mut(name)
                                .and_then(|by_id| by_id.shift_remove(id))
                                .is_some();
                            if removed {
                                confirmed.push(id.clone());
                            }
                        }
                        Ok(confirmed)
                    }
                };

                result.insert(
                    name.clone(),
                    MutationOutcome {
                        created,
                        updated,
                        destroyed,
                    },
                );
            }
            Ok(result)
        })
    }
}

/// An in-memory board server implementing [`BoardApi`].
///
/// Records the order of per-collection mutate calls so ordering constraints
/// can be asserted. Cloning shares the underlying server state.
#[derive(Clone)]
pub struct MockBoardApi {
    server: Arc<Mutex<ResourceSets>>,
    calls: Arc<Mutex<Vec<String>>>,
    rev: Arc<Mutex<u64>>,
}

impl MockBoardApi {
    /// A fresh API with every board collection empty.
    pub fn new() -> Self {
        let server = RESOURCE_ORDER
            .iter()
            .map(|name| (name.to_string(), IndexMap::new()))
            .collect();
        Self {
            server: Arc::new(Mutex::new(server)),
            calls: Arc::new(Mutex::new(Vec::new())),
            rev: Arc::new(Mutex::new(100)),
        }
    }

    /// Seed a server-side resource (builder pattern).
    pub fn with_resource(self, name: &str, resource: Value) -> Self {
        let id = resource["id"].as_str().expect("seed resource needs an id").to_string();
        self.server
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_default()
            .insert(id, resource);
        self
    }

    /// Server-side record, for assertions.
    pub fn server_resource(&self, name: &str, id: &str) -> Option<Value> {
        self.server.lock().unwrap().get(name)?.get(id).cloned()
    }

    /// Collection names in the order `mutate_collection` was called.
    pub fn call_order(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn next_rev(&self) -> u64 {
        let mut rev = self.rev.lock().unwrap();
        *rev += 1;
        *rev
    }
}

impl Default for MockBoardApi {
    fn default() -> Self {
        Self::new()
    }
}

impl BoardApi for MockBoardApi {
    fn fetch<'a>(
        &'a self,
        query: Option<&'a FetchQuery>,
        _cancel: Option<&'a CancellationToken>,
    ) -> BoxFuture<'a, Result<ResourceSets>> {
        Box::pin(async move {
            let server = self.server.lock().unwrap();
            Ok(select_sets(&server, &RESOURCE_ORDER, query))
        })
    }

    fn mutate_collection<'a>(
        &'a self,
        name: &'a str,
        diff: &'a ResourceDiff,
    ) -> BoxFuture<'a, Result<MutationOutcome>> {
        Box::pin(async move {
            self.calls.lock().unwrap().push(name.to_string());

            let mut server = self.server.lock().unwrap();

            let mut created = Vec::new();
            for dto in &diff.create {
                let id = dto["id"].as_str().expect("create dto needs an id");
                let mut record = dto.clone();
                record["rev"] = json!(self.next_rev());
                server
                    .entry(name.to_string())
                    .or_default()
                    .insert(id.to_string(), record.clone());
                created.push(record);
            }

            let mut updated = Vec::new();
            for (id, dto) in &diff.update {
                let Some(record) = server.get_mut(name).and_then(|by_id| by_id.get_mut(id)) else {
                    continue;
                };
                if let (Value::Object(record_map), Value::Object(dto_map)) = (&mut *record, dto) {
                    for (key, value) in dto_map {
                        record_map.insert(key.clone(), value.clone());
                    }
                }
                record["rev"] = json!(self.next_rev());
                updated.push(record.clone());
            }

            let mut destroyed = Vec::new();
            for id in &diff.destroy {
                let removed = server
                    .get_mut(name)
                    .and_then(|by_id| by_id.shift_remove(id))
                    .is_some();
                if removed {
                    destroyed.push(id.clone());
                }
            }

            Ok(MutationOutcome {
                created: Ok(created),
                updated: Ok(updated),
                destroyed: Ok(destroyed),
            })
        })
    }
}
