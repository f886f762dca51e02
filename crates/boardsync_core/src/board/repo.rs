//! Concrete repo wiring for board documents.
//!
//! [`BoardAdapter`] implements the engine's [`ResourceAdapter`] contract on
//! top of an injected [`BoardApi`] client (the REST/batch transport lives
//! outside this crate). [`BoardRepo`] owns the engine plus the real-time
//! attachment: it subscribes to the [`SocketManager`] on `init` and folds
//! collaborator changes into the engine in dependency order.

use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::config::SyncConfig;
use crate::error::{BoardsyncError, Result};
use crate::observable::{ChangeListener, ListenerId};
use crate::patch::Patch;
use crate::socket::{SocketEvent, SocketManager, SocketSubscriptionId};
use crate::sync::{
    BatchMutation, BatchMutationResult, BoxFuture, CommitOptions, FetchQuery, MutationOutcome,
    RequestState, ResourceAdapter, ResourceDiff, ResourceRepo, ResourceSets,
};

use super::{BOARDS, Board, BoardLink, CARDS, Card, CardGroup, GROUPS, LINKS, RESOURCE_ORDER, STEPS, Step};

/// The batch API client a board repo talks to.
///
/// One call per collection; the engine's adapter walks collections in
/// dependency order so server-side reference resolution works (a card
/// created in the same cycle as its group lands first).
pub trait BoardApi: Send + Sync + 'static {
    /// Fetch server state, whole collections or exact id lists.
    fn fetch<'a>(
        &'a self,
        query: Option<&'a FetchQuery>,
        cancel: Option<&'a CancellationToken>,
    ) -> BoxFuture<'a, Result<ResourceSets>>;

    /// Send one collection's create/update/destroy groups.
    fn mutate_collection<'a>(
        &'a self,
        name: &'a str,
        diff: &'a ResourceDiff,
    ) -> BoxFuture<'a, Result<MutationOutcome>>;
}

/// [`ResourceAdapter`] for board documents.
pub struct BoardAdapter<C: BoardApi> {
    api: C,
}

impl<C: BoardApi> BoardAdapter<C> {
    /// Wrap an API client.
    pub fn new(api: C) -> Self {
        Self { api }
    }

    /// The wrapped API client.
    pub fn api(&self) -> &C {
        &self.api
    }
}

/// Validate a record against its typed shape and project it down to a
/// create DTO (server-owned fields stripped).
fn create_dto<T: DeserializeOwned + Serialize>(resource: &Value) -> Result<Value> {
    let typed: T = serde_json::from_value(resource.clone())?;
    let mut value = serde_json::to_value(&typed)?;
    if let Value::Object(map) = &mut value {
        map.remove("created_at");
        map.remove("updated_at");
    }
    Ok(value)
}

fn push_changed<T: PartialEq + Serialize>(
    dto: &mut Map<String, Value>,
    key: &str,
    next: &T,
    prev: &T,
) -> Result<()> {
    if next != prev {
        dto.insert(key.to_string(), serde_json::to_value(next)?);
    }
    Ok(())
}

fn finish_dto(dto: Map<String, Value>) -> Option<Value> {
    if dto.is_empty() {
        None
    } else {
        Some(Value::Object(dto))
    }
}

fn board_update_params(next: &Value, prev: &Value) -> Result<Option<Value>> {
    let next: Board = serde_json::from_value(next.clone())?;
    let prev: Board = serde_json::from_value(prev.clone())?;
    let mut dto = Map::new();
    push_changed(&mut dto, "title", &next.title, &prev.title)?;
    push_changed(&mut dto, "theme", &next.theme, &prev.theme)?;
    Ok(finish_dto(dto))
}

fn card_update_params(next: &Value, prev: &Value) -> Result<Option<Value>> {
    let next: Card = serde_json::from_value(next.clone())?;
    let prev: Card = serde_json::from_value(prev.clone())?;
    let mut dto = Map::new();
    match (&prev, &next) {
        (
            Card::Note {
                x: prev_x,
                y: prev_y,
                text: prev_text,
                color: prev_color,
                ..
            },
            Card::Note { x, y, text, color, .. },
        ) => {
            push_changed(&mut dto, "x", x, prev_x)?;
            push_changed(&mut dto, "y", y, prev_y)?;
            push_changed(&mut dto, "text", text, prev_text)?;
            push_changed(&mut dto, "color", color, prev_color)?;
        }
        (
            Card::Image {
                x: prev_x,
                y: prev_y,
                url: prev_url,
                width: prev_width,
                height: prev_height,
                ..
            },
            Card::Image {
                x,
                y,
                url,
                width,
                height,
                ..
            },
        ) => {
            push_changed(&mut dto, "x", x, prev_x)?;
            push_changed(&mut dto, "y", y, prev_y)?;
            push_changed(&mut dto, "url", url, prev_url)?;
            push_changed(&mut dto, "width", width, prev_width)?;
            push_changed(&mut dto, "height", height, prev_height)?;
        }
        _ => {
            return Err(BoardsyncError::CardKindChanged {
                id: next.id().to_string(),
                from: prev.kind().to_string(),
                to: next.kind().to_string(),
            });
        }
    }
    Ok(finish_dto(dto))
}

fn link_update_params(next: &Value, prev: &Value) -> Result<Option<Value>> {
    let next: BoardLink = serde_json::from_value(next.clone())?;
    let prev: BoardLink = serde_json::from_value(prev.clone())?;
    let mut dto = Map::new();
    push_changed(&mut dto, "from_card", &next.from_card, &prev.from_card)?;
    push_changed(&mut dto, "to_card", &next.to_card, &prev.to_card)?;
    push_changed(&mut dto, "label", &next.label, &prev.label)?;
    Ok(finish_dto(dto))
}

fn group_update_params(next: &Value, prev: &Value) -> Result<Option<Value>> {
    let next: CardGroup = serde_json::from_value(next.clone())?;
    let prev: CardGroup = serde_json::from_value(prev.clone())?;
    let mut dto = Map::new();
    push_changed(&mut dto, "title", &next.title, &prev.title)?;
    push_changed(&mut dto, "card_ids", &next.card_ids, &prev.card_ids)?;
    Ok(finish_dto(dto))
}

fn step_update_params(next: &Value, prev: &Value) -> Result<Option<Value>> {
    let next: Step = serde_json::from_value(next.clone())?;
    let prev: Step = serde_json::from_value(prev.clone())?;
    let mut dto = Map::new();
    push_changed(&mut dto, "rank", &next.rank, &prev.rank)?;
    push_changed(&mut dto, "target", &next.target, &prev.target)?;
    Ok(finish_dto(dto))
}

impl<C: BoardApi> ResourceAdapter for BoardAdapter<C> {
    fn resource_names(&self) -> &[&'static str] {
        &RESOURCE_ORDER
    }

    fn fetch<'a>(
        &'a self,
        query: Option<&'a FetchQuery>,
        cancel: Option<&'a CancellationToken>,
    ) -> BoxFuture<'a, Result<ResourceSets>> {
        self.api.fetch(query, cancel)
    }

    fn create_params(&self, name: &str, resource: &Value) -> Result<Value> {
        match name {
            // Boards come into being through the application shell, never
            // through the batch API.
            BOARDS => Err(BoardsyncError::NotCreatable(BOARDS.to_string())),
            CARDS => create_dto::<Card>(resource),
            LINKS => create_dto::<BoardLink>(resource),
            GROUPS => create_dto::<CardGroup>(resource),
            STEPS => create_dto::<Step>(resource),
            other => Err(BoardsyncError::UnknownResource(other.to_string())),
        }
    }

    fn update_params(&self, name: &str, next: &Value, prev: &Value) -> Result<Option<Value>> {
        match name {
            BOARDS => board_update_params(next, prev),
            CARDS => card_update_params(next, prev),
            LINKS => link_update_params(next, prev),
            GROUPS => group_update_params(next, prev),
            STEPS => step_update_params(next, prev),
            other => Err(BoardsyncError::UnknownResource(other.to_string())),
        }
    }

    fn mutate<'a>(&'a self, batch: &'a BatchMutation) -> BoxFuture<'a, Result<BatchMutationResult>> {
        Box::pin(async move {
            let mut result = BatchMutationResult::new();
            for name in RESOURCE_ORDER {
                let Some(diff) = batch.0.get(name) else {
                    continue;
                };
                if diff.is_empty() {
                    continue;
                }
                let outcome = self.api.mutate_collection(name, diff).await?;
                result.insert(name.to_string(), outcome);
            }
            Ok(result)
        })
    }
}

/// The concrete multi-resource repo for one board workspace.
pub struct BoardRepo<C: BoardApi> {
    engine: Arc<ResourceRepo<BoardAdapter<C>>>,
    socket: Arc<SocketManager>,
    socket_subscription: Mutex<Option<SocketSubscriptionId>>,
}

impl<C: BoardApi> BoardRepo<C> {
    /// Create a repo over an API client and a real-time hub.
    pub fn new(api: C, socket: Arc<SocketManager>, config: &SyncConfig) -> Arc<Self> {
        Arc::new(Self {
            engine: ResourceRepo::new(BoardAdapter::new(api), config),
            socket,
            socket_subscription: Mutex::new(None),
        })
    }

    /// Seed the engine and attach to the real-time channel.
    pub async fn init(self: &Arc<Self>, cancel: Option<&CancellationToken>) -> Result<()> {
        self.engine.init(cancel).await?;

        let engine = Arc::clone(&self.engine);
        let id = self.socket.subscribe(Arc::new(move |event| {
            if let SocketEvent::ResourcesChanged { changes } = event {
                if let Err(error) = engine.apply_remote_delta(changes, &RESOURCE_ORDER) {
                    log::warn!("[BoardRepo] failed to fold remote update: {error}");
                }
            }
        }));
        *self.socket_subscription.lock().unwrap() = Some(id);
        Ok(())
    }

    /// Detach from the real-time channel and stop synchronizing.
    pub fn dispose(&self) {
        if let Some(id) = self.socket_subscription.lock().unwrap().take() {
            self.socket.unsubscribe(id);
        }
        self.engine.dispose();
    }

    /// The underlying sync engine.
    pub fn engine(&self) -> &Arc<ResourceRepo<BoardAdapter<C>>> {
        &self.engine
    }

    /// Apply local edit patches. See [`ResourceRepo::commit_patches`].
    pub fn commit_patches(&self, patches: &[Patch], options: CommitOptions) -> Result<()> {
        self.engine.commit_patches(patches, options)
    }

    /// Replace the working copy. See [`ResourceRepo::commit`].
    pub fn commit(&self, resources: ResourceSets, options: CommitOptions) -> Result<()> {
        self.engine.commit(resources, options)
    }

    /// Push now. See [`ResourceRepo::push`].
    pub async fn push(&self) -> Result<Option<BatchMutationResult>> {
        self.engine.push().await
    }

    /// Refresh from the server. See [`ResourceRepo::pull`].
    pub async fn pull(&self, query: Option<&FetchQuery>, cancel: Option<&CancellationToken>) {
        self.engine.pull(query, cancel).await
    }

    /// Bulk-read the working copy.
    pub fn snapshot(&self) -> ResourceSets {
        self.engine.snapshot()
    }

    /// Subscribe to the committed patch stream.
    pub fn subscribe(&self, listener: ChangeListener) -> ListenerId {
        self.engine.subscribe(listener)
    }

    /// Remove a patch-stream subscription.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.engine.unsubscribe(id)
    }

    /// Compute one collection's pending diff.
    pub fn resource_diff(&self, name: &str) -> Result<ResourceDiff> {
        self.engine.resource_diff(name)
    }

    /// Current request lifecycle state.
    pub fn request_state(&self) -> RequestState {
        self.engine.request_state()
    }
}
