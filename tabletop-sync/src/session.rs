//! A client's view of one shared board.
//!
//! `BoardSession` ties the engine together:
//!
//! ```text
//!  request_* / update ─► flatten ─► find_deletions ─► DeltaQueue ─► RemoteStore
//!                                                                       │
//!  PieceHandler ◄─ Dispatcher ◄─ unflatten(added) ◄─ LocalMirror ◄─ listener task
//! ```
//!
//! Local requests never touch the mirror or the handlers directly. Every
//! change, including this client's own, is applied when the store reports it
//! back, so all clients see the same sequence of events. Until then an
//! outgoing write is only tracked as pending, so a later delete still finds
//! every key it has to remove.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde_json::{json, Map, Value};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::codec::{flatten, sequence_items, unflatten, FlatMap};
use crate::config::SyncConfig;
use crate::deletions::{find_deletions, find_stale_tombstones};
use crate::dispatch::{DispatchReport, Dispatcher, PieceListener};
use crate::document::{DocumentPiece, WorldDocument};
use crate::error::SyncError;
use crate::mirror::{LocalMirror, PendingWrites, GENERATION_KEY};
use crate::piece::{
    flag_value, normalize_orientation, number_value, parse_index, Piece, PieceIndex,
};
use crate::queue::{DeltaBatch, DeltaQueue, QueueStats};
use crate::remote::{RemoteStore, StateChange};

/// Events emitted by a running session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The whole world was replaced.
    WorldReset { pieces: usize },
    /// Notifications were missed; state was reloaded from the store.
    Resynced { pieces: usize },
    /// The store stopped delivering notifications.
    Closed,
}

/// Outcome of [`BoardSession::start`].
#[derive(Debug)]
pub struct SessionStart {
    /// Live pieces found in the initial state.
    pub pieces: usize,
    pub generation: Option<u64>,
    pub report: DispatchReport,
}

impl SessionStart {
    /// An empty world usually means the caller should load a default board.
    pub fn is_empty_world(&self) -> bool {
        self.pieces == 0
    }
}

/// Session counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub mirror_keys: usize,
    /// Submitted keys not yet reported back by the store.
    pub pending_writes: usize,
    pub tombstones: usize,
    pub live_pieces: usize,
    pub notifications: u64,
    pub queue: QueueStats,
}

/// State touched by the listener task and by local requests.
struct SessionState {
    mirror: LocalMirror,
    pending: PendingWrites,
    dispatcher: Dispatcher,
    notifications: u64,
}

impl SessionState {
    fn apply_remote_delta(&mut self, added: &FlatMap, removed: &[String]) -> DispatchReport {
        self.notifications += 1;
        self.mirror.apply(added.iter(), removed.iter());
        self.pending.acknowledge(added.iter());

        let decoded = unflatten(added);
        for err in &decoded.rejected {
            log::warn!("Ignoring key in remote delta: {err}");
        }
        let mut report = self.dispatcher.execute_world_update(&decoded.value);
        report.rejected.extend(decoded.rejected);
        report
    }

    /// Replace everything with a fresh snapshot of the store.
    fn load_snapshot(&mut self, snapshot: FlatMap) -> DispatchReport {
        self.pending.acknowledge_snapshot(&snapshot);
        self.mirror.reset(snapshot);
        let decoded = unflatten(self.mirror.entries());
        let mut report = self.dispatcher.execute_world_reset(&decoded.value);
        report.rejected.extend(decoded.rejected);
        report
    }

    /// Removals that must travel with `updates`, judged against both the
    /// mirror and the writes still in flight. Records `updates` as pending.
    fn prepare_outgoing(&mut self, updates: &FlatMap) -> Vec<String> {
        let pending = self.pending.as_mirror();
        let mut deletions = find_deletions(updates, &self.mirror);
        deletions.extend(find_deletions(updates, pending));
        deletions.extend(find_stale_tombstones(updates, &self.mirror));
        deletions.extend(find_stale_tombstones(updates, pending));
        deletions.sort();
        deletions.dedup();
        self.pending.record(updates);
        deletions
    }

    fn live_pieces(&self) -> BTreeMap<PieceIndex, Value> {
        let decoded = unflatten(self.mirror.entries()).value;
        let mut pieces = BTreeMap::new();
        if let Some(Value::Object(map)) = decoded.get("pieces") {
            for (key, value) in map {
                if let (Some(index), true) = (parse_index(key), value.is_object()) {
                    pieces.insert(index, value.clone());
                }
            }
        }
        pieces
    }
}

/// One client's connection to a shared board.
pub struct BoardSession {
    config: SyncConfig,
    store: Arc<dyn RemoteStore>,
    queue: DeltaQueue,
    state: Arc<Mutex<SessionState>>,
    listener_task: Option<JoinHandle<()>>,
    event_tx: mpsc::Sender<SessionEvent>,
    event_rx: Option<mpsc::Receiver<SessionEvent>>,
}

impl BoardSession {
    pub fn new(store: Arc<dyn RemoteStore>, config: SyncConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(config.notification_capacity.max(1));
        Self {
            queue: DeltaQueue::new(store.clone(), config.queue.clone()),
            config,
            store,
            state: Arc::new(Mutex::new(SessionState {
                mirror: LocalMirror::new(),
                pending: PendingWrites::new(),
                dispatcher: Dispatcher::new(),
                notifications: 0,
            })),
            listener_task: None,
            event_tx,
            event_rx: Some(event_rx),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.config.client_id
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SessionEvent>> {
        self.event_rx.take()
    }

    /// Set the callback that learns about new pieces. Set it before
    /// [`start`](Self::start) to see the pieces of the initial state.
    pub async fn set_piece_listener(&self, listener: impl PieceListener + 'static) {
        self.state.lock().await.dispatcher.set_listener(listener);
    }

    /// Load the initial state and start following change notifications.
    ///
    /// Subscribes before fetching the snapshot so no change is missed; a
    /// change already contained in the snapshot is applied a second time,
    /// which leaves the mirror unchanged.
    pub async fn start(&mut self) -> SessionStart {
        if let Some(task) = self.listener_task.take() {
            task.abort();
        }

        let receiver = self.store.subscribe();
        let snapshot = self.store.initial_state();

        let start = {
            let mut state = self.state.lock().await;
            let report = state.load_snapshot(snapshot);
            SessionStart {
                pieces: state.live_pieces().len(),
                generation: state.mirror.generation(),
                report,
            }
        };
        if start.is_empty_world() {
            log::info!("Session {} started on an empty world", self.config.client_id);
        } else {
            log::info!(
                "Session {} started with {} pieces",
                self.config.client_id,
                start.pieces
            );
        }

        self.listener_task = Some(tokio::spawn(listen(
            receiver,
            self.state.clone(),
            self.store.clone(),
            self.event_tx.clone(),
        )));
        start
    }

    /// Whether the listener task is running.
    pub fn is_running(&self) -> bool {
        self.listener_task
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Stop following notifications. Queued deltas are still delivered.
    pub fn shutdown(&mut self) {
        if let Some(task) = self.listener_task.take() {
            task.abort();
            log::debug!("Session {} stopped", self.config.client_id);
        }
    }

    /// Apply a change notification by hand. The listener task does this for
    /// every notification the store delivers.
    pub async fn apply_remote_delta(&self, added: &FlatMap, removed: &[String]) -> DispatchReport {
        self.state.lock().await.apply_remote_delta(added, removed)
    }

    /// Send a nested world update.
    ///
    /// Tombstones in `update` also remove the stored children of the
    /// tombstoned key, and live writes under an old tombstone remove that
    /// tombstone. Returns the number of deltas queued.
    pub async fn update(&self, update: &Value) -> Result<usize, SyncError> {
        let updates = flatten(update);
        let deletions = self.state.lock().await.prepare_outgoing(&updates);
        self.queue.submit(DeltaBatch::new(updates, deletions)).await
    }

    /// Replace the whole world with an empty one.
    ///
    /// Bumps the generation marker and removes every other key, tombstones
    /// and writes still in flight included. Returns the new generation.
    pub async fn replace_world(&self) -> Result<u64, SyncError> {
        let mut updates = FlatMap::new();
        let (generation, deletions): (u64, Vec<String>) = {
            let mut state = self.state.lock().await;
            let known = state.mirror.generation();
            let generation = state.pending.as_mirror().generation().max(known).unwrap_or(0) + 1;
            let deletions: BTreeSet<String> = state
                .mirror
                .keys()
                .chain(state.pending.as_mirror().keys())
                .filter(|key| key.as_str() != GENERATION_KEY)
                .cloned()
                .collect();
            updates.insert(GENERATION_KEY.to_string(), generation.to_string());
            state.pending.record(&updates);
            (generation, deletions.into_iter().collect())
        };
        log::info!(
            "Replacing world: generation {generation}, removing {} keys",
            deletions.len()
        );

        self.queue.submit(DeltaBatch::new(updates, deletions)).await?;
        Ok(generation)
    }

    /// Write `value` as the state (or partial state) of piece `index`.
    /// `Value::Null` deletes the piece.
    pub async fn update_piece(&self, index: PieceIndex, value: Value) -> Result<usize, SyncError> {
        let mut pieces = Map::new();
        pieces.insert(index.to_string(), value);
        self.update(&json!({ "pieces": pieces })).await
    }

    /// Add a piece under a freshly allocated index.
    pub async fn add_piece(&self, value: Value) -> Result<PieceIndex, SyncError> {
        let index = self.state.lock().await.dispatcher.allocate_next_index();
        self.update_piece(index, value).await?;
        Ok(index)
    }

    /// Same as [`update_piece`](Self::update_piece).
    ///
    /// The store cannot take large batches, so updates are not accumulated:
    /// each call is sent on its own.
    pub async fn update_piece_accumulate(
        &self,
        index: PieceIndex,
        value: Value,
    ) -> Result<usize, SyncError> {
        self.update_piece(index, value).await
    }

    /// Counterpart of [`update_piece_accumulate`](Self::update_piece_accumulate).
    /// Nothing is ever held back, so there is nothing to flush.
    pub fn flush_accumulated(&self) {}

    pub async fn request_add_piece(
        &self,
        faces: Vec<String>,
        x: f64,
        y: f64,
    ) -> Result<PieceIndex, SyncError> {
        self.add_piece(Piece::new(faces, x, y).to_value()).await
    }

    /// Move a piece. `client_id` is stamped on the move so the issuing
    /// client can recognize its own echo.
    pub async fn request_move_piece(
        &self,
        index: PieceIndex,
        client_id: &str,
        x: f64,
        y: f64,
    ) -> Result<usize, SyncError> {
        let delta = json!({
            "x": number_value(x),
            "y": number_value(y),
            "client": client_id,
        });
        self.update_piece(index, delta).await
    }

    pub async fn request_set_lock(&self, index: PieceIndex, lock: bool) -> Result<usize, SyncError> {
        self.update_piece(index, json!({ "lock": flag_value(lock) }))
            .await
    }

    pub async fn request_set_orientation(
        &self,
        index: PieceIndex,
        degrees: f64,
    ) -> Result<usize, SyncError> {
        let orientation = number_value(normalize_orientation(degrees));
        self.update_piece(index, json!({ "orientation": orientation }))
            .await
    }

    pub async fn request_delete_piece(&self, index: PieceIndex) -> Result<usize, SyncError> {
        self.update_piece(index, Value::Null).await
    }

    /// Load a saved board, either replacing the world or adding to it.
    ///
    /// Pieces get consecutive indices from `0` when replacing, or after the
    /// highest known index otherwise. Returns the indices used.
    pub async fn load_document(
        &self,
        document: &WorldDocument,
        clear_world: bool,
    ) -> Result<Vec<PieceIndex>, SyncError> {
        let pieces = document.require_pieces()?;

        let mut next = if clear_world {
            self.replace_world().await?;
            0
        } else {
            let state = self.state.lock().await;
            state.dispatcher.max_known_index().map_or(0, |max| max + 1)
        };

        let mut indices = Vec::with_capacity(pieces.len());
        for piece in pieces {
            self.state.lock().await.dispatcher.observe_index(next);
            self.update_piece(next, piece.to_value()).await?;
            indices.push(next);
            next += 1;
        }
        log::info!("Loaded {} pieces from board document", indices.len());
        Ok(indices)
    }

    /// Saved-board form of the current mirror, pieces in index order.
    pub async fn export_document(&self) -> WorldDocument {
        let pieces = self.state.lock().await.live_pieces();
        WorldDocument::new(
            pieces
                .values()
                .filter_map(DocumentPiece::from_value)
                .collect(),
        )
    }

    /// Live pieces as last reported by the store.
    pub async fn pieces(&self) -> BTreeMap<PieceIndex, Piece> {
        self.state
            .lock()
            .await
            .live_pieces()
            .into_iter()
            .filter_map(|(index, value)| Piece::from_value(&value).map(|piece| (index, piece)))
            .collect()
    }

    pub async fn piece(&self, index: PieceIndex) -> Option<Piece> {
        self.pieces().await.remove(&index)
    }

    /// Faces of piece `index`, in order.
    pub async fn piece_faces(&self, index: PieceIndex) -> Vec<String> {
        let pieces = self.state.lock().await.live_pieces();
        pieces
            .get(&index)
            .and_then(|piece| piece.get("faces"))
            .map(|faces| {
                sequence_items(faces)
                    .into_iter()
                    .filter_map(|f| f.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Copy of the local mirror.
    pub async fn mirror(&self) -> LocalMirror {
        self.state.lock().await.mirror.clone()
    }

    pub async fn max_known_index(&self) -> Option<PieceIndex> {
        self.state.lock().await.dispatcher.max_known_index()
    }

    /// Indices that currently have a registered handler.
    pub async fn registered_pieces(&self) -> Vec<PieceIndex> {
        self.state.lock().await.dispatcher.registry().indices()
    }

    /// Wait until every queued delta has been handed to the store.
    pub async fn wait_idle(&self) {
        self.queue.wait_idle().await;
    }

    pub async fn stats(&self) -> SessionStats {
        let queue = self.queue.stats().await;
        let state = self.state.lock().await;
        SessionStats {
            mirror_keys: state.mirror.len(),
            pending_writes: state.pending.len(),
            tombstones: state.mirror.tombstone_count(),
            live_pieces: state.live_pieces().len(),
            notifications: state.notifications,
            queue,
        }
    }
}

impl Drop for BoardSession {
    fn drop(&mut self) {
        if let Some(task) = self.listener_task.take() {
            task.abort();
        }
    }
}

/// Listener task: applies every notification in delivery order.
async fn listen(
    mut receiver: broadcast::Receiver<Arc<StateChange>>,
    state: Arc<Mutex<SessionState>>,
    store: Arc<dyn RemoteStore>,
    events: mpsc::Sender<SessionEvent>,
) {
    loop {
        match receiver.recv().await {
            Ok(change) => {
                let mut state = state.lock().await;
                let report = state.apply_remote_delta(&change.added_map(), &change.removed);
                if report.reset {
                    let pieces = state.dispatcher.registry().len();
                    drop(state);
                    let _ = events.try_send(SessionEvent::WorldReset { pieces });
                }
            }
            Err(RecvError::Lagged(missed)) => {
                log::warn!("Missed {missed} change notifications, reloading state");
                let mut state = state.lock().await;
                state.load_snapshot(store.initial_state());
                let pieces = state.live_pieces().len();
                drop(state);
                let _ = events.try_send(SessionEvent::Resynced { pieces });
            }
            Err(RecvError::Closed) => {
                log::info!("Change notifications closed");
                let _ = events.try_send(SessionEvent::Closed);
                break;
            }
        }
    }
}
