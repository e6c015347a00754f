//! Turns decoded world updates into per-piece events.
//!
//! ```text
//! decoded update ──► Dispatcher ──┬─► PieceListener::on_new_piece   (add)
//!                                 ├─► PieceHandler::on_update       (update)
//!                                 └─► PieceHandler::on_delete       (delete / reset)
//! ```
//!
//! The registry holds exactly one handler per live piece: a handler is
//! registered when the listener accepts a new piece and dropped when the
//! piece is deleted or the whole world is replaced. A later non-null update
//! for a deleted index is therefore a fresh add.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::error::SyncError;
use crate::mirror::GENERATION_KEY;
use crate::piece::{parse_index, PieceIndex};

/// Receives the events of one piece.
pub trait PieceHandler: Send {
    /// A change to the piece; only the fields present changed.
    fn on_update(&mut self, delta: &Value);

    /// The piece is gone. The handler is dropped right after this call.
    fn on_delete(&mut self);
}

/// Learns about new pieces and supplies their handlers.
pub trait PieceListener: Send {
    /// A piece appeared at `index`. Returning a handler registers it for
    /// that index; returning `None` leaves the index unregistered.
    fn on_new_piece(&mut self, index: PieceIndex, data: &Value) -> Option<Box<dyn PieceHandler>>;
}

impl<F> PieceListener for F
where
    F: FnMut(PieceIndex, &Value) -> Option<Box<dyn PieceHandler>> + Send,
{
    fn on_new_piece(&mut self, index: PieceIndex, data: &Value) -> Option<Box<dyn PieceHandler>> {
        self(index, data)
    }
}

/// Live piece handlers keyed by index.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: BTreeMap<PieceIndex, Box<dyn PieceHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, index: PieceIndex, handler: Box<dyn PieceHandler>) {
        if self.handlers.insert(index, handler).is_some() {
            log::debug!("Replaced handler for piece {index}");
        }
    }

    pub fn deregister(&mut self, index: PieceIndex) -> Option<Box<dyn PieceHandler>> {
        self.handlers.remove(&index)
    }

    pub fn contains(&self, index: PieceIndex) -> bool {
        self.handlers.contains_key(&index)
    }

    pub fn get_mut(&mut self, index: PieceIndex) -> Option<&mut Box<dyn PieceHandler>> {
        self.handlers.get_mut(&index)
    }

    pub fn indices(&self) -> Vec<PieceIndex> {
        self.handlers.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    fn drain(&mut self) -> impl Iterator<Item = (PieceIndex, Box<dyn PieceHandler>)> {
        std::mem::take(&mut self.handlers).into_iter()
    }
}

/// What a single update did.
#[derive(Debug, Default)]
pub struct DispatchReport {
    /// The update replaced the whole world.
    pub reset: bool,
    pub added: Vec<PieceIndex>,
    pub updated: Vec<PieceIndex>,
    pub deleted: Vec<PieceIndex>,
    /// Entries for unregistered pieces that carried no piece data.
    pub ignored: Vec<PieceIndex>,
    pub rejected: Vec<SyncError>,
}

impl DispatchReport {
    pub fn is_noop(&self) -> bool {
        !self.reset
            && self.added.is_empty()
            && self.updated.is_empty()
            && self.deleted.is_empty()
    }
}

/// Reconciles decoded updates against the handler registry.
#[derive(Default)]
pub struct Dispatcher {
    registry: HandlerRegistry,
    listener: Option<Box<dyn PieceListener>>,
    max_index: Option<PieceIndex>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_listener(listener: impl PieceListener + 'static) -> Self {
        Self {
            listener: Some(Box::new(listener)),
            ..Self::default()
        }
    }

    pub fn set_listener(&mut self, listener: impl PieceListener + 'static) {
        self.listener = Some(Box::new(listener));
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Highest piece index seen so far, if any.
    pub fn max_known_index(&self) -> Option<PieceIndex> {
        self.max_index
    }

    /// Reserve the next piece index.
    ///
    /// Two clients allocating before either one's write lands can pick the
    /// same index; that collision is accepted.
    pub fn allocate_next_index(&mut self) -> PieceIndex {
        let next = self.max_index.map_or(0, |max| max + 1);
        self.max_index = Some(next);
        next
    }

    /// Raise the allocator to at least `index`.
    pub fn observe_index(&mut self, index: PieceIndex) {
        if self.max_index.map_or(true, |max| index > max) {
            self.max_index = Some(index);
        }
    }

    /// Dispatch one decoded update (an incremental delta or a full snapshot).
    ///
    /// A non-composite update, or one carrying the generation marker,
    /// replaces the whole world. Shapes without `pieces` are ignored.
    pub fn execute_world_update(&mut self, update: &Value) -> DispatchReport {
        let mut report = DispatchReport::default();

        if Self::is_world_reset(update) {
            self.reset_world(update, &mut report);
        } else if let Some(pieces) = update.get("pieces") {
            for (index, value) in Self::indexed_entries(pieces, &mut report) {
                self.dispatch_piece(index, value, &mut report);
            }
        }

        if !report.rejected.is_empty() {
            log::warn!("Skipped {} malformed piece entries", report.rejected.len());
        }
        report
    }

    /// Treat `world` as a full snapshot regardless of its shape: every
    /// registered piece is deleted, then the snapshot's pieces are added.
    pub fn execute_world_reset(&mut self, world: &Value) -> DispatchReport {
        let mut report = DispatchReport::default();
        self.reset_world(world, &mut report);
        report
    }

    fn is_world_reset(update: &Value) -> bool {
        match update {
            Value::Object(map) => map.contains_key(GENERATION_KEY),
            Value::Array(_) => false,
            _ => true,
        }
    }

    fn reset_world(&mut self, update: &Value, report: &mut DispatchReport) {
        report.reset = true;
        self.max_index = None;

        for (index, mut handler) in self.registry.drain() {
            handler.on_delete();
            report.deleted.push(index);
        }
        log::info!("World replaced, removed {} pieces", report.deleted.len());

        if let Some(pieces) = update.get("pieces") {
            for (index, value) in Self::indexed_entries(pieces, report) {
                self.observe_index(index);
                if is_composite(value) {
                    self.add_piece(index, value, report);
                }
            }
        }
    }

    fn dispatch_piece(&mut self, index: PieceIndex, value: &Value, report: &mut DispatchReport) {
        if is_composite(value) && !self.registry.contains(index) {
            self.add_piece(index, value, report);
            return;
        }

        let Some(handler) = self.registry.get_mut(index) else {
            report.ignored.push(index);
            return;
        };
        if value.is_null() {
            handler.on_delete();
            self.registry.deregister(index);
            report.deleted.push(index);
        } else {
            handler.on_update(value);
            report.updated.push(index);
        }
    }

    fn add_piece(&mut self, index: PieceIndex, value: &Value, report: &mut DispatchReport) {
        self.observe_index(index);
        report.added.push(index);
        let Some(listener) = self.listener.as_mut() else {
            log::debug!("No listener for new piece {index}");
            return;
        };
        if let Some(handler) = listener.on_new_piece(index, value) {
            self.registry.register(index, handler);
        }
    }

    /// Entries of a `pieces` map in ascending index order.
    fn indexed_entries<'a>(
        pieces: &'a Value,
        report: &mut DispatchReport,
    ) -> Vec<(PieceIndex, &'a Value)> {
        let mut entries = Vec::new();
        match pieces {
            Value::Object(map) => {
                for (key, value) in map {
                    match parse_index(key) {
                        Some(index) => entries.push((index, value)),
                        None => report.rejected.push(SyncError::malformed(
                            format!("pieces|{key}"),
                            "piece index is not a canonical non-negative integer",
                        )),
                    }
                }
            }
            Value::Array(items) => {
                entries.extend(items.iter().enumerate().map(|(i, v)| (i as PieceIndex, v)));
            }
            _ => {}
        }
        entries.sort_by_key(|(index, _)| *index);
        entries
    }
}

fn is_composite(value: &Value) -> bool {
    value.is_object() || value.is_array()
}
