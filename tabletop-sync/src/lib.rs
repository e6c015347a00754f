//! # tabletop-sync: State synchronization for shared tabletop boards
//!
//! Keeps a board of movable pieces in sync between clients that share a
//! flat, delta-broadcasting key-value store.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  {updates, deletions}  ┌──────────────┐
//! │ BoardSession │ ─────────────────────► │ RemoteStore  │
//! │ (per client) │  throttled DeltaQueue  │ (flat k/v)   │
//! └──────▲───────┘                        └──────┬───────┘
//!        │ StateChange {added, removed}          │
//!        └───────────────────────────────────────┘
//!                  (every client, sender included)
//!
//! StateChange ─► LocalMirror ─► unflatten ─► Dispatcher ─► PieceHandler
//! ```
//!
//! ## Modules
//!
//! - [`codec`] - nested value ⇄ `a|b|c` flat keys, `_NULL_` tombstones
//! - [`deletions`] - keys a tombstone write must remove
//! - [`mirror`] - last-known flat state
//! - [`queue`] - single-flight, throttled, chunking delta queue
//! - [`dispatch`] - add/update/delete events per piece, index allocation
//! - [`piece`] - piece model and lenient wire decoding
//! - [`document`] - saved board files
//! - [`remote`] - store seam and the in-process [`MemoryStore`]
//! - [`session`] - all of the above wired to one store
//!
//! ## Store Limits
//!
//! | Limit | Default |
//! |-------|---------|
//! | Spacing between submissions | 50ms |
//! | Resume gap after a burst | 100ms |
//! | Delta size before chunking | 2048 chars |
//! | Keys (and deletions) per chunk | 15 |

pub mod codec;
pub mod config;
pub mod deletions;
pub mod dispatch;
pub mod document;
pub mod error;
pub mod mirror;
pub mod piece;
pub mod queue;
pub mod remote;
pub mod session;

// Re-exports for convenience
pub use codec::{flatten, unflatten, FlatMap, Unflattened, SEPARATOR, TOMBSTONE};
pub use config::{QueueConfig, SyncConfig};
pub use deletions::{find_deletions, find_stale_tombstones};
pub use dispatch::{DispatchReport, Dispatcher, HandlerRegistry, PieceHandler, PieceListener};
pub use document::{DocumentPiece, WorldDocument};
pub use error::SyncError;
pub use mirror::{LocalMirror, PendingWrites, GENERATION_KEY};
pub use piece::{
    normalize_orientation, parse_index, snap_orientation, Piece, PieceDelta, PieceIndex,
};
pub use queue::{chunk_batch, DeltaBatch, DeltaQueue, QueueState, QueueStats};
pub use remote::{
    KeyValue, MemoryStore, RemoteStore, StateChange, StoreStats, SubmissionRecord,
    DEFAULT_LOG_CAPACITY,
};
pub use session::{BoardSession, SessionEvent, SessionStart, SessionStats};
