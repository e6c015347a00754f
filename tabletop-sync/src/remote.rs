//! Seam to the hosted key-value state service, plus an in-process store.
//!
//! The engine needs exactly three things from the service: the full state
//! at session start, a fire-and-forget delta push, and a stream of change
//! notifications that includes the sender's own deltas.
//!
//! ```text
//! BoardSession A ──submit_delta──┐
//!                                ├──► MemoryStore (authoritative flat map)
//! BoardSession B ──submit_delta──┘          │
//!                                  broadcast::Sender<Arc<StateChange>>
//!                                 ┌─────────┴─────────┐
//!                                 ▼                   ▼
//!                          BoardSession A      BoardSession B
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::codec::FlatMap;
use crate::error::SyncError;

/// A single added or changed key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

/// Change notification delivered to every participant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChange {
    pub added: Vec<KeyValue>,
    pub removed: Vec<String>,
}

impl StateChange {
    /// Added pairs as a flat map.
    pub fn added_map(&self) -> FlatMap {
        self.added
            .iter()
            .map(|kv| (kv.key.clone(), kv.value.clone()))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Remote state service.
pub trait RemoteStore: Send + Sync {
    /// Snapshot of the whole flat state.
    fn initial_state(&self) -> FlatMap;

    /// Push a delta. Success only means the call was accepted; the change
    /// is observed through a later notification.
    fn submit_delta(&self, updates: FlatMap, deletions: Vec<String>) -> Result<(), SyncError>;

    /// Register for change notifications.
    fn subscribe(&self) -> broadcast::Receiver<Arc<StateChange>>;
}

/// Snapshot of [`MemoryStore`] counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub submissions: u64,
    pub failed_submissions: u64,
    pub keys_written: u64,
    pub keys_removed: u64,
    pub stored_keys: usize,
    pub subscribers: usize,
}

/// One accepted submission, as seen by the store.
#[derive(Debug, Clone)]
pub struct SubmissionRecord {
    pub at: Instant,
    pub updates: FlatMap,
    pub deletions: Vec<String>,
}

struct AtomicStoreStats {
    submissions: AtomicU64,
    failed_submissions: AtomicU64,
    keys_written: AtomicU64,
    keys_removed: AtomicU64,
}

impl AtomicStoreStats {
    fn new() -> Self {
        Self {
            submissions: AtomicU64::new(0),
            failed_submissions: AtomicU64::new(0),
            keys_written: AtomicU64::new(0),
            keys_removed: AtomicU64::new(0),
        }
    }
}

/// Submissions kept by a new [`MemoryStore`].
pub const DEFAULT_LOG_CAPACITY: usize = 1024;

#[derive(Default)]
struct StoreState {
    entries: FlatMap,
    log: VecDeque<SubmissionRecord>,
    log_capacity: usize,
}

/// In-process store that applies deltas and fans them out to subscribers.
///
/// Used by the simulator and the tests; every subscriber, the sender
/// included, sees every accepted delta in submission order.
pub struct MemoryStore {
    state: Mutex<StoreState>,
    sender: broadcast::Sender<Arc<StateChange>>,
    stats: AtomicStoreStats,
    failures_pending: AtomicUsize,
}

impl MemoryStore {
    /// Create an empty store; `capacity` notifications are buffered per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            state: Mutex::new(StoreState {
                log_capacity: DEFAULT_LOG_CAPACITY,
                ..StoreState::default()
            }),
            sender,
            stats: AtomicStoreStats::new(),
            failures_pending: AtomicUsize::new(0),
        }
    }

    /// Create a store that already holds `entries`.
    pub fn with_state(capacity: usize, entries: FlatMap) -> Self {
        let store = Self::new(capacity);
        store.lock().entries = entries;
        store
    }

    /// Keep only the latest `capacity` submissions in the log; `0` turns
    /// the log off.
    pub fn with_log_capacity(self, capacity: usize) -> Self {
        {
            let mut state = self.lock();
            state.log_capacity = capacity;
            let excess = state.log.len().saturating_sub(capacity);
            state.log.drain(..excess);
        }
        self
    }

    /// Make the next `count` submissions fail without being applied.
    pub fn fail_next(&self, count: usize) {
        self.failures_pending.store(count, Ordering::SeqCst);
    }

    /// Current flat state.
    pub fn snapshot(&self) -> FlatMap {
        self.lock().entries.clone()
    }

    /// The most recent accepted submissions, oldest first.
    pub fn submission_log(&self) -> Vec<SubmissionRecord> {
        self.lock().log.iter().cloned().collect()
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            submissions: self.stats.submissions.load(Ordering::Relaxed),
            failed_submissions: self.stats.failed_submissions.load(Ordering::Relaxed),
            keys_written: self.stats.keys_written.load(Ordering::Relaxed),
            keys_removed: self.stats.keys_removed.load(Ordering::Relaxed),
            stored_keys: self.lock().entries.len(),
            subscribers: self.sender.receiver_count(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn take_injected_failure(&self) -> bool {
        self.failures_pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl RemoteStore for MemoryStore {
    fn initial_state(&self) -> FlatMap {
        self.snapshot()
    }

    fn submit_delta(&self, updates: FlatMap, deletions: Vec<String>) -> Result<(), SyncError> {
        if self.take_injected_failure() {
            self.stats.failed_submissions.fetch_add(1, Ordering::Relaxed);
            return Err(SyncError::RemoteSubmission("injected failure".into()));
        }

        // Held across the send so notifications leave in submission order.
        let mut state = self.lock();

        let mut change = StateChange::default();
        for (key, value) in &updates {
            state.entries.insert(key.clone(), value.clone());
            change.added.push(KeyValue {
                key: key.clone(),
                value: value.clone(),
            });
        }
        for key in &deletions {
            if state.entries.remove(key).is_some() {
                change.removed.push(key.clone());
            }
        }

        self.stats.submissions.fetch_add(1, Ordering::Relaxed);
        self.stats
            .keys_written
            .fetch_add(change.added.len() as u64, Ordering::Relaxed);
        self.stats
            .keys_removed
            .fetch_add(change.removed.len() as u64, Ordering::Relaxed);

        if state.log_capacity > 0 {
            if state.log.len() == state.log_capacity {
                state.log.pop_front();
            }
            state.log.push_back(SubmissionRecord {
                at: Instant::now(),
                updates,
                deletions,
            });
        }

        let receivers = self.sender.send(Arc::new(change)).unwrap_or(0);
        log::trace!("Delta applied, notified {receivers} subscribers");
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<Arc<StateChange>> {
        self.sender.subscribe()
    }
}
