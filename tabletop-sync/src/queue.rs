//! Throttled, ordered delivery of outgoing deltas.
//!
//! The hosted state service drops or rejects bursts, so outgoing deltas go
//! through a single FIFO drained by one task at a time:
//!
//! ```text
//! submit(batch) ─► chunk_batch ─► enqueue ─► [ b1 | b2 | b3 ] ─► drain task ─► RemoteStore
//!                                                                  │
//!                                        submit now, then sleep(min_spacing) while non-empty
//! ```
//!
//! - At most one drain task runs; it exits when the queue empties.
//! - Two submissions are never closer than `min_spacing`.
//! - An idle queue woken inside `min_spacing` of the last submission waits
//!   until `resume_window` after it before sending.
//! - Submissions are fire-and-forget: a failure is logged and counted, and
//!   the queue moves on.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::codec::FlatMap;
use crate::config::QueueConfig;
use crate::error::SyncError;
use crate::remote::RemoteStore;

/// One `{updates, deletions}` submission.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaBatch {
    pub updates: FlatMap,
    pub deletions: Vec<String>,
}

impl DeltaBatch {
    pub fn new(updates: FlatMap, deletions: Vec<String>) -> Self {
        Self { updates, deletions }
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty() && self.deletions.is_empty()
    }

    /// Length of the JSON encodings of the updates and the deletions.
    pub fn serialized_len(&self) -> usize {
        let updates = serde_json::to_string(&self.updates).map_or(usize::MAX, |s| s.len());
        let deletions = serde_json::to_string(&self.deletions).map_or(usize::MAX, |s| s.len());
        updates.saturating_add(deletions)
    }
}

/// Split a batch the remote store would refuse into bounded chunks.
///
/// A batch under `chunk_char_budget` is returned whole. Otherwise keys and
/// deletions are drawn one of each per step and a chunk is closed as soon as
/// either side reaches `chunk_max_keys`. Which keys share a chunk is not
/// specified.
pub fn chunk_batch(batch: DeltaBatch, config: &QueueConfig) -> Result<Vec<DeltaBatch>, SyncError> {
    if batch.serialized_len() < config.chunk_char_budget {
        return Ok(vec![batch]);
    }

    let max_keys = config.chunk_max_keys.max(1);
    let mut updates: Vec<(String, String)> = batch.updates.into_iter().collect();
    let mut deletions = batch.deletions;
    let mut chunks = Vec::new();
    let mut current = DeltaBatch::default();

    while !updates.is_empty() || !deletions.is_empty() {
        if let Some((key, value)) = updates.pop() {
            current.updates.insert(key, value);
        }
        if let Some(key) = deletions.pop() {
            current.deletions.push(key);
        }
        if current.updates.len() >= max_keys || current.deletions.len() >= max_keys {
            chunks.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }

    for chunk in &chunks {
        if chunk.updates.len() > max_keys || chunk.deletions.len() > max_keys {
            return Err(SyncError::OversizeBatch {
                keys: chunk.updates.len(),
                deletions: chunk.deletions.len(),
                limit: max_keys,
            });
        }
    }
    Ok(chunks)
}

/// Mutable queue state shared by `enqueue` and the drain task.
#[derive(Debug, Default)]
pub struct QueueState {
    pending: VecDeque<DeltaBatch>,
    is_draining: bool,
    last_submit: Option<Instant>,
}

impl QueueState {
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_draining(&self) -> bool {
        self.is_draining
    }

    pub fn last_submit(&self) -> Option<Instant> {
        self.last_submit
    }

    /// Delay before the first pop of a newly started drain.
    fn resume_delay(&self, config: &QueueConfig, now: Instant) -> Duration {
        match self.last_submit {
            Some(last) => {
                let elapsed = now.saturating_duration_since(last);
                if elapsed < config.min_spacing {
                    config
                        .resume_window
                        .max(config.min_spacing)
                        .saturating_sub(elapsed)
                } else {
                    Duration::ZERO
                }
            }
            None => Duration::ZERO,
        }
    }
}

/// Queue counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub enqueued: u64,
    pub submitted: u64,
    pub failed: u64,
    pub pending: usize,
}

#[derive(Default)]
struct QueueCounters {
    enqueued: AtomicU64,
    submitted: AtomicU64,
    failed: AtomicU64,
}

/// Single-flight, throttled delta queue in front of a [`RemoteStore`].
#[derive(Clone)]
pub struct DeltaQueue {
    state: Arc<Mutex<QueueState>>,
    store: Arc<dyn RemoteStore>,
    config: QueueConfig,
    counters: Arc<QueueCounters>,
    idle: Arc<Notify>,
}

impl DeltaQueue {
    pub fn new(store: Arc<dyn RemoteStore>, config: QueueConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState::default())),
            store,
            config,
            counters: Arc::new(QueueCounters::default()),
            idle: Arc::new(Notify::new()),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Chunk `batch` if needed and enqueue every chunk in order.
    ///
    /// Returns the number of chunks queued. Empty batches are dropped.
    pub async fn submit(&self, batch: DeltaBatch) -> Result<usize, SyncError> {
        if batch.is_empty() {
            log::debug!("Dropping empty delta batch");
            return Ok(0);
        }
        let chunks = chunk_batch(batch, &self.config)?;
        let count = chunks.len();
        if count > 1 {
            log::debug!("Split oversized delta into {count} chunks");
        }
        for chunk in chunks {
            self.enqueue(chunk).await;
        }
        Ok(count)
    }

    /// Append a batch; starts the drain task when the queue is idle.
    pub async fn enqueue(&self, batch: DeltaBatch) {
        let mut state = self.state.lock().await;
        state.pending.push_back(batch);
        self.counters.enqueued.fetch_add(1, Ordering::Relaxed);

        if state.is_draining {
            return;
        }
        state.is_draining = true;
        let delay = state.resume_delay(&self.config, Instant::now());
        drop(state);

        if !delay.is_zero() {
            log::trace!("Delaying drain start by {delay:?}");
        }
        let queue = self.clone();
        tokio::spawn(async move { queue.drain(delay).await });
    }

    async fn drain(self, first_delay: Duration) {
        if !first_delay.is_zero() {
            tokio::time::sleep(first_delay).await;
        }
        loop {
            let batch = {
                let mut state = self.state.lock().await;
                match state.pending.pop_front() {
                    Some(batch) => batch,
                    None => {
                        state.is_draining = false;
                        self.idle.notify_waiters();
                        return;
                    }
                }
            };

            let keys = batch.updates.len();
            let deletions = batch.deletions.len();
            match self.store.submit_delta(batch.updates, batch.deletions) {
                Ok(()) => {
                    self.counters.submitted.fetch_add(1, Ordering::Relaxed);
                    log::trace!("Submitted delta: {keys} updates, {deletions} deletions");
                }
                Err(e) => {
                    self.counters.failed.fetch_add(1, Ordering::Relaxed);
                    log::warn!("Dropped delta ({keys} updates, {deletions} deletions): {e}");
                }
            }

            {
                let mut state = self.state.lock().await;
                state.last_submit = Some(Instant::now());
                if state.pending.is_empty() {
                    state.is_draining = false;
                    self.idle.notify_waiters();
                    return;
                }
            }
            tokio::time::sleep(self.config.min_spacing).await;
        }
    }

    /// Wait until every queued batch has been handed to the store.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            {
                let state = self.state.lock().await;
                if !state.is_draining && state.pending.is_empty() {
                    return;
                }
            }
            notified.await;
        }
    }

    pub async fn pending_len(&self) -> usize {
        self.state.lock().await.pending_len()
    }

    pub async fn is_draining(&self) -> bool {
        self.state.lock().await.is_draining()
    }

    pub async fn stats(&self) -> QueueStats {
        QueueStats {
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            pending: self.pending_len().await,
        }
    }
}
