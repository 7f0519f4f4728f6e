//! Write-behind persistence of the warm and cold tiers.
//!
//! A single worker applies writes in the order they were accepted. Until a
//! write lands, the overlay answers reads for its key so callers always see
//! their latest store or delete.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use ctx_memory::{MemoryEntry, MemoryResult, StorageBackend, StorageTier};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Write accepted into the hot tier but not yet persisted.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum PendingWrite {
    Live(MemoryEntry),
    Tombstone,
}

#[derive(Debug)]
enum Op {
    Put(MemoryEntry),
    Delete,
}

#[derive(Debug)]
struct Job {
    seq: u64,
    key: String,
    op: Op,
}

#[derive(Debug, Default)]
struct Overlay {
    writes: HashMap<String, (u64, PendingWrite)>,
    next_seq: u64,
}

type SharedOverlay = Arc<Mutex<Overlay>>;

fn lock(overlay: &SharedOverlay) -> MutexGuard<'_, Overlay> {
    overlay.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Serializes an entry for a durable tier.
pub(crate) fn encode(entry: &MemoryEntry) -> MemoryResult<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(entry)?))
}

/// Both durable tiers plus the warm lifetime cap.
#[derive(Clone)]
pub(crate) struct DurableTiers {
    pub(crate) warm: Arc<dyn StorageBackend>,
    pub(crate) cold: Arc<dyn StorageBackend>,
    pub(crate) warm_max_ttl: Duration,
    /// Journal writes tolerated before the durable sweep compacts a tier.
    pub(crate) compact_after_ops: usize,
}

impl DurableTiers {
    pub(crate) fn backend(&self, tier: StorageTier) -> Option<&Arc<dyn StorageBackend>> {
        match tier {
            StorageTier::Hot => None,
            StorageTier::Warm => Some(&self.warm),
            StorageTier::Cold => Some(&self.cold),
        }
    }

    async fn put(&self, entry: &MemoryEntry) {
        let value = match encode(entry) {
            Ok(value) => value,
            Err(err) => {
                warn!(key = entry.key(), ?err, "failed to encode entry for persistence");
                return;
            }
        };

        let warm_ttl = entry
            .remaining_ttl(SystemTime::now())
            .min(self.warm_max_ttl);
        if warm_ttl.is_zero() {
            debug!(key = entry.key(), "entry expired before warm write; skipping");
        } else if let Err(err) = self.warm.put(entry.key(), value.clone(), Some(warm_ttl)).await {
            warn!(key = entry.key(), tier = "warm", ?err, "storage write failed");
        }

        if let Err(err) = self.cold.put(entry.key(), value, None).await {
            warn!(key = entry.key(), tier = "cold", ?err, "storage write failed");
        }
    }

    async fn delete(&self, key: &str) {
        if let Err(err) = self.warm.delete(key).await {
            warn!(key, tier = "warm", ?err, "storage delete failed");
        }
        if let Err(err) = self.cold.delete(key).await {
            warn!(key, tier = "cold", ?err, "storage delete failed");
        }
    }
}

impl std::fmt::Debug for DurableTiers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableTiers")
            .field("warm_max_ttl", &self.warm_max_ttl)
            .field("compact_after_ops", &self.compact_after_ops)
            .finish_non_exhaustive()
    }
}

/// FIFO worker applying warm and cold writes in the background.
#[derive(Debug)]
pub(crate) struct WriteBehind {
    sender: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    overlay: SharedOverlay,
    backlog: Arc<AtomicUsize>,
    worker: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl WriteBehind {
    /// Spawns the worker on the current runtime.
    pub(crate) fn spawn(tiers: DurableTiers) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let overlay = SharedOverlay::default();
        let backlog = Arc::new(AtomicUsize::new(0));
        let worker = tokio::spawn(run_worker(
            tiers,
            receiver,
            Arc::clone(&overlay),
            Arc::clone(&backlog),
        ));
        Self {
            sender: Mutex::new(Some(sender)),
            overlay,
            backlog,
            worker: tokio::sync::Mutex::new(Some(worker)),
        }
    }

    /// Queues a put. Returns `false` once the worker has been closed.
    pub(crate) fn put(&self, entry: MemoryEntry) -> bool {
        let key = entry.key().to_owned();
        self.submit(key, PendingWrite::Live(entry.clone()), Op::Put(entry))
    }

    /// Queues a delete. Returns `false` once the worker has been closed.
    pub(crate) fn delete(&self, key: &str) -> bool {
        self.submit(key.to_owned(), PendingWrite::Tombstone, Op::Delete)
    }

    fn submit(&self, key: String, pending: PendingWrite, op: Op) -> bool {
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(sender) = sender.as_ref() else {
            warn!(key = %key, "persistence worker closed; write dropped");
            return false;
        };

        // Sequence assignment and send happen under the overlay lock so the
        // channel order matches the overlay order.
        let mut overlay = lock(&self.overlay);
        let seq = overlay.next_seq;
        overlay.next_seq += 1;
        overlay.writes.insert(key.clone(), (seq, pending));
        self.backlog.fetch_add(1, Ordering::AcqRel);
        if sender.send(Job { seq, key: key.clone(), op }).is_err() {
            overlay.writes.remove(&key);
            self.backlog.fetch_sub(1, Ordering::AcqRel);
            warn!(key = %key, "persistence worker stopped; write dropped");
            return false;
        }
        true
    }

    /// Latest unpersisted write for `key`.
    pub(crate) fn pending(&self, key: &str) -> Option<PendingWrite> {
        lock(&self.overlay)
            .writes
            .get(key)
            .map(|(_, pending)| pending.clone())
    }

    /// Every unpersisted write.
    pub(crate) fn pending_writes(&self) -> Vec<(String, PendingWrite)> {
        lock(&self.overlay)
            .writes
            .iter()
            .map(|(key, (_, pending))| (key.clone(), pending.clone()))
            .collect()
    }

    /// Writes accepted but not yet applied.
    pub(crate) fn backlog(&self) -> usize {
        self.backlog.load(Ordering::Acquire)
    }

    /// Stops accepting writes and waits until the queue is drained.
    pub(crate) async fn close(&self) {
        drop(
            self.sender
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );
        let worker = self.worker.lock().await.take();
        if let Some(worker) = worker {
            if let Err(err) = worker.await {
                warn!(?err, "persistence worker terminated abnormally");
            }
        }
    }
}

async fn run_worker(
    tiers: DurableTiers,
    mut receiver: mpsc::UnboundedReceiver<Job>,
    overlay: SharedOverlay,
    backlog: Arc<AtomicUsize>,
) {
    while let Some(job) = receiver.recv().await {
        match &job.op {
            Op::Put(entry) => tiers.put(entry).await,
            Op::Delete => tiers.delete(&job.key).await,
        }

        let mut guard = lock(&overlay);
        if guard
            .writes
            .get(&job.key)
            .is_some_and(|(seq, _)| *seq == job.seq)
        {
            guard.writes.remove(&job.key);
        }
        drop(guard);
        backlog.fetch_sub(1, Ordering::AcqRel);
    }
    debug!("persistence worker drained");
}
