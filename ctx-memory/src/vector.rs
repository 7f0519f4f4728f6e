//! Batching queue feeding the external vector index.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::entry::MemoryEntry;
use crate::vector_index::{BatchOutcome, VectorDocument, VectorIndexClient};

/// Collection used when neither the configuration nor the entry names one.
pub const DEFAULT_COLLECTION: &str = "memories";

/// Queue tuning and collection routing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// Pending documents that trigger an automatic flush.
    pub batch_size: NonZeroUsize,
    /// Collection for categories without an explicit route.
    pub default_collection: String,
    /// Category to collection routes.
    pub collections: HashMap<String, String>,
}

impl QueueConfig {
    /// Collection receiving documents of `category`.
    #[must_use]
    pub fn collection_for(&self, category: &str) -> &str {
        self.collections
            .get(category)
            .map_or(self.default_collection.as_str(), String::as_str)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            batch_size: NonZeroUsize::new(32).unwrap_or(NonZeroUsize::MIN),
            default_collection: DEFAULT_COLLECTION.to_owned(),
            collections: HashMap::new(),
        }
    }
}

/// Summary of one flush pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushReport {
    /// `batch_upsert` calls issued.
    pub batches: usize,
    /// Documents the index accepted.
    pub delivered: usize,
    /// Documents put back for the next flush.
    pub requeued: usize,
}

/// Point-in-time queue metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Documents waiting for a flush.
    pub pending: usize,
    /// Documents delivered since start.
    pub flushed_total: u64,
    /// Batches that failed fully or partially.
    pub failed_batches: u64,
    /// Documents re-queued after a failed batch.
    pub requeued_total: u64,
}

#[derive(Debug, Clone)]
struct PendingDocument {
    seq: u64,
    collection: String,
    document: VectorDocument,
}

#[derive(Debug, Default)]
struct PendingSet {
    documents: HashMap<String, PendingDocument>,
    next_seq: u64,
    /// Ids carried by the flush in progress.
    in_flight: HashSet<String>,
    /// In-flight ids discarded meanwhile, with the sequence at discard time.
    discarded: HashMap<String, u64>,
}

impl PendingSet {
    fn push(&mut self, collection: String, document: VectorDocument) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.documents.insert(
            document.id().to_owned(),
            PendingDocument {
                seq,
                collection,
                document,
            },
        );
    }

    fn drain_grouped(&mut self) -> BTreeMap<String, Vec<PendingDocument>> {
        let mut drained: Vec<PendingDocument> = self.documents.drain().map(|(_, doc)| doc).collect();
        drained.sort_by_key(|doc| doc.seq);
        self.in_flight
            .extend(drained.iter().map(|doc| doc.document.id().to_owned()));
        let mut groups: BTreeMap<String, Vec<PendingDocument>> = BTreeMap::new();
        for doc in drained {
            groups.entry(doc.collection.clone()).or_default().push(doc);
        }
        groups
    }

    fn discard(&mut self, id: &str) -> bool {
        let removed = self.documents.remove(id).is_some();
        let in_flight = self.in_flight.contains(id);
        if in_flight {
            self.discarded.insert(id.to_owned(), self.next_seq);
        }
        removed || in_flight
    }

    /// Puts failed documents back unless a newer version arrived or the id
    /// was discarded after the document was queued.
    fn requeue(&mut self, failed: Vec<PendingDocument>) -> usize {
        let mut requeued = 0;
        for doc in failed {
            let id = doc.document.id();
            if self.documents.contains_key(id) {
                continue;
            }
            if self.discarded.get(id).is_some_and(|&at| at > doc.seq) {
                continue;
            }
            self.documents.insert(doc.document.id().to_owned(), doc);
            requeued += 1;
        }
        requeued
    }

    fn finish_flush(&mut self) {
        self.in_flight.clear();
        self.discarded.clear();
    }
}

/// Deduplicating batch queue with at-least-once delivery.
///
/// Flushes are serialized; a document is only dropped from the queue once the
/// index accepted the batch carrying it.
pub struct VectorBatchQueue {
    client: Arc<dyn VectorIndexClient>,
    config: QueueConfig,
    pending: Mutex<PendingSet>,
    flush_lock: Mutex<()>,
    flushed_total: AtomicU64,
    failed_batches: AtomicU64,
    requeued_total: AtomicU64,
}

impl VectorBatchQueue {
    /// Creates a queue delivering to `client`.
    #[must_use]
    pub fn new(client: Arc<dyn VectorIndexClient>, config: QueueConfig) -> Self {
        Self {
            client,
            config,
            pending: Mutex::new(PendingSet::default()),
            flush_lock: Mutex::new(()),
            flushed_total: AtomicU64::new(0),
            failed_batches: AtomicU64::new(0),
            requeued_total: AtomicU64::new(0),
        }
    }

    /// Returns the queue configuration.
    #[must_use]
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Queues a textual entry, flushing once the batch size is reached.
    ///
    /// Returns `false` for entries that are not indexed.
    pub async fn enqueue(&self, entry: &MemoryEntry) -> bool {
        let Some(document) = VectorDocument::from_entry(entry) else {
            return false;
        };
        let collection = self
            .config
            .collection_for(&entry.metadata().category)
            .to_owned();
        self.pending.lock().await.push(collection, document);
        self.flush_if_full().await;
        true
    }

    /// Drops a pending document, returning `true` if one was queued or is
    /// carried by the flush in progress.
    ///
    /// An in-flight copy is never re-queued; if its batch succeeds the index
    /// still receives it.
    pub async fn discard(&self, id: &str) -> bool {
        self.pending.lock().await.discard(id)
    }

    /// Flushes when at least `batch_size` documents are pending.
    pub async fn flush_if_full(&self) -> Option<FlushReport> {
        if self.pending_len().await < self.config.batch_size.get() {
            return None;
        }
        Some(self.flush_pending().await)
    }

    /// Sends every pending document, one `batch_upsert` per collection.
    ///
    /// Batches that fail outright or partially are re-queued in full.
    pub async fn flush_pending(&self) -> FlushReport {
        let _flush = self.flush_lock.lock().await;
        let groups = self.pending.lock().await.drain_grouped();
        let mut report = FlushReport::default();

        for (collection, batch) in groups {
            let batch_id = Uuid::new_v4();
            let documents: Vec<VectorDocument> =
                batch.iter().map(|doc| doc.document.clone()).collect();
            report.batches += 1;

            match self.client.batch_upsert(&collection, &documents).await {
                Ok(BatchOutcome::Complete) => {
                    report.delivered += documents.len();
                    self.flushed_total
                        .fetch_add(documents.len() as u64, Ordering::Relaxed);
                    debug!(%batch_id, %collection, documents = documents.len(), "vector batch delivered");
                }
                Ok(BatchOutcome::Partial { failed_ids }) => {
                    warn!(
                        %batch_id,
                        %collection,
                        failed = failed_ids.len(),
                        documents = documents.len(),
                        "vector batch partially rejected; re-queueing"
                    );
                    report.requeued += self.requeue(batch).await;
                }
                Err(err) => {
                    warn!(%batch_id, %collection, documents = documents.len(), ?err, "vector batch failed; re-queueing");
                    report.requeued += self.requeue(batch).await;
                }
            }
        }

        self.pending.lock().await.finish_flush();
        report
    }

    async fn requeue(&self, batch: Vec<PendingDocument>) -> usize {
        self.failed_batches.fetch_add(1, Ordering::Relaxed);
        let requeued = self.pending.lock().await.requeue(batch);
        self.requeued_total
            .fetch_add(requeued as u64, Ordering::Relaxed);
        requeued
    }

    /// Documents currently waiting.
    pub async fn pending_len(&self) -> usize {
        self.pending.lock().await.documents.len()
    }

    /// Returns a metrics snapshot.
    pub async fn stats(&self) -> QueueStats {
        QueueStats {
            pending: self.pending_len().await,
            flushed_total: self.flushed_total.load(Ordering::Relaxed),
            failed_batches: self.failed_batches.load(Ordering::Relaxed),
            requeued_total: self.requeued_total.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for VectorBatchQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorBatchQueue")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector_index::LocalVectorIndex;
    use crate::{MemoryError, MemoryResult};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool;

    fn entry(key: &str, text: &str, category: &str) -> MemoryEntry {
        MemoryEntry::builder(key, text)
            .category(category)
            .build()
            .unwrap()
    }

    fn config(batch_size: usize) -> QueueConfig {
        QueueConfig {
            batch_size: NonZeroUsize::new(batch_size).unwrap(),
            ..QueueConfig::default()
        }
    }

    #[derive(Default)]
    struct FlakyIndex {
        failing: AtomicBool,
        partial: AtomicBool,
        inner: LocalVectorIndex,
    }

    #[async_trait]
    impl VectorIndexClient for FlakyIndex {
        async fn batch_upsert(
            &self,
            collection: &str,
            documents: &[VectorDocument],
        ) -> MemoryResult<BatchOutcome> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(MemoryError::vector_index("index unavailable"));
            }
            if self.partial.load(Ordering::SeqCst) {
                return Ok(BatchOutcome::Partial {
                    failed_ids: vec![documents[0].id().to_owned()],
                });
            }
            self.inner.batch_upsert(collection, documents).await
        }
    }

    #[tokio::test]
    async fn flushes_automatically_at_batch_size() {
        let index = Arc::new(LocalVectorIndex::new());
        let queue = VectorBatchQueue::new(index.clone(), config(2));

        assert!(queue.enqueue(&entry("a", "alpha", "general")).await);
        assert_eq!(index.count().await, 0);
        assert!(queue.enqueue(&entry("b", "beta", "general")).await);

        assert_eq!(index.count().await, 2);
        assert_eq!(queue.stats().await.flushed_total, 2);
        assert_eq!(queue.pending_len().await, 0);
    }

    #[tokio::test]
    async fn structured_entries_are_skipped() {
        let queue = VectorBatchQueue::new(Arc::new(LocalVectorIndex::new()), config(4));
        let structured = MemoryEntry::builder("s", serde_json::json!({"k": 1}))
            .build()
            .unwrap();
        assert!(!queue.enqueue(&structured).await);
        assert_eq!(queue.pending_len().await, 0);
    }

    #[tokio::test]
    async fn newer_document_replaces_pending_one() {
        let index = Arc::new(LocalVectorIndex::new());
        let queue = VectorBatchQueue::new(index.clone(), config(10));
        queue.enqueue(&entry("a", "first", "general")).await;
        queue.enqueue(&entry("a", "second", "general")).await;
        assert_eq!(queue.pending_len().await, 1);

        let report = queue.flush_pending().await;
        assert_eq!(report.delivered, 1);
        let documents = index.documents(DEFAULT_COLLECTION).await;
        assert_eq!(documents[0].properties()["content"], "second");
    }

    #[tokio::test]
    async fn discard_removes_pending_document() {
        let queue = VectorBatchQueue::new(Arc::new(LocalVectorIndex::new()), config(10));
        queue.enqueue(&entry("a", "alpha", "general")).await;
        assert!(queue.discard("a").await);
        assert!(!queue.discard("a").await);
        assert_eq!(queue.flush_pending().await, FlushReport::default());
    }

    #[tokio::test]
    async fn routes_categories_to_collections() {
        let index = Arc::new(LocalVectorIndex::new());
        let mut cfg = config(10);
        cfg.collections.insert("code".into(), "snippets".into());
        let queue = VectorBatchQueue::new(index.clone(), cfg);

        queue.enqueue(&entry("a", "fn main", "code")).await;
        queue.enqueue(&entry("b", "meeting notes", "notes")).await;
        let report = queue.flush_pending().await;

        assert_eq!(report.batches, 2);
        assert_eq!(index.documents("snippets").await.len(), 1);
        assert_eq!(index.documents(DEFAULT_COLLECTION).await.len(), 1);
    }

    #[tokio::test]
    async fn failed_batches_are_requeued_until_delivered() {
        let index = Arc::new(FlakyIndex::default());
        index.failing.store(true, Ordering::SeqCst);
        let queue = VectorBatchQueue::new(index.clone(), config(10));
        queue.enqueue(&entry("a", "alpha", "general")).await;
        queue.enqueue(&entry("b", "beta", "general")).await;

        let report = queue.flush_pending().await;
        assert_eq!(report.requeued, 2);
        let stats = queue.stats().await;
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.failed_batches, 1);

        index.failing.store(false, Ordering::SeqCst);
        index.partial.store(true, Ordering::SeqCst);
        let report = queue.flush_pending().await;
        assert_eq!(report.requeued, 2);

        index.partial.store(false, Ordering::SeqCst);
        let report = queue.flush_pending().await;
        assert_eq!(report.delivered, 2);
        let stats = queue.stats().await;
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.failed_batches, 2);
        assert_eq!(stats.requeued_total, 4);
        assert_eq!(index.inner.count().await, 2);
    }

    struct GatedIndex {
        entered: tokio::sync::Notify,
        release: tokio::sync::Notify,
        failing: AtomicBool,
        inner: LocalVectorIndex,
    }

    #[async_trait]
    impl VectorIndexClient for GatedIndex {
        async fn batch_upsert(
            &self,
            collection: &str,
            documents: &[VectorDocument],
        ) -> MemoryResult<BatchOutcome> {
            if self.failing.load(Ordering::SeqCst) {
                self.entered.notify_one();
                self.release.notified().await;
                return Err(MemoryError::vector_index("index unavailable"));
            }
            self.inner.batch_upsert(collection, documents).await
        }
    }

    #[tokio::test]
    async fn discarded_in_flight_document_is_not_requeued() {
        let index = Arc::new(GatedIndex {
            entered: tokio::sync::Notify::new(),
            release: tokio::sync::Notify::new(),
            failing: AtomicBool::new(true),
            inner: LocalVectorIndex::new(),
        });
        let queue = Arc::new(VectorBatchQueue::new(index.clone(), config(10)));
        queue.enqueue(&entry("a", "alpha", "general")).await;
        queue.enqueue(&entry("b", "beta", "general")).await;

        let flushing = tokio::spawn({
            let queue = Arc::clone(&queue);
            async move { queue.flush_pending().await }
        });
        index.entered.notified().await;
        assert!(queue.discard("a").await);
        index.release.notify_one();

        let failed = flushing.await.unwrap();
        assert_eq!(failed.requeued, 1);
        assert_eq!(queue.pending_len().await, 1);

        index.failing.store(false, Ordering::SeqCst);
        let retried = queue.flush_pending().await;
        assert_eq!(retried.delivered, 1);
        let ids: Vec<String> = index
            .inner
            .documents(DEFAULT_COLLECTION)
            .await
            .iter()
            .map(|doc| doc.id().to_owned())
            .collect();
        assert_eq!(ids, vec!["b".to_owned()]);
    }

    #[test]
    fn requeue_skips_discarded_but_keeps_newer_version() {
        let mut set = PendingSet::default();
        set.push("c".into(), VectorDocument::new("a").with_property("v", 1));
        let drained = set.drain_grouped().remove("c").unwrap();
        assert!(set.discard("a"));
        assert_eq!(set.requeue(drained.clone()), 0);

        set.push("c".into(), VectorDocument::new("a").with_property("v", 2));
        assert_eq!(set.requeue(drained), 0);
        assert_eq!(set.documents["a"].document.properties()["v"], 2);

        set.finish_flush();
        assert!(!set.discard("b"));
        assert!(set.discarded.is_empty());
    }

    #[test]
    fn requeue_keeps_newer_pending_version() {
        let mut set = PendingSet::default();
        set.push("c".into(), VectorDocument::new("a").with_property("v", 1));
        let drained = set.drain_grouped().remove("c").unwrap();
        set.push("c".into(), VectorDocument::new("a").with_property("v", 2));

        assert_eq!(set.requeue(drained), 0);
        assert_eq!(set.documents["a"].document.properties()["v"], 2);
    }
}
