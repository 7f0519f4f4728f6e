use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use ctx_adapters::{AdapterError, AdapterResult, AdapterStats, LocalToolAdapter, ToolAdapter};
use ctx_config::EngineConfig;
use ctx_engine::{EngineError, EngineState, StoreRequest, SyncEngine};
use ctx_memory::{
    BatchOutcome, CompressionLevel, EntryType, InMemoryBackend, LocalVectorIndex, MemoryEntry,
    MemoryError, MemoryResult, Scope, StorageBackend, StorageTier, VectorDocument,
    VectorIndexClient,
};
use ctx_primitives::ConsumerId;

fn consumer(name: &str) -> ConsumerId {
    ConsumerId::new(name).unwrap()
}

fn quiet_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.hot.reaper_interval_ms = 60_000;
    config.vector.flush_interval_ms = 60_000;
    config.vector.batch_size = 100;
    config
}

async fn running(config: EngineConfig) -> SyncEngine {
    let engine = SyncEngine::builder(config).build().await.unwrap();
    engine.initialize().await.unwrap();
    engine
}

struct FailingAdapter {
    consumer: ConsumerId,
    attempts: AtomicUsize,
}

#[async_trait]
impl ToolAdapter for FailingAdapter {
    fn consumer_id(&self) -> &ConsumerId {
        &self.consumer
    }

    fn context_window_tokens(&self) -> usize {
        1_000
    }

    async fn sync_create(&self, _key: &str, _entry: &MemoryEntry) -> AdapterResult<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(AdapterError::unavailable("offline"))
    }

    async fn sync_update(&self, _key: &str, _entry: &MemoryEntry) -> AdapterResult<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(AdapterError::unavailable("offline"))
    }

    async fn sync_delete(&self, _key: &str) -> AdapterResult<()> {
        Ok(())
    }

    async fn entry_count(&self) -> usize {
        0
    }

    async fn stats(&self) -> AdapterResult<AdapterStats> {
        Ok(AdapterStats::default())
    }
}

struct FlakyIndex {
    failures_left: AtomicUsize,
    inner: LocalVectorIndex,
}

#[async_trait]
impl VectorIndexClient for FlakyIndex {
    async fn batch_upsert(
        &self,
        collection: &str,
        documents: &[VectorDocument],
    ) -> MemoryResult<BatchOutcome> {
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(MemoryError::vector_index("index unavailable"));
        }
        self.inner.batch_upsert(collection, documents).await
    }
}

#[tokio::test]
async fn stored_entry_round_trips() {
    let engine = running(quiet_config()).await;
    let outcome = engine
        .store(StoreRequest::new("notes/today", "hello world"))
        .await
        .unwrap();
    assert!(!outcome.updated);

    let entry = engine.retrieve("notes/today").await.unwrap();
    assert_eq!(entry.content().as_text(), "hello world");
    assert_eq!(entry.compression_level(), CompressionLevel::None);
    assert_eq!(entry.storage_tier(), StorageTier::Hot);

    let again = engine
        .store(StoreRequest::new("notes/today", "hello again"))
        .await
        .unwrap();
    assert!(again.updated);
    assert_eq!(again.entry.metadata().created_at, entry.metadata().created_at);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn expired_entry_reads_as_missing_before_reaping() {
    let engine = running(quiet_config()).await;
    engine
        .store(StoreRequest::new("short", "lived").ttl(Duration::from_millis(50)))
        .await
        .unwrap();
    assert!(engine.retrieve("short").await.is_some());

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(engine.retrieve("short").await.is_none());
    assert_eq!(engine.stats().await.hot.entries, 1);

    let report = engine.reap_now().await;
    assert_eq!(report.expired, 1);
    assert_eq!(engine.stats().await.hot.entries, 0);
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn full_hot_tier_evicts_soonest_expiry() {
    let mut config = quiet_config();
    config.hot.max_entries = 2;
    let engine = running(config).await;

    for (key, secs) in [("k10", 10), ("k20", 20)] {
        let outcome = engine
            .store(StoreRequest::new(key, key).ttl(Duration::from_secs(secs)))
            .await
            .unwrap();
        assert!(outcome.evicted.is_empty());
    }
    let third = engine
        .store(StoreRequest::new("k30", "k30").ttl(Duration::from_secs(30)))
        .await
        .unwrap();
    assert_eq!(third.evicted, vec!["k10".to_owned()]);

    let fourth = engine
        .store(StoreRequest::new("k40", "k40").ttl(Duration::from_secs(40)))
        .await
        .unwrap();
    assert_eq!(fourth.evicted, vec!["k20".to_owned()]);
    assert_eq!(engine.stats().await.hot.entries, 2);

    // Evicted entries stay readable from the durable tiers.
    let evicted = engine.retrieve("k10").await.unwrap();
    assert_eq!(evicted.content().as_text(), "k10");
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn retrieve_falls_through_corrupt_records_and_promotes() {
    let warm = Arc::new(InMemoryBackend::new());
    let cold = Arc::new(InMemoryBackend::new());
    let durable = MemoryEntry::builder("k", "durable copy").build().unwrap();
    warm.put("k", Bytes::from_static(b"{not json"), None).await.unwrap();
    cold.put("k", Bytes::from(serde_json::to_vec(&durable).unwrap()), None)
        .await
        .unwrap();
    cold.put("broken", Bytes::from_static(b"\x00\x01garbage"), None)
        .await
        .unwrap();

    let engine = SyncEngine::builder(quiet_config())
        .warm_backend(warm)
        .cold_backend(cold)
        .build()
        .await
        .unwrap();
    engine.initialize().await.unwrap();

    let first = engine.retrieve("k").await.unwrap();
    assert_eq!(first.content().as_text(), "durable copy");
    assert_eq!(first.storage_tier(), StorageTier::Cold);

    let second = engine.retrieve("k").await.unwrap();
    assert_eq!(second.storage_tier(), StorageTier::Hot);

    assert!(engine.retrieve("broken").await.is_none());
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn tool_specific_entries_reach_only_their_source() {
    let engine = running(quiet_config()).await;
    let cursor = consumer("cursor");
    let claude = consumer("claude");
    let cursor_adapter = Arc::new(LocalToolAdapter::new(cursor.clone(), 4_000));
    let claude_adapter = Arc::new(LocalToolAdapter::new(claude.clone(), 4_000));
    engine.register_consumer(cursor_adapter.clone()).unwrap();
    engine.register_consumer(claude_adapter.clone()).unwrap();

    engine
        .store(
            StoreRequest::new("cursor/state", "open tabs")
                .entry_type(EntryType::ToolSpecific)
                .source_consumer(cursor.clone()),
        )
        .await
        .unwrap();
    engine
        .store(StoreRequest::new("shared", "project conventions"))
        .await
        .unwrap();
    engine.settle().await;

    assert_eq!(cursor_adapter.keys().await, vec!["cursor/state", "shared"]);
    assert_eq!(claude_adapter.keys().await, vec!["shared"]);

    assert!(engine.retrieve_as(&cursor, "cursor/state").await.unwrap().is_some());
    assert!(engine.retrieve_as(&claude, "cursor/state").await.unwrap().is_none());

    let report = engine.sync_consumer(&claude).await.unwrap();
    assert_eq!(report.stats.included_count, 1);
    assert_eq!(report.unchanged, 1);
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn sync_fits_required_entry_and_compresses_the_rest() {
    let engine = running(quiet_config()).await;
    let id = consumer("small-window");
    let adapter = Arc::new(LocalToolAdapter::new(id.clone(), 500));
    engine.register_consumer(adapter.clone()).unwrap();

    engine
        .store(StoreRequest::new("required", "r".repeat(400)).priority(9))
        .await
        .unwrap();
    for key in ["shared-a", "shared-b", "shared-c"] {
        engine
            .store(StoreRequest::new(key, "a".repeat(1_200)))
            .await
            .unwrap();
    }
    engine.settle().await;
    assert!(engine.pin(&id, "required").await.unwrap());

    let report = engine.sync_consumer(&id).await.unwrap();
    assert_eq!(report.stats.included_count, 3);
    assert_eq!(report.stats.excluded_count, 1);
    assert_eq!(report.stats.budget_consumed, 100 + 300 + 51);

    let snapshot = engine.budget_snapshot(&id).unwrap();
    assert_eq!(snapshot.reserved, 451);
    assert!(snapshot.reserved <= snapshot.window);

    let stats = engine.consumer_report(&id).await.unwrap().stats;
    assert_eq!(stats.entry_count, 3);
    assert_eq!(stats.compression_level_counts.get(&CompressionLevel::None), Some(&2));
    assert_eq!(stats.compression_level_counts.get(&CompressionLevel::Heavy), Some(&1));
    assert!(adapter.get("required").await.is_some());

    let repeat = engine.sync_consumer(&id).await.unwrap();
    assert_eq!(repeat.unchanged, 3);
    assert_eq!(repeat.created + repeat.updated + repeat.deleted, 0);
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn concurrent_stores_never_overdraw_a_window() {
    let engine = Arc::new(running(quiet_config()).await);
    let id = consumer("tight");
    let adapter = Arc::new(LocalToolAdapter::new(id.clone(), 50));
    engine.register_consumer(adapter.clone()).unwrap();

    let writers = (0..20).map(|i| {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            engine
                .store(StoreRequest::new(format!("entry-{i}"), "x".repeat(100)))
                .await
                .unwrap();
        })
    });
    for writer in futures::future::join_all(writers).await {
        writer.unwrap();
    }
    engine.settle().await;

    let snapshot = engine.budget_snapshot(&id).unwrap();
    assert!(snapshot.reserved <= snapshot.window);
    let stats = engine.consumer_report(&id).await.unwrap().stats;
    assert_eq!(stats.estimated_token_usage, snapshot.reserved);
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn delete_retracts_from_every_consumer() {
    let engine = running(quiet_config()).await;
    let id = consumer("reader");
    let adapter = Arc::new(LocalToolAdapter::new(id.clone(), 1_000));
    engine.register_consumer(adapter.clone()).unwrap();

    engine.store(StoreRequest::new("gone", "soon")).await.unwrap();
    engine.settle().await;
    assert_eq!(adapter.keys().await, vec!["gone"]);

    assert!(engine.delete("gone").await.unwrap());
    engine.settle().await;
    assert!(adapter.keys().await.is_empty());
    assert_eq!(engine.budget_snapshot(&id).unwrap().reserved, 0);
    assert!(engine.retrieve("gone").await.is_none());
    assert!(!engine.delete("gone").await.unwrap());
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn reaper_retracts_expired_projections() {
    let engine = running(quiet_config()).await;
    let id = consumer("reader");
    let adapter = Arc::new(LocalToolAdapter::new(id.clone(), 1_000));
    engine.register_consumer(adapter.clone()).unwrap();

    engine
        .store(StoreRequest::new("ephemeral", "state").ttl(Duration::from_millis(50)))
        .await
        .unwrap();
    engine.settle().await;
    assert_eq!(adapter.keys().await, vec!["ephemeral"]);

    tokio::time::sleep(Duration::from_millis(80)).await;
    let report = engine.reap_now().await;
    assert_eq!(report.expired, 1);
    assert_eq!(report.retracted, 1);
    assert!(adapter.keys().await.is_empty());
    assert_eq!(engine.budget_snapshot(&id).unwrap().reserved, 0);
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn failing_adapter_is_counted_and_releases_budget() {
    let mut config = quiet_config();
    config.health.max_adapter_failures = 0;
    let engine = running(config).await;
    let id = consumer("flaky");
    let adapter = Arc::new(FailingAdapter {
        consumer: id.clone(),
        attempts: AtomicUsize::new(0),
    });
    engine.register_consumer(adapter.clone()).unwrap();

    engine.store(StoreRequest::new("note", "content")).await.unwrap();
    engine.settle().await;

    assert_eq!(adapter.attempts.load(Ordering::SeqCst), 1);
    assert_eq!(engine.consumer_report(&id).await.unwrap().sync_failures, 1);
    assert_eq!(engine.budget_snapshot(&id).unwrap().reserved, 0);
    assert!(!engine.health().await.is_healthy());

    // Other work is unaffected.
    assert!(engine.retrieve("note").await.is_some());
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn failed_vector_batch_is_requeued() {
    let index = Arc::new(FlakyIndex {
        failures_left: AtomicUsize::new(1),
        inner: LocalVectorIndex::new(),
    });
    let engine = SyncEngine::builder(quiet_config())
        .vector_index(index.clone())
        .build()
        .await
        .unwrap();
    engine.initialize().await.unwrap();

    engine.store(StoreRequest::new("doc-1", "first")).await.unwrap();
    engine.store(StoreRequest::new("doc-2", "second")).await.unwrap();
    engine.settle().await;

    let failed = engine.flush_vectors().await;
    assert_eq!(failed.delivered, 0);
    assert_eq!(failed.requeued, 2);
    let stats = engine.stats().await.vector;
    assert_eq!(stats.failed_batches, 1);
    assert_eq!(stats.pending, 2);

    let retried = engine.flush_vectors().await;
    assert_eq!(retried.delivered, 2);
    assert_eq!(index.inner.count().await, 2);
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn shutdown_drains_persistence_and_vectors() {
    let cold = Arc::new(InMemoryBackend::new());
    let index = Arc::new(LocalVectorIndex::new());
    let engine = SyncEngine::builder(quiet_config())
        .cold_backend(cold.clone())
        .vector_index(index.clone())
        .build()
        .await
        .unwrap();
    engine.initialize().await.unwrap();

    for i in 0..5 {
        engine
            .store(StoreRequest::new(format!("k{i}"), format!("value {i}")))
            .await
            .unwrap();
    }
    engine.shutdown().await.unwrap();

    assert_eq!(engine.state(), EngineState::Stopped);
    for i in 0..5 {
        assert!(cold.get(&format!("k{i}")).await.unwrap().is_some());
    }
    assert_eq!(index.count().await, 5);
    let stats = engine.stats().await;
    assert_eq!(stats.persist_backlog, 0);
    assert_eq!(stats.vector.pending, 0);

    let err = engine.store(StoreRequest::new("late", "write")).await.unwrap_err();
    assert!(matches!(err, EngineError::NotRunning { .. }));
}

#[tokio::test]
async fn lifecycle_misuse_is_reported() {
    let engine = SyncEngine::builder(quiet_config()).build().await.unwrap();
    let err = engine.store(StoreRequest::new("early", "write")).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::NotRunning {
            state: EngineState::Created
        }
    ));

    engine.initialize().await.unwrap();
    assert!(matches!(
        engine.initialize().await,
        Err(EngineError::Lifecycle(_))
    ));

    engine.shutdown().await.unwrap();
    engine.shutdown().await.unwrap();
    assert_eq!(engine.state(), EngineState::Stopped);
}

#[tokio::test]
async fn cold_journal_survives_restart() {
    let path = std::env::temp_dir().join(format!("ctxsync-{}.journal", uuid::Uuid::new_v4()));
    let mut config = quiet_config();
    config.cold.journal_path = Some(path.clone());

    let engine = running(config.clone()).await;
    engine
        .store(StoreRequest::new("decision", "use sqlite").scope(Scope::Global))
        .await
        .unwrap();
    engine.shutdown().await.unwrap();

    let restarted = running(config).await;
    let entry = restarted.retrieve("decision").await.unwrap();
    assert_eq!(entry.content().as_text(), "use sqlite");
    assert_eq!(entry.storage_tier(), StorageTier::Cold);
    restarted.shutdown().await.unwrap();

    let _ = std::fs::remove_file(path);
}

#[tokio::test]
async fn search_ranks_by_matched_terms() {
    let engine = running(quiet_config()).await;
    engine
        .store(StoreRequest::new("a", "rust async runtime"))
        .await
        .unwrap();
    engine.store(StoreRequest::new("b", "rust macros")).await.unwrap();
    engine.store(StoreRequest::new("c", "python")).await.unwrap();

    let hits = engine.search("rust async", 10).await;
    let keys: Vec<&str> = hits.iter().map(|hit| hit.key.as_str()).collect();
    assert_eq!(keys, vec!["a", "b"]);
    assert!((hits[0].score - 1.0).abs() < f32::EPSILON);
    assert!((hits[1].score - 0.5).abs() < f32::EPSILON);
    engine.shutdown().await.unwrap();
}
