//! The sync engine: owner of every tier, the consumer views, and the
//! background loops.

use std::num::{NonZeroU32, NonZeroUsize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

use ctx_adapters::{AdapterHandle, AdapterReport, ToolAdapter};
use ctx_budget::{
    BudgetError, BudgetSnapshot, CompressionParams, CompressionTable, ContextOptimizer,
    TokenEstimator,
};
use ctx_config::EngineConfig;
use ctx_memory::{
    FileBackend, FlushReport, HotTier, HotTierConfig, HotTierStats, InMemoryBackend,
    LocalVectorIndex, MemoryEntry, QueueConfig, QueueStats, RetentionPolicy, StorageBackend,
    VectorBatchQueue, VectorIndexClient,
};
use ctx_primitives::ConsumerId;
use ctx_telemetry::health::{HealthInputs, HealthReport, HealthThresholds, assess};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::background::{LoopTiming, ReapReport, reap_once, run_flush_loop, run_reaper_loop};
use crate::cache::{CacheManager, SearchHit, StoreOutcome, StoreRequest};
use crate::error::{EngineError, EngineResult};
use crate::lifecycle::{EngineState, Lifecycle, LifecycleEvent};
use crate::persist::DurableTiers;
use crate::scheduler::TaskScheduler;
use crate::views::{ConsumerViews, SyncReport};

/// Components shared with background tasks.
#[derive(Debug)]
pub(crate) struct EngineInner {
    pub(crate) cache: CacheManager,
    pub(crate) views: ConsumerViews,
    pub(crate) queue: VectorBatchQueue,
    pub(crate) scheduler: TaskScheduler,
    thresholds: HealthThresholds,
}

/// Budget and failure counters of one registered consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerStats {
    /// Consumer identifier.
    pub consumer: ConsumerId,
    /// Budget accounting.
    pub budget: BudgetSnapshot,
    /// Adapter calls that failed since registration.
    pub sync_failures: u64,
}

/// Point-in-time engine metrics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineStats {
    /// Lifecycle state.
    pub state: EngineState,
    /// Hot tier utilisation.
    pub hot: HotTierStats,
    /// Vector queue metrics.
    pub vector: QueueStats,
    /// Writes waiting for warm/cold persistence.
    pub persist_backlog: usize,
    /// Background tasks not yet finished.
    pub background_tasks: usize,
    /// Registered consumers in identifier order.
    pub consumers: Vec<ConsumerStats>,
}

/// Builds a [`SyncEngine`] from configuration, optionally overriding the
/// storage backends and the vector index.
pub struct SyncEngineBuilder {
    config: EngineConfig,
    warm: Option<Arc<dyn StorageBackend>>,
    cold: Option<Arc<dyn StorageBackend>>,
    vector_index: Option<Arc<dyn VectorIndexClient>>,
}

impl std::fmt::Debug for SyncEngineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngineBuilder")
            .field("config", &self.config)
            .field("custom_warm", &self.warm.is_some())
            .field("custom_cold", &self.cold.is_some())
            .field("custom_vector_index", &self.vector_index.is_some())
            .finish()
    }
}

impl SyncEngineBuilder {
    /// Starts from `config`.
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            warm: None,
            cold: None,
            vector_index: None,
        }
    }

    /// Uses `backend` as the warm tier instead of an in-memory map.
    #[must_use]
    pub fn warm_backend(mut self, backend: Arc<dyn StorageBackend>) -> Self {
        self.warm = Some(backend);
        self
    }

    /// Uses `backend` as the cold tier instead of the configured journal.
    #[must_use]
    pub fn cold_backend(mut self, backend: Arc<dyn StorageBackend>) -> Self {
        self.cold = Some(backend);
        self
    }

    /// Delivers vector documents to `client`.
    #[must_use]
    pub fn vector_index(mut self, client: Arc<dyn VectorIndexClient>) -> Self {
        self.vector_index = Some(client);
        self
    }

    /// Validates the configuration and assembles the engine.
    ///
    /// Must run inside a Tokio runtime; the persistence worker starts here.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Config`] for invalid configuration and
    /// [`EngineError::Memory`] when the cold journal cannot be opened.
    pub async fn build(self) -> EngineResult<SyncEngine> {
        let config = self.config;
        config.validate()?;

        let warm: Arc<dyn StorageBackend> = match self.warm {
            Some(backend) => backend,
            None => Arc::new(InMemoryBackend::new()),
        };
        let cold: Arc<dyn StorageBackend> = match (self.cold, &config.cold.journal_path) {
            (Some(backend), _) => backend,
            (None, Some(path)) => Arc::new(FileBackend::open(path.clone()).await?),
            (None, None) => Arc::new(InMemoryBackend::new()),
        };
        let vector_index: Arc<dyn VectorIndexClient> = match self.vector_index {
            Some(client) => client,
            None => Arc::new(LocalVectorIndex::new()),
        };

        let hot = HotTier::new(HotTierConfig::new(
            non_zero(config.hot.max_entries),
            config.hot.default_ttl(),
        ));
        let tiers = DurableTiers {
            warm,
            cold,
            warm_max_ttl: config.warm.max_ttl(),
            compact_after_ops: non_zero(config.cold.compact_after_ops).get(),
        };
        let cache = CacheManager::new(hot, tiers, retention_policy(&config));

        let optimizer = ContextOptimizer::new(
            TokenEstimator::new(non_zero(config.budget.bytes_per_token)),
            CompressionTable::new(CompressionParams {
                light_reduction: config.compression.light_reduction,
                heavy_excerpt_chars: config.compression.heavy_excerpt_chars,
                marker: config.compression.marker.clone(),
            }),
            config.relevance.half_life(),
        );
        let queue = VectorBatchQueue::new(
            vector_index,
            QueueConfig {
                batch_size: non_zero(config.vector.batch_size),
                default_collection: config.vector.default_collection.clone(),
                collections: config.vector.collections.clone(),
            },
        );
        let scheduler = TaskScheduler::new(non_zero(config.scheduler.max_concurrency));
        let health = &config.health;
        let thresholds = HealthThresholds {
            max_pending_vectors: health.max_pending_vectors,
            max_failed_batches: health.max_failed_batches,
            max_adapter_failures: health.max_adapter_failures,
            max_persist_backlog: health.max_persist_backlog,
        };
        let timing = LoopTiming {
            reaper_interval: config.hot.reaper_interval(),
            flush_interval: config.vector.flush_interval(),
            durable_sweep_every: NonZeroU32::new(config.durable_sweep_every)
                .unwrap_or(NonZeroU32::MIN),
        };

        let inner = EngineInner {
            cache,
            views: ConsumerViews::new(optimizer),
            queue,
            scheduler,
            thresholds,
        };
        let (shutdown, _) = watch::channel(false);
        debug!(?timing, "sync engine built");
        Ok(SyncEngine {
            inner: Arc::new(inner),
            lifecycle: Mutex::new(Lifecycle::new()),
            loops: tokio::sync::Mutex::new(Vec::new()),
            shutdown,
            timing,
        })
    }
}

fn non_zero(value: usize) -> NonZeroUsize {
    NonZeroUsize::new(value).unwrap_or(NonZeroUsize::MIN)
}

fn retention_policy(config: &EngineConfig) -> RetentionPolicy {
    let retention = &config.retention;
    retention.categories.iter().fold(
        RetentionPolicy::new(
            Duration::from_secs(retention.session_secs),
            Duration::from_secs(retention.project_secs),
            Duration::from_secs(retention.global_secs),
        ),
        |policy, (category, secs)| policy.with_category(category.clone(), Duration::from_secs(*secs)),
    )
}

/// Tiered memory shared by a set of consumers with their own context windows.
///
/// Stores land in the hot tier synchronously; persistence, vector indexing, and
/// adapter fan-out happen in the background. Call [`initialize`](Self::initialize)
/// before writing and [`shutdown`](Self::shutdown) to drain every queue.
#[derive(Debug)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
    lifecycle: Mutex<Lifecycle>,
    loops: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
    timing: LoopTiming,
}

impl SyncEngine {
    /// Shortcut for [`SyncEngineBuilder::new`].
    #[must_use]
    pub fn builder(config: EngineConfig) -> SyncEngineBuilder {
        SyncEngineBuilder::new(config)
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the current lifecycle state.
    #[must_use]
    pub fn state(&self) -> EngineState {
        self.lifecycle().state()
    }

    fn ensure_running(&self) -> EngineResult<()> {
        let state = self.state();
        if state.is_running() {
            Ok(())
        } else {
            Err(EngineError::not_running(state))
        }
    }

    /// Starts the reaper and flush loops.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Lifecycle`] unless the engine is freshly built.
    pub async fn initialize(&self) -> EngineResult<()> {
        self.lifecycle().transition(LifecycleEvent::Start)?;

        let mut loops = self.loops.lock().await;
        loops.push(tokio::spawn(run_reaper_loop(
            Arc::clone(&self.inner),
            self.timing,
            self.shutdown.subscribe(),
        )));
        loops.push(tokio::spawn(run_flush_loop(
            Arc::clone(&self.inner),
            self.timing,
            self.shutdown.subscribe(),
        )));
        info!(
            reaper_interval_ms = self.timing.reaper_interval.as_millis(),
            flush_interval_ms = self.timing.flush_interval.as_millis(),
            "sync engine started"
        );
        Ok(())
    }

    /// Stops the loops and drains background work, vector documents, and
    /// pending writes. Calling it again after a completed shutdown is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Lifecycle`] when a shutdown is already in progress.
    pub async fn shutdown(&self) -> EngineResult<()> {
        {
            let mut lifecycle = self.lifecycle();
            if lifecycle.state().is_terminal() {
                return Ok(());
            }
            lifecycle.transition(LifecycleEvent::Drain)?;
        }

        self.shutdown.send_replace(true);
        let loops: Vec<JoinHandle<()>> = self.loops.lock().await.drain(..).collect();
        for handle in loops {
            if let Err(err) = handle.await {
                warn!(?err, "background loop terminated abnormally");
            }
        }

        self.inner.scheduler.wait_idle().await;
        let flushed = self.inner.queue.flush_pending().await;
        self.inner.cache.close().await;
        self.inner.scheduler.close();

        self.lifecycle().transition(LifecycleEvent::Stop)?;
        let pending_vectors = self.inner.queue.pending_len().await;
        info!(
            delivered = flushed.delivered,
            requeued = flushed.requeued,
            pending_vectors,
            "sync engine stopped"
        );
        Ok(())
    }

    /// Writes an entry to the hot tier and schedules persistence, indexing, and
    /// consumer fan-out.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotRunning`] outside the running state and
    /// [`EngineError::Memory`] for invalid entries.
    pub async fn store(&self, request: StoreRequest) -> EngineResult<StoreOutcome> {
        self.ensure_running()?;
        let outcome = self.inner.cache.store(request, SystemTime::now()).await?;

        let inner = Arc::clone(&self.inner);
        let entry = outcome.entry.clone();
        self.inner.scheduler.spawn(async move {
            inner.queue.enqueue(&entry).await;
            inner
                .views
                .fan_out(&inner.cache, entry.key(), SystemTime::now())
                .await;
        })?;

        debug!(
            key = outcome.entry.key(),
            updated = outcome.updated,
            tier = "hot",
            "entry stored"
        );
        Ok(outcome)
    }

    /// Reads `key` through every tier, promoting colder hits to the hot tier.
    pub async fn retrieve(&self, key: &str) -> Option<MemoryEntry> {
        self.inner.cache.retrieve(key, SystemTime::now()).await
    }

    /// Reads `key` on behalf of `consumer`, hiding entries it may not see.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Budget`] with an unknown-consumer error when
    /// `consumer` is not registered.
    pub async fn retrieve_as(
        &self,
        consumer: &ConsumerId,
        key: &str,
    ) -> EngineResult<Option<MemoryEntry>> {
        let handle = self.handle(consumer)?;
        let now = SystemTime::now();
        let visible = self
            .inner
            .cache
            .current(key, now)
            .await
            .is_some_and(|entry| {
                entry.is_visible_to(consumer, handle.adapter().readable_scopes())
            });
        if !visible {
            return Ok(None);
        }
        Ok(self.inner.cache.retrieve(key, now).await)
    }

    /// Deletes `key` from every tier and retracts it from consumers.
    ///
    /// Returns `true` if a live entry existed.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotRunning`] outside the running state.
    pub async fn delete(&self, key: &str) -> EngineResult<bool> {
        self.ensure_running()?;
        let existed = self.inner.cache.delete(key, SystemTime::now()).await;
        self.inner.queue.discard(key).await;

        let inner = Arc::clone(&self.inner);
        let key = key.to_owned();
        self.inner.scheduler.spawn(async move {
            inner.views.retract_everywhere(&key).await;
        })?;
        Ok(existed)
    }

    /// Keyword search; score is the fraction of query terms found.
    pub async fn search(&self, query: &str, limit: usize) -> Vec<SearchHit> {
        self.inner
            .cache
            .search(query, limit, SystemTime::now())
            .await
    }

    /// Registers a consumer's adapter and budget.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Adapter`] for duplicate consumers and
    /// [`EngineError::NotRunning`] once shutdown started.
    pub fn register_consumer(&self, adapter: Arc<dyn ToolAdapter>) -> EngineResult<AdapterHandle> {
        let state = self.state();
        if !matches!(state, EngineState::Created | EngineState::Running) {
            return Err(EngineError::not_running(state));
        }
        let handle = self.inner.views.register(adapter)?;
        info!(
            consumer = %handle.consumer_id(),
            window = handle.adapter().context_window_tokens(),
            "consumer registered"
        );
        Ok(handle)
    }

    /// Removes a consumer. Returns `false` if it was not registered.
    pub fn deregister_consumer(&self, consumer: &ConsumerId) -> bool {
        let removed = self.inner.views.deregister(consumer);
        if removed {
            info!(consumer = %consumer, "consumer deregistered");
        }
        removed
    }

    fn handle(&self, consumer: &ConsumerId) -> EngineResult<AdapterHandle> {
        self.inner
            .views
            .registry()
            .get(consumer)
            .ok_or_else(|| {
                BudgetError::UnknownConsumer {
                    consumer: consumer.clone(),
                }
                .into()
            })
    }

    /// Tokens still free in `consumer`'s window.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Budget`] for unknown consumers.
    pub fn available_budget(&self, consumer: &ConsumerId) -> EngineResult<usize> {
        Ok(self.inner.views.budget().available(consumer)?)
    }

    /// Window, reservation, and remaining budget of `consumer`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Budget`] for unknown consumers.
    pub fn budget_snapshot(&self, consumer: &ConsumerId) -> EngineResult<BudgetSnapshot> {
        Ok(self.inner.views.budget().snapshot(consumer)?)
    }

    /// Marks `key` as required for `consumer`. Takes effect on the next sync.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Budget`] for unknown consumers.
    pub async fn pin(&self, consumer: &ConsumerId, key: &str) -> EngineResult<bool> {
        Ok(self.inner.views.pin(consumer, key).await?)
    }

    /// Clears the required mark of `key` for `consumer`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Budget`] for unknown consumers.
    pub async fn unpin(&self, consumer: &ConsumerId, key: &str) -> EngineResult<bool> {
        Ok(self.inner.views.unpin(consumer, key).await?)
    }

    /// Recomputes `consumer`'s projection and pushes the difference to its
    /// adapter.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotRunning`] outside the running state and
    /// [`EngineError::Budget`] for unknown consumers.
    pub async fn sync_consumer(&self, consumer: &ConsumerId) -> EngineResult<SyncReport> {
        self.ensure_running()?;
        let report = self
            .inner
            .views
            .sync_consumer(&self.inner.cache, consumer, SystemTime::now())
            .await?;
        Ok(report)
    }

    /// Adapter stats together with the failures recorded for `consumer`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Budget`] for unknown consumers and
    /// [`EngineError::Adapter`] when the adapter cannot report.
    pub async fn consumer_report(&self, consumer: &ConsumerId) -> EngineResult<AdapterReport> {
        Ok(self.handle(consumer)?.report().await?)
    }

    /// Delivers every pending vector document now.
    pub async fn flush_vectors(&self) -> FlushReport {
        self.inner.queue.flush_pending().await
    }

    /// Runs a reaper pass immediately, including the durable sweep.
    pub async fn reap_now(&self) -> ReapReport {
        reap_once(&self.inner, SystemTime::now(), true).await
    }

    /// Waits until background fan-out and indexing tasks have finished.
    pub async fn settle(&self) {
        self.inner.scheduler.wait_idle().await;
    }

    /// Collects engine metrics.
    pub async fn stats(&self) -> EngineStats {
        let registry = self.inner.views.registry();
        let consumers = self
            .inner
            .views
            .budget()
            .snapshots()
            .into_iter()
            .map(|(consumer, budget)| {
                let sync_failures = registry
                    .get(&consumer)
                    .map_or(0, |handle| handle.failures());
                ConsumerStats {
                    consumer,
                    budget,
                    sync_failures,
                }
            })
            .collect();

        EngineStats {
            state: self.state(),
            hot: self.inner.cache.hot_stats().await,
            vector: self.inner.queue.stats().await,
            persist_backlog: self.inner.cache.persist_backlog(),
            background_tasks: self.inner.scheduler.in_flight(),
            consumers,
        }
    }

    /// Compares live metrics with the configured health thresholds.
    pub async fn health(&self) -> HealthReport {
        let vector = self.inner.queue.stats().await;
        assess(&HealthInputs {
            pending_vectors: vector.pending,
            failed_batches: vector.failed_batches,
            adapter_failures: self.inner.views.registry().total_failures(),
            persist_backlog: self.inner.cache.persist_backlog(),
            thresholds: self.inner.thresholds,
        })
    }
}
