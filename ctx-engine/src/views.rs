//! Per-consumer projections and their budget bookkeeping.
//!
//! Each consumer has a view recording which keys its adapter holds, at which
//! compression level, and how many tokens each reserves. Every adapter call
//! for a consumer happens under that consumer's view lock, so budget release
//! and adapter state never drift apart.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::SystemTime;

use ctx_adapters::{AdapterHandle, AdapterRegistry, AdapterResult, ToolAdapter};
use ctx_budget::{BudgetError, BudgetResult, ContextOptimizer, ProjectionStats, TokenBudgetManager};
use ctx_memory::{CompressionLevel, MemoryEntry};
use ctx_primitives::ConsumerId;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::cache::CacheManager;

#[derive(Debug, Clone, PartialEq, Eq)]
struct ViewSlot {
    tokens: usize,
    level: CompressionLevel,
    content_hash: String,
    expires_at: SystemTime,
}

#[derive(Debug, Default)]
struct ConsumerView {
    entries: HashMap<String, ViewSlot>,
    pinned: HashSet<String>,
}

type SharedView = Arc<Mutex<ConsumerView>>;

/// Outcome of a full consumer sync.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    /// Entries newly pushed to the adapter.
    pub created: usize,
    /// Entries replaced in the adapter.
    pub updated: usize,
    /// Entries removed from the adapter.
    pub deleted: usize,
    /// Entries already present at the same content and level.
    pub unchanged: usize,
    /// Adapter calls that failed.
    pub failed: usize,
    /// Accounting of the projection that was applied.
    pub stats: ProjectionStats,
}

/// Registered adapters together with the views the engine keeps for them.
#[derive(Debug)]
pub(crate) struct ConsumerViews {
    registry: AdapterRegistry,
    budget: TokenBudgetManager,
    optimizer: ContextOptimizer,
    views: RwLock<HashMap<ConsumerId, SharedView>>,
}

impl ConsumerViews {
    pub(crate) fn new(optimizer: ContextOptimizer) -> Self {
        Self {
            registry: AdapterRegistry::new(),
            budget: TokenBudgetManager::new(),
            optimizer,
            views: RwLock::new(HashMap::new()),
        }
    }

    pub(crate) fn registry(&self) -> &AdapterRegistry {
        &self.registry
    }

    pub(crate) fn budget(&self) -> &TokenBudgetManager {
        &self.budget
    }

    fn view(&self, consumer: &ConsumerId) -> Option<SharedView> {
        self.views
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(consumer)
            .cloned()
    }

    pub(crate) fn register(&self, adapter: Arc<dyn ToolAdapter>) -> AdapterResult<AdapterHandle> {
        let window = adapter.context_window_tokens();
        let handle = self.registry.register(adapter)?;
        let consumer = handle.consumer_id().clone();
        self.budget.register_consumer(consumer.clone(), window);
        self.views
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(consumer, SharedView::default());
        Ok(handle)
    }

    pub(crate) fn deregister(&self, consumer: &ConsumerId) -> bool {
        let removed = self.registry.deregister(consumer).is_some();
        self.views
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(consumer);
        self.budget.deregister_consumer(consumer);
        removed
    }

    /// Pushes the current value of `key` to every consumer that may see it,
    /// and retracts it from consumers that no longer may.
    pub(crate) async fn fan_out(&self, cache: &CacheManager, key: &str, now: SystemTime) {
        let handles = self.registry.handles();
        join_all(
            handles
                .iter()
                .map(|handle| self.refresh(handle, cache, key, now)),
        )
        .await;
    }

    async fn refresh(&self, handle: &AdapterHandle, cache: &CacheManager, key: &str, now: SystemTime) {
        let Some(view) = self.view(handle.consumer_id()) else {
            return;
        };
        let mut view = view.lock().await;
        // Read under the view lock so concurrent refreshes of the same key
        // converge on the newest value.
        let current = cache.current(key, now).await;
        let adapter = handle.adapter();
        match current {
            Some(entry)
                if entry.is_visible_to(handle.consumer_id(), adapter.readable_scopes()) =>
            {
                if let Some(slot) = view.entries.get(key) {
                    self.release(handle.consumer_id(), slot.tokens);
                }
                self.push(handle, &mut view, &entry).await;
            }
            _ => self.retract_locked(handle, &mut view, key).await,
        }
    }

    /// Admits `entry` against the budget and mirrors it into the adapter. The
    /// previous reservation for the key must already be released.
    async fn push(&self, handle: &AdapterHandle, view: &mut ConsumerView, entry: &MemoryEntry) {
        let consumer = handle.consumer_id();
        let key = entry.key();
        let existed = view.entries.contains_key(key);
        let pinned = view.pinned.contains(key);

        let admitted = match self.admit(consumer, entry, pinned) {
            Ok(admitted) => admitted,
            Err(err) => {
                debug!(consumer = %consumer, key, ?err, "consumer left before projection");
                view.entries.remove(key);
                return;
            }
        };
        let Some((projected, tokens)) = admitted else {
            debug!(consumer = %consumer, key, "entry does not fit remaining budget");
            if view.entries.remove(key).is_some() {
                self.call_delete(handle, key).await;
            }
            return;
        };

        let result = if existed {
            handle.adapter().sync_update(key, &projected).await
        } else {
            handle.adapter().sync_create(key, &projected).await
        };
        match result {
            Ok(()) => {
                view.entries.insert(
                    key.to_owned(),
                    ViewSlot {
                        tokens,
                        level: projected.compression_level(),
                        content_hash: entry.metadata().content_hash.clone(),
                        expires_at: entry.expires_at(),
                    },
                );
            }
            Err(err) => {
                let failures = handle.record_failure();
                warn!(consumer = %consumer, key, ?err, failures, "adapter sync failed");
                self.release(consumer, tokens);
                if view.entries.remove(key).is_some() {
                    self.call_delete(handle, key).await;
                }
            }
        }
    }

    /// Reserves the lightest level that fits; pinned entries fall back to a
    /// partial reservation at heavy compression.
    fn admit(
        &self,
        consumer: &ConsumerId,
        entry: &MemoryEntry,
        pinned: bool,
    ) -> BudgetResult<Option<(MemoryEntry, usize)>> {
        for level in CompressionLevel::ESCALATION {
            let (projected, tokens) = self.optimizer.render(entry, level);
            match self.budget.reserve(consumer, tokens) {
                Ok(()) => return Ok(Some((projected, tokens))),
                Err(BudgetError::Insufficient { .. }) => {}
                Err(err) => return Err(err),
            }
        }
        if !pinned {
            return Ok(None);
        }
        let (projected, tokens) = self.optimizer.render(entry, CompressionLevel::Heavy);
        let granted = self.budget.reserve_up_to(consumer, tokens)?;
        Ok(Some((projected, granted)))
    }

    /// Removes `key` from one consumer's adapter.
    pub(crate) async fn retract(&self, consumer: &ConsumerId, key: &str) {
        let (Some(handle), Some(view)) = (self.registry.get(consumer), self.view(consumer)) else {
            return;
        };
        let mut view = view.lock().await;
        self.retract_locked(&handle, &mut view, key).await;
    }

    /// Removes `key` from every adapter holding it.
    pub(crate) async fn retract_everywhere(&self, key: &str) {
        let consumers = self.registry.consumers();
        join_all(consumers.iter().map(|consumer| self.retract(consumer, key))).await;
    }

    /// Retracts every projected entry whose lifetime ended, returning how many
    /// were removed.
    pub(crate) async fn retract_expired(&self, now: SystemTime) -> usize {
        let mut retracted = 0;
        for handle in self.registry.handles() {
            let Some(view) = self.view(handle.consumer_id()) else {
                continue;
            };
            let mut view = view.lock().await;
            let expired: Vec<String> = view
                .entries
                .iter()
                .filter(|(_, slot)| slot.expires_at <= now)
                .map(|(key, _)| key.clone())
                .collect();
            for key in expired {
                self.retract_locked(&handle, &mut view, &key).await;
                retracted += 1;
            }
        }
        retracted
    }

    async fn retract_locked(&self, handle: &AdapterHandle, view: &mut ConsumerView, key: &str) {
        if let Some(slot) = view.entries.remove(key) {
            self.release(handle.consumer_id(), slot.tokens);
            self.call_delete(handle, key).await;
        }
    }

    async fn call_delete(&self, handle: &AdapterHandle, key: &str) {
        if let Err(err) = handle.adapter().sync_delete(key).await {
            let failures = handle.record_failure();
            warn!(consumer = %handle.consumer_id(), key, ?err, failures, "adapter delete failed");
        }
    }

    fn release(&self, consumer: &ConsumerId, tokens: usize) {
        if let Err(err) = self.budget.release(consumer, tokens) {
            debug!(consumer = %consumer, tokens, ?err, "release skipped");
        }
    }

    /// Marks `key` as required for `consumer`.
    pub(crate) async fn pin(&self, consumer: &ConsumerId, key: &str) -> BudgetResult<bool> {
        let view = self.view(consumer).ok_or_else(|| BudgetError::UnknownConsumer {
            consumer: consumer.clone(),
        })?;
        Ok(view.lock().await.pinned.insert(key.to_owned()))
    }

    /// Clears the required mark of `key` for `consumer`.
    pub(crate) async fn unpin(&self, consumer: &ConsumerId, key: &str) -> BudgetResult<bool> {
        let view = self.view(consumer).ok_or_else(|| BudgetError::UnknownConsumer {
            consumer: consumer.clone(),
        })?;
        Ok(view.lock().await.pinned.remove(key))
    }

    /// Recomputes the whole projection for `consumer` and applies the diff to
    /// its adapter.
    pub(crate) async fn sync_consumer(
        &self,
        cache: &CacheManager,
        consumer: &ConsumerId,
        now: SystemTime,
    ) -> BudgetResult<SyncReport> {
        let unknown = || BudgetError::UnknownConsumer {
            consumer: consumer.clone(),
        };
        let handle = self.registry.get(consumer).ok_or_else(unknown)?;
        let view = self.view(consumer).ok_or_else(unknown)?;
        let mut view = view.lock().await;

        let held: usize = view.entries.values().map(|slot| slot.tokens).sum();
        self.release(consumer, held);

        let scopes = handle.adapter().readable_scopes();
        let candidates: Vec<MemoryEntry> = cache
            .live_entries(now)
            .await
            .into_iter()
            .filter(|entry| entry.is_visible_to(consumer, scopes))
            .collect();
        let projection = match self
            .optimizer
            .optimize(&self.budget, consumer, candidates, &view.pinned, now)
        {
            Ok(projection) => projection,
            Err(err) => {
                view.entries.clear();
                return Err(err);
            }
        };

        let mut report = SyncReport {
            stats: projection.stats.clone(),
            ..SyncReport::default()
        };
        let mut previous = std::mem::take(&mut view.entries);

        for projected in projection.entries {
            let entry = projected.entry;
            let key = entry.key().to_owned();
            let slot = ViewSlot {
                tokens: projected.tokens,
                level: entry.compression_level(),
                content_hash: entry.metadata().content_hash.clone(),
                expires_at: entry.expires_at(),
            };
            let old = previous.remove(&key);
            let same = old.as_ref().is_some_and(|old| {
                old.level == slot.level && old.content_hash == slot.content_hash
            });
            if same {
                report.unchanged += 1;
                view.entries.insert(key, slot);
                continue;
            }

            let result = if old.is_some() {
                handle.adapter().sync_update(&key, &entry).await
            } else {
                handle.adapter().sync_create(&key, &entry).await
            };
            match result {
                Ok(()) => {
                    if old.is_some() {
                        report.updated += 1;
                    } else {
                        report.created += 1;
                    }
                    view.entries.insert(key, slot);
                }
                Err(err) => {
                    let failures = handle.record_failure();
                    warn!(consumer = %consumer, key = %key, ?err, failures, "adapter sync failed");
                    report.failed += 1;
                    self.release(consumer, slot.tokens);
                    if old.is_some() {
                        self.call_delete(&handle, &key).await;
                    }
                }
            }
        }

        let mut stale: Vec<String> = previous.into_keys().collect();
        stale.sort();
        for key in stale {
            match handle.adapter().sync_delete(&key).await {
                Ok(()) => report.deleted += 1,
                Err(err) => {
                    let failures = handle.record_failure();
                    warn!(consumer = %consumer, key = %key, ?err, failures, "adapter delete failed");
                    report.failed += 1;
                }
            }
        }

        debug!(
            consumer = %consumer,
            created = report.created,
            updated = report.updated,
            deleted = report.deleted,
            unchanged = report.unchanged,
            failed = report.failed,
            "consumer synced"
        );
        Ok(report)
    }
}
