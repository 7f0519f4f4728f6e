//! Tiered cache manager: hot tier in front of the write-behind durable tiers.

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use ctx_memory::{
    Content, DEFAULT_CATEGORY, EntryType, HotTier, HotTierStats, MemoryEntry, MemoryResult,
    RetentionPolicy, ScanFilter, Scope, StorageTier,
};
use ctx_primitives::ConsumerId;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::persist::{DurableTiers, PendingWrite, WriteBehind};

/// Parameters of a store call.
#[derive(Debug, Clone)]
pub struct StoreRequest {
    key: String,
    content: Content,
    entry_type: EntryType,
    scope: Scope,
    priority: i32,
    ttl: Option<Duration>,
    source_consumer: Option<ConsumerId>,
    relevance: f32,
    category: Option<String>,
}

impl StoreRequest {
    /// Shared, session-scoped request with default priority and relevance.
    #[must_use]
    pub fn new(key: impl Into<String>, content: impl Into<Content>) -> Self {
        Self {
            key: key.into(),
            content: content.into(),
            entry_type: EntryType::Shared,
            scope: Scope::Session,
            priority: 0,
            ttl: None,
            source_consumer: None,
            relevance: 0.5,
            category: None,
        }
    }

    /// Sets the ownership model.
    #[must_use]
    pub fn entry_type(mut self, entry_type: EntryType) -> Self {
        self.entry_type = entry_type;
        self
    }

    /// Sets the scope.
    #[must_use]
    pub fn scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    /// Sets the priority.
    #[must_use]
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Sets an explicit lifetime, bypassing the retention policy.
    #[must_use]
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Sets the producing consumer.
    #[must_use]
    pub fn source_consumer(mut self, consumer: ConsumerId) -> Self {
        self.source_consumer = Some(consumer);
        self
    }

    /// Sets the relevance score.
    #[must_use]
    pub fn relevance(mut self, score: f32) -> Self {
        self.relevance = score;
        self
    }

    /// Sets the routing category.
    #[must_use]
    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    /// Returns the key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }
}

/// Result of a store call.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreOutcome {
    /// The entry as written to the hot tier.
    pub entry: MemoryEntry,
    /// `true` when a live entry with the same key was replaced.
    pub updated: bool,
    /// Keys pushed out of the hot tier by this write. They stay in the
    /// durable tiers.
    pub evicted: Vec<String>,
}

/// One search result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    /// Entry key.
    pub key: String,
    /// Uncompressed content.
    pub content: Content,
    /// Fraction of query terms found in the content.
    pub score: f32,
}

/// Owns the hot tier and coordinates promotion from the durable tiers.
#[derive(Debug)]
pub(crate) struct CacheManager {
    hot: HotTier,
    tiers: DurableTiers,
    writer: WriteBehind,
    retention: RetentionPolicy,
}

impl CacheManager {
    pub(crate) fn new(hot: HotTier, tiers: DurableTiers, retention: RetentionPolicy) -> Self {
        let writer = WriteBehind::spawn(tiers.clone());
        Self {
            hot,
            tiers,
            writer,
            retention,
        }
    }

    pub(crate) async fn store(
        &self,
        request: StoreRequest,
        now: SystemTime,
    ) -> MemoryResult<StoreOutcome> {
        let category = request
            .category
            .unwrap_or_else(|| DEFAULT_CATEGORY.to_owned());
        let ttl = self.retention.resolve(request.ttl, request.scope, &category);
        let mut builder = MemoryEntry::builder(request.key, request.content)
            .entry_type(request.entry_type)
            .scope(request.scope)
            .priority(request.priority)
            .ttl(ttl)
            .relevance(request.relevance)
            .category(category)
            .timestamp(now);
        if let Some(consumer) = request.source_consumer {
            builder = builder.source_consumer(consumer);
        }
        let mut entry = builder.build()?;

        let previous = self.current(entry.key(), now).await;
        if let Some(previous) = &previous {
            entry.inherit_history(previous);
        }

        let evicted: Vec<String> = self
            .hot
            .insert(entry.clone(), entry.expires_at())
            .await
            .iter()
            .map(|evicted| evicted.key().to_owned())
            .collect();
        if !evicted.is_empty() {
            debug!(key = entry.key(), evicted = ?evicted, "hot tier evicted entries");
        }
        self.writer.put(entry.clone());

        Ok(StoreOutcome {
            entry,
            updated: previous.is_some(),
            evicted,
        })
    }

    /// Looks up `key` through every tier, recording the access and promoting
    /// colder hits into the hot tier.
    pub(crate) async fn retrieve(&self, key: &str, now: SystemTime) -> Option<MemoryEntry> {
        if let Some(entry) = self.hot.get(key, now).await {
            return Some(entry);
        }

        let (mut entry, tier) = match self.writer.pending(key) {
            Some(PendingWrite::Tombstone) => return None,
            Some(PendingWrite::Live(entry)) if entry.is_expired_at(now) => return None,
            Some(PendingWrite::Live(entry)) => (entry, StorageTier::Hot),
            None => self.read_durable(key, now).await?,
        };

        entry.touch(now);
        let hot_deadline = now
            .checked_add(self.hot.config().default_ttl())
            .map_or(entry.expires_at(), |cap| entry.expires_at().min(cap));
        match self.hot.promote(entry.clone(), hot_deadline, now).await {
            Some(evicted) => {
                debug!(key, from = tier.as_str(), evicted = evicted.len(), "entry promoted to hot tier");
            }
            // A concurrent store or promotion won; serve the resident copy.
            None => {
                if let Some(resident) = self.hot.get(key, now).await {
                    return Some(resident);
                }
            }
        }
        entry.set_storage_tier(tier);
        Some(entry)
    }

    /// Current live value of `key` without recording an access or promoting.
    pub(crate) async fn current(&self, key: &str, now: SystemTime) -> Option<MemoryEntry> {
        if let Some(entry) = self.hot.peek(key, now).await {
            return Some(entry);
        }
        match self.writer.pending(key) {
            Some(PendingWrite::Tombstone) => None,
            Some(PendingWrite::Live(entry)) => (!entry.is_expired_at(now)).then_some(entry),
            None => self.read_durable(key, now).await.map(|(entry, _)| entry),
        }
    }

    pub(crate) async fn delete(&self, key: &str, now: SystemTime) -> bool {
        let existed = self.current(key, now).await.is_some();
        self.hot.remove(key).await;
        self.writer.delete(key);
        existed
    }

    /// Keyword search over the cold tier, overlaid with newer hot and pending
    /// values.
    pub(crate) async fn search(&self, query: &str, limit: usize, now: SystemTime) -> Vec<SearchHit> {
        let mut terms: Vec<String> = query
            .split_whitespace()
            .map(str::to_lowercase)
            .collect();
        terms.sort();
        terms.dedup();
        if terms.is_empty() || limit == 0 {
            return Vec::new();
        }

        let filter = ScanFilter::all().with_terms(&terms);
        let candidates = self.collect_live(&filter, now).await;

        #[allow(clippy::cast_precision_loss)]
        let total = terms.len() as f32;
        let mut hits: Vec<SearchHit> = candidates
            .into_values()
            .filter_map(|entry| {
                let haystack = entry.content().as_text().to_lowercase();
                let matched = terms
                    .iter()
                    .filter(|term| haystack.contains(term.as_str()))
                    .count();
                #[allow(clippy::cast_precision_loss)]
                let score = matched as f32 / total;
                (matched > 0).then(|| SearchHit {
                    key: entry.key().to_owned(),
                    content: entry.content().clone(),
                    score,
                })
            })
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.key.cmp(&b.key)));
        hits.truncate(limit);
        hits
    }

    /// Every live entry across all tiers, newest value per key.
    pub(crate) async fn live_entries(&self, now: SystemTime) -> Vec<MemoryEntry> {
        let mut entries: Vec<MemoryEntry> = self
            .collect_live(&ScanFilter::all(), now)
            .await
            .into_values()
            .collect();
        entries.sort_by(|a, b| a.key().cmp(b.key()));
        entries
    }

    async fn collect_live(
        &self,
        filter: &ScanFilter,
        now: SystemTime,
    ) -> HashMap<String, MemoryEntry> {
        let mut live = HashMap::new();
        match self.tiers.cold.scan(filter).await {
            Ok(records) => {
                for (key, bytes) in records {
                    if let Some(entry) = decode(StorageTier::Cold, &key, &bytes) {
                        if !entry.is_expired_at(now) {
                            live.insert(key, entry);
                        }
                    }
                }
            }
            Err(err) => warn!(tier = "cold", ?err, "storage scan failed"),
        }

        for (key, pending) in self.writer.pending_writes() {
            match pending {
                PendingWrite::Live(entry) if !entry.is_expired_at(now) => {
                    live.insert(key, entry);
                }
                _ => {
                    live.remove(&key);
                }
            }
        }

        for entry in self.hot.snapshot(now).await {
            live.insert(entry.key().to_owned(), entry);
        }
        live
    }

    /// Removes expired entries from the hot tier, returning the entries whose
    /// lifetime ended.
    pub(crate) async fn reap(&self, now: SystemTime) -> Vec<MemoryEntry> {
        self.hot
            .reap_expired(now)
            .await
            .into_iter()
            .filter(|entry| entry.is_expired_at(now))
            .collect()
    }

    /// Deletes expired records from the warm and cold tiers.
    pub(crate) async fn sweep_durable(&self, now: SystemTime) -> usize {
        let mut removed = 0;
        for tier in [StorageTier::Warm, StorageTier::Cold] {
            let Some(backend) = self.tiers.backend(tier) else {
                continue;
            };
            let records = match backend.scan(&ScanFilter::all()).await {
                Ok(records) => records,
                Err(err) => {
                    warn!(tier = tier.as_str(), ?err, "storage scan failed during sweep");
                    continue;
                }
            };
            for (key, bytes) in records {
                let expired = decode(tier, &key, &bytes).is_some_and(|entry| entry.is_expired_at(now));
                if !expired
                    || self.writer.pending(&key).is_some()
                    || self.hot.peek(&key, now).await.is_some()
                {
                    continue;
                }
                match backend.delete(&key).await {
                    Ok(()) => removed += 1,
                    Err(err) => warn!(key = %key, tier = tier.as_str(), ?err, "storage delete failed during sweep"),
                }
            }
        }
        if removed > 0 {
            debug!(removed, "expired durable records swept");
        }
        self.compact_durable().await;
        removed
    }

    async fn compact_durable(&self) {
        for tier in [StorageTier::Warm, StorageTier::Cold] {
            let Some(backend) = self.tiers.backend(tier) else {
                continue;
            };
            match backend.compact_if_needed(self.tiers.compact_after_ops).await {
                Ok(true) => debug!(tier = tier.as_str(), "durable tier compacted"),
                Ok(false) => {}
                Err(err) => warn!(tier = tier.as_str(), ?err, "storage compaction failed"),
            }
        }
    }

    async fn read_durable(&self, key: &str, now: SystemTime) -> Option<(MemoryEntry, StorageTier)> {
        for tier in [StorageTier::Warm, StorageTier::Cold] {
            let backend = self.tiers.backend(tier)?;
            let bytes = match backend.get(key).await {
                Ok(Some(bytes)) => bytes,
                Ok(None) => continue,
                Err(err) => {
                    warn!(key, tier = tier.as_str(), ?err, "storage read failed; falling through");
                    continue;
                }
            };
            let Some(entry) = decode(tier, key, &bytes) else {
                continue;
            };
            if entry.is_expired_at(now) {
                continue;
            }
            return Some((entry, tier));
        }
        None
    }

    pub(crate) async fn hot_stats(&self) -> HotTierStats {
        self.hot.stats().await
    }

    pub(crate) fn persist_backlog(&self) -> usize {
        self.writer.backlog()
    }

    /// Drains the persistence queue.
    pub(crate) async fn close(&self) {
        self.writer.close().await;
    }
}

/// Decodes a durable record, rejecting anything that fails verification.
fn decode(tier: StorageTier, key: &str, bytes: &Bytes) -> Option<MemoryEntry> {
    let entry: MemoryEntry = match serde_json::from_slice(bytes) {
        Ok(entry) => entry,
        Err(err) => {
            warn!(target: "ctx_memory::integrity", key, tier = tier.as_str(), %err, "undecodable record treated as missing");
            return None;
        }
    };
    if entry.key() != key {
        warn!(target: "ctx_memory::integrity", key, stored_key = entry.key(), tier = tier.as_str(), "record key mismatch treated as missing");
        return None;
    }
    if entry.content().digest() != entry.metadata().content_hash {
        warn!(target: "ctx_memory::integrity", key, tier = tier.as_str(), "content hash mismatch treated as missing");
        return None;
    }
    Some(entry)
}
