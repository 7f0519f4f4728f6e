//! In-process adapter that mirrors projected entries.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use ctx_budget::TokenEstimator;
use ctx_memory::{MemoryEntry, Scope};
use ctx_primitives::ConsumerId;
use tokio::sync::RwLock;

use crate::adapter::{AdapterError, AdapterResult, AdapterStats, ToolAdapter};

/// Adapter keeping its consumer's view in memory.
///
/// Useful for embedding consumers in the same process and for tests.
#[derive(Debug)]
pub struct LocalToolAdapter {
    consumer: ConsumerId,
    window: usize,
    scopes: Vec<Scope>,
    estimator: TokenEstimator,
    entries: RwLock<HashMap<String, MemoryEntry>>,
}

impl LocalToolAdapter {
    /// Creates an adapter for `consumer` with a `window`-token context.
    #[must_use]
    pub fn new(consumer: ConsumerId, window: usize) -> Self {
        Self {
            consumer,
            window,
            scopes: Scope::ALL.to_vec(),
            estimator: TokenEstimator::default(),
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Restricts the scopes the consumer reads.
    #[must_use]
    pub fn with_scopes(mut self, scopes: impl IntoIterator<Item = Scope>) -> Self {
        self.scopes = scopes.into_iter().collect();
        self
    }

    /// Uses `estimator` when reporting token usage.
    #[must_use]
    pub fn with_estimator(mut self, estimator: TokenEstimator) -> Self {
        self.estimator = estimator;
        self
    }

    /// Returns the mirrored entry for `key`.
    pub async fn get(&self, key: &str) -> Option<MemoryEntry> {
        self.entries.read().await.get(key).cloned()
    }

    /// Mirrored keys in order.
    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl ToolAdapter for LocalToolAdapter {
    fn consumer_id(&self) -> &ConsumerId {
        &self.consumer
    }

    fn context_window_tokens(&self) -> usize {
        self.window
    }

    fn readable_scopes(&self) -> &[Scope] {
        &self.scopes
    }

    async fn sync_create(&self, key: &str, entry: &MemoryEntry) -> AdapterResult<()> {
        self.entries
            .write()
            .await
            .insert(key.to_owned(), entry.clone());
        Ok(())
    }

    async fn sync_update(&self, key: &str, entry: &MemoryEntry) -> AdapterResult<()> {
        let mut guard = self.entries.write().await;
        let slot = guard.get_mut(key).ok_or_else(|| AdapterError::NotFound {
            key: key.to_owned(),
        })?;
        *slot = entry.clone();
        Ok(())
    }

    async fn sync_delete(&self, key: &str) -> AdapterResult<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn entry_count(&self) -> usize {
        self.entries.read().await.len()
    }

    async fn stats(&self) -> AdapterResult<AdapterStats> {
        let guard = self.entries.read().await;
        let mut compression_level_counts = BTreeMap::new();
        let mut estimated_token_usage = 0;
        for entry in guard.values() {
            *compression_level_counts
                .entry(entry.compression_level())
                .or_insert(0) += 1;
            estimated_token_usage += self.estimator.estimate_content(entry.content());
        }
        Ok(AdapterStats {
            entry_count: guard.len(),
            compression_level_counts,
            estimated_token_usage,
        })
    }
}
