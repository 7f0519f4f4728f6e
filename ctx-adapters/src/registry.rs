//! Registry of adapters keyed by consumer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use ctx_primitives::ConsumerId;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::adapter::{AdapterError, AdapterResult, AdapterStats, ToolAdapter};

/// Adapter usage together with the failures the engine recorded for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterReport {
    /// Consumer behind the adapter.
    pub consumer: ConsumerId,
    /// Usage reported by the adapter.
    pub stats: AdapterStats,
    /// Sync calls that failed since registration.
    pub sync_failures: u64,
}

/// Handle returned by the registry for direct use.
#[derive(Clone)]
pub struct AdapterHandle {
    adapter: Arc<dyn ToolAdapter>,
    failures: Arc<AtomicU64>,
}

impl AdapterHandle {
    /// Returns the consumer identifier.
    #[must_use]
    pub fn consumer_id(&self) -> &ConsumerId {
        self.adapter.consumer_id()
    }

    /// Returns the underlying adapter.
    #[must_use]
    pub fn adapter(&self) -> &Arc<dyn ToolAdapter> {
        &self.adapter
    }

    /// Counts a failed sync call and returns the new total.
    pub fn record_failure(&self) -> u64 {
        self.failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Failed sync calls so far.
    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Collects the adapter's stats along with its failure count.
    ///
    /// # Errors
    ///
    /// Propagates errors returned by [`ToolAdapter::stats`].
    pub async fn report(&self) -> AdapterResult<AdapterReport> {
        Ok(AdapterReport {
            consumer: self.consumer_id().clone(),
            stats: self.adapter.stats().await?,
            sync_failures: self.failures(),
        })
    }
}

impl std::fmt::Debug for AdapterHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterHandle")
            .field("consumer", self.consumer_id())
            .field("failures", &self.failures())
            .finish_non_exhaustive()
    }
}

/// Registry that stores adapters keyed by consumer identifier.
#[derive(Default)]
pub struct AdapterRegistry {
    inner: RwLock<HashMap<ConsumerId, AdapterHandle>>,
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("registered", &self.consumers())
            .finish()
    }
}

impl AdapterRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<ConsumerId, AdapterHandle>> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<ConsumerId, AdapterHandle>> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers an adapter.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError::DuplicateAdapter`] if the consumer is already present.
    pub fn register(&self, adapter: Arc<dyn ToolAdapter>) -> AdapterResult<AdapterHandle> {
        let mut inner = self.write();
        let consumer = adapter.consumer_id().clone();
        if inner.contains_key(&consumer) {
            return Err(AdapterError::DuplicateAdapter { consumer });
        }

        let handle = AdapterHandle {
            adapter,
            failures: Arc::new(AtomicU64::new(0)),
        };
        inner.insert(consumer.clone(), handle.clone());
        debug!(consumer = %consumer, "adapter registered");
        Ok(handle)
    }

    /// Removes the adapter for `consumer`.
    pub fn deregister(&self, consumer: &ConsumerId) -> Option<AdapterHandle> {
        let removed = self.write().remove(consumer);
        if removed.is_some() {
            debug!(consumer = %consumer, "adapter deregistered");
        }
        removed
    }

    /// Returns the handle for `consumer`.
    #[must_use]
    pub fn get(&self, consumer: &ConsumerId) -> Option<AdapterHandle> {
        self.read().get(consumer).cloned()
    }

    /// Returns every handle ordered by consumer identifier.
    #[must_use]
    pub fn handles(&self) -> Vec<AdapterHandle> {
        let mut handles: Vec<AdapterHandle> = self.read().values().cloned().collect();
        handles.sort_by(|a, b| a.consumer_id().cmp(b.consumer_id()));
        handles
    }

    /// Lists registered consumers in order.
    #[must_use]
    pub fn consumers(&self) -> Vec<ConsumerId> {
        let mut consumers: Vec<ConsumerId> = self.read().keys().cloned().collect();
        consumers.sort();
        consumers
    }

    /// Number of registered adapters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Returns `true` when no adapter is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Sum of recorded failures across adapters.
    #[must_use]
    pub fn total_failures(&self) -> u64 {
        self.read().values().map(AdapterHandle::failures).sum()
    }
}
