//! Storage backend abstraction and an in-memory TTL implementation.

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::MemoryResult;
use crate::entry::saturating_add;

/// Selects records during a [`StorageBackend::scan`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanFilter {
    prefix: Option<String>,
    terms: Vec<String>,
}

impl ScanFilter {
    /// Matches every record.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Restricts matches to keys starting with `prefix`.
    #[must_use]
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// Restricts matches to values containing at least one of `terms`
    /// (case-insensitive). Blank terms are ignored.
    #[must_use]
    pub fn with_terms<I, S>(mut self, terms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.terms = terms
            .into_iter()
            .map(|term| term.as_ref().trim().to_lowercase())
            .filter(|term| !term.is_empty())
            .collect();
        self
    }

    /// Returns the key prefix, if any.
    #[must_use]
    pub fn prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    /// Returns the lowercase search terms.
    #[must_use]
    pub fn terms(&self) -> &[String] {
        &self.terms
    }

    /// Returns `true` when the record satisfies the filter.
    #[must_use]
    pub fn matches(&self, key: &str, value: &[u8]) -> bool {
        if let Some(prefix) = &self.prefix {
            if !key.starts_with(prefix.as_str()) {
                return false;
            }
        }
        if self.terms.is_empty() {
            return true;
        }
        let haystack = String::from_utf8_lossy(value).to_lowercase();
        self.terms.iter().any(|term| haystack.contains(term.as_str()))
    }
}

/// Utilisation snapshot reported by a backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendStats {
    /// Live records.
    pub entry_count: usize,
    /// Bytes held by live record values.
    pub bytes_used: usize,
}

/// Key/value store backing the warm and cold tiers.
///
/// Values are opaque to the backend; the cache manager encodes entries.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Fetches a live value.
    async fn get(&self, key: &str) -> MemoryResult<Option<Bytes>>;

    /// Inserts or replaces a value, expiring it after `ttl` when provided.
    async fn put(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> MemoryResult<()>;

    /// Removes a value if present.
    async fn delete(&self, key: &str) -> MemoryResult<()>;

    /// Returns live records matching `filter`, ordered by key.
    async fn scan(&self, filter: &ScanFilter) -> MemoryResult<Vec<(String, Bytes)>>;

    /// Reports utilisation.
    async fn stats(&self) -> MemoryResult<BackendStats>;

    /// Reclaims space held by superseded and deleted records once at least
    /// `min_ops` writes accumulated since the last compaction. Returns `true`
    /// when a compaction ran. Backends without a write log keep this no-op.
    async fn compact_if_needed(&self, min_ops: usize) -> MemoryResult<bool> {
        let _ = min_ops;
        Ok(false)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct StoredValue {
    pub(crate) value: Bytes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) expires_at: Option<SystemTime>,
}

impl StoredValue {
    pub(crate) fn new(value: Bytes, ttl: Option<Duration>, now: SystemTime) -> Self {
        Self {
            value,
            expires_at: ttl.map(|ttl| saturating_add(now, ttl)),
        }
    }

    pub(crate) fn is_live(&self, now: SystemTime) -> bool {
        self.expires_at.is_none_or(|deadline| now < deadline)
    }
}

pub(crate) fn scan_index(
    index: &HashMap<String, StoredValue>,
    filter: &ScanFilter,
    now: SystemTime,
) -> Vec<(String, Bytes)> {
    let mut matches: Vec<(String, Bytes)> = index
        .iter()
        .filter(|(key, stored)| stored.is_live(now) && filter.matches(key, &stored.value))
        .map(|(key, stored)| (key.clone(), stored.value.clone()))
        .collect();
    matches.sort_by(|a, b| a.0.cmp(&b.0));
    matches
}

pub(crate) fn index_stats(index: &HashMap<String, StoredValue>, now: SystemTime) -> BackendStats {
    index
        .values()
        .filter(|stored| stored.is_live(now))
        .fold(BackendStats::default(), |mut stats, stored| {
            stats.entry_count += 1;
            stats.bytes_used += stored.value.len();
            stats
        })
}

/// In-process backend honouring per-record TTLs. Used as the default warm tier.
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    values: RwLock<HashMap<String, StoredValue>>,
}

impl InMemoryBackend {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Physically drops expired records, returning how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let now = SystemTime::now();
        let mut guard = self.values.write().await;
        let before = guard.len();
        guard.retain(|_, stored| stored.is_live(now));
        before - guard.len()
    }
}

#[async_trait]
impl StorageBackend for InMemoryBackend {
    async fn get(&self, key: &str) -> MemoryResult<Option<Bytes>> {
        let now = SystemTime::now();
        let guard = self.values.read().await;
        Ok(guard
            .get(key)
            .filter(|stored| stored.is_live(now))
            .map(|stored| stored.value.clone()))
    }

    async fn put(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> MemoryResult<()> {
        let stored = StoredValue::new(value, ttl, SystemTime::now());
        self.values.write().await.insert(key.to_owned(), stored);
        Ok(())
    }

    async fn delete(&self, key: &str) -> MemoryResult<()> {
        self.values.write().await.remove(key);
        Ok(())
    }

    async fn scan(&self, filter: &ScanFilter) -> MemoryResult<Vec<(String, Bytes)>> {
        let guard = self.values.read().await;
        Ok(scan_index(&guard, filter, SystemTime::now()))
    }

    async fn stats(&self) -> MemoryResult<BackendStats> {
        let guard = self.values.read().await;
        Ok(index_stats(&guard, SystemTime::now()))
    }
}
