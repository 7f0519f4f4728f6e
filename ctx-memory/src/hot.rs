//! In-process hot tier with expiry-ordered eviction.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use tokio::sync::RwLock;

use crate::entry::{MemoryEntry, StorageTier, from_millis, to_millis};

/// Configuration for the hot tier.
#[derive(Debug, Clone, Copy)]
pub struct HotTierConfig {
    max_entries: NonZeroUsize,
    default_ttl: Duration,
}

impl HotTierConfig {
    /// Creates a configuration with the provided capacity and promotion TTL.
    #[must_use]
    pub fn new(max_entries: NonZeroUsize, default_ttl: Duration) -> Self {
        Self {
            max_entries,
            default_ttl,
        }
    }

    /// Returns the maximum number of resident entries.
    #[must_use]
    pub const fn max_entries(self) -> NonZeroUsize {
        self.max_entries
    }

    /// Returns the TTL cap applied to entries promoted from colder tiers.
    #[must_use]
    pub const fn default_ttl(self) -> Duration {
        self.default_ttl
    }
}

impl Default for HotTierConfig {
    fn default() -> Self {
        Self {
            max_entries: NonZeroUsize::new(1024).unwrap_or(NonZeroUsize::MIN),
            default_ttl: Duration::from_secs(15 * 60),
        }
    }
}

// Field order drives the derived ordering: soonest expiry first, then lowest
// priority, then oldest insertion.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct ExpiryKey {
    expires_at: SystemTime,
    priority: i32,
    seq: u64,
    key: String,
}

// Access counters live in atomics so HOT reads only need the read guard.
#[derive(Debug)]
struct HotSlot {
    entry: MemoryEntry,
    expires_at: SystemTime,
    seq: u64,
    access_count: AtomicU64,
    last_accessed_ms: AtomicU64,
}

impl HotSlot {
    fn snapshot(&self) -> MemoryEntry {
        let mut entry = self.entry.clone();
        entry.set_storage_tier(StorageTier::Hot);
        let metadata = entry.metadata_mut();
        metadata.access_count = self.access_count.load(Ordering::Acquire);
        metadata.last_accessed = from_millis(self.last_accessed_ms.load(Ordering::Acquire));
        entry
    }

    fn is_live(&self, now: SystemTime) -> bool {
        now < self.expires_at && !self.entry.is_expired_at(now)
    }
}

#[derive(Debug, Default)]
struct HotInner {
    slots: HashMap<String, HotSlot>,
    expiry: BinaryHeap<Reverse<ExpiryKey>>,
    next_seq: u64,
    total_bytes: usize,
}

impl HotInner {
    fn is_current(&self, candidate: &ExpiryKey) -> bool {
        self.slots
            .get(&candidate.key)
            .is_some_and(|slot| slot.seq == candidate.seq)
    }

    fn remove_slot(&mut self, key: &str) -> Option<HotSlot> {
        let slot = self.slots.remove(key)?;
        self.total_bytes = self.total_bytes.saturating_sub(slot.entry.content().byte_len());
        Some(slot)
    }

    /// Pops heap items until a live (non-stale) one is found.
    fn pop_soonest(&mut self) -> Option<HotSlot> {
        while let Some(Reverse(candidate)) = self.expiry.pop() {
            if self.is_current(&candidate) {
                return self.remove_slot(&candidate.key);
            }
        }
        None
    }

    fn compact_heap(&mut self) {
        if self.expiry.len() <= self.slots.len() * 2 + 32 {
            return;
        }
        self.expiry = self
            .slots
            .iter()
            .map(|(key, slot)| {
                Reverse(ExpiryKey {
                    expires_at: slot.expires_at,
                    priority: slot.entry.priority(),
                    seq: slot.seq,
                    key: key.clone(),
                })
            })
            .collect();
    }
}

/// Bounded in-memory tier. Eviction removes the soonest-expiring entry first,
/// ties broken by lowest priority.
#[derive(Debug)]
pub struct HotTier {
    config: HotTierConfig,
    inner: RwLock<HotInner>,
}

impl HotTier {
    /// Creates an empty tier using the supplied configuration.
    #[must_use]
    pub fn new(config: HotTierConfig) -> Self {
        Self {
            config,
            inner: RwLock::new(HotInner::default()),
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> HotTierConfig {
        self.config
    }

    /// Inserts or replaces an entry that leaves the tier at `expires_at`, or
    /// at the entry's own expiry when that comes first.
    ///
    /// Returns the entries evicted to honour the capacity limit. The inserted
    /// entry itself is evicted when it is the soonest to expire.
    pub async fn insert(&self, entry: MemoryEntry, expires_at: SystemTime) -> Vec<MemoryEntry> {
        let mut guard = self.inner.write().await;
        self.insert_locked(&mut guard, entry, expires_at)
    }

    /// Inserts an entry read from a colder tier unless a live copy of the key
    /// is already resident. A resident slot past its deadline is replaced.
    ///
    /// Returns `None` when a resident copy won, otherwise the evicted entries.
    pub async fn promote(
        &self,
        entry: MemoryEntry,
        expires_at: SystemTime,
        now: SystemTime,
    ) -> Option<Vec<MemoryEntry>> {
        let mut guard = self.inner.write().await;
        if guard
            .slots
            .get(entry.key())
            .is_some_and(|slot| slot.is_live(now))
        {
            return None;
        }
        Some(self.insert_locked(&mut guard, entry, expires_at))
    }

    fn insert_locked(
        &self,
        guard: &mut HotInner,
        entry: MemoryEntry,
        expires_at: SystemTime,
    ) -> Vec<MemoryEntry> {
        guard.remove_slot(entry.key());
        // The heap is the only expiry index, so a slot never outlives its entry.
        let expires_at = expires_at.min(entry.expires_at());

        let seq = guard.next_seq;
        guard.next_seq += 1;
        let key = entry.key().to_owned();
        guard.expiry.push(Reverse(ExpiryKey {
            expires_at,
            priority: entry.priority(),
            seq,
            key: key.clone(),
        }));
        guard.total_bytes += entry.content().byte_len();
        let metadata = entry.metadata();
        let slot = HotSlot {
            access_count: AtomicU64::new(metadata.access_count),
            last_accessed_ms: AtomicU64::new(to_millis(metadata.last_accessed)),
            entry,
            expires_at,
            seq,
        };
        guard.slots.insert(key, slot);

        let mut evicted = Vec::new();
        while guard.slots.len() > self.config.max_entries().get() {
            match guard.pop_soonest() {
                Some(slot) => evicted.push(slot.entry),
                None => break,
            }
        }
        guard.compact_heap();
        evicted
    }

    /// Returns a live entry and records the access.
    pub async fn get(&self, key: &str, now: SystemTime) -> Option<MemoryEntry> {
        let guard = self.inner.read().await;
        let slot = guard.slots.get(key).filter(|slot| slot.is_live(now))?;
        slot.access_count.fetch_add(1, Ordering::AcqRel);
        slot.last_accessed_ms.store(to_millis(now), Ordering::Release);
        Some(slot.snapshot())
    }

    /// Returns a live entry without recording an access.
    pub async fn peek(&self, key: &str, now: SystemTime) -> Option<MemoryEntry> {
        let guard = self.inner.read().await;
        guard
            .slots
            .get(key)
            .filter(|slot| slot.is_live(now))
            .map(HotSlot::snapshot)
    }

    /// Returns `true` when `key` is resident, expired or not.
    pub async fn contains(&self, key: &str) -> bool {
        self.inner.read().await.slots.contains_key(key)
    }

    /// Removes an entry.
    pub async fn remove(&self, key: &str) -> Option<MemoryEntry> {
        let mut guard = self.inner.write().await;
        let removed = guard.remove_slot(key).map(|slot| slot.entry);
        guard.compact_heap();
        removed
    }

    /// Removes every entry whose hot deadline has passed.
    ///
    /// Deadlines never exceed the entry's own expiry, so popping the heap
    /// finds every expired slot. Promoted entries can leave the tier before
    /// their TTL ends, so callers check [`MemoryEntry::is_expired_at`] before
    /// treating a removal as an expiry.
    pub async fn reap_expired(&self, now: SystemTime) -> Vec<MemoryEntry> {
        let mut guard = self.inner.write().await;
        let mut reaped = Vec::new();
        while guard
            .expiry
            .peek()
            .is_some_and(|Reverse(top)| top.expires_at <= now)
        {
            let Some(Reverse(top)) = guard.expiry.pop() else {
                break;
            };
            if !guard.is_current(&top) {
                continue;
            }
            if let Some(slot) = guard.remove_slot(&top.key) {
                reaped.push(slot.snapshot());
            }
        }
        guard.compact_heap();
        reaped
    }

    /// Returns every live entry.
    pub async fn snapshot(&self, now: SystemTime) -> Vec<MemoryEntry> {
        let guard = self.inner.read().await;
        guard
            .slots
            .values()
            .filter(|slot| slot.is_live(now))
            .map(HotSlot::snapshot)
            .collect()
    }

    /// Returns the resident keys, sorted.
    pub async fn keys(&self) -> Vec<String> {
        let guard = self.inner.read().await;
        let mut keys: Vec<String> = guard.slots.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Returns statistics about tier utilisation.
    pub async fn stats(&self) -> HotTierStats {
        let guard = self.inner.read().await;
        HotTierStats {
            entries: guard.slots.len(),
            capacity: self.config.max_entries().get(),
            total_bytes: guard.total_bytes,
            expiry_index_len: guard.expiry.len(),
        }
    }
}

/// Snapshot describing utilisation of the hot tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HotTierStats {
    /// Entries currently resident.
    pub entries: usize,
    /// Maximum number of entries permitted.
    pub capacity: usize,
    /// Accumulated content bytes currently retained.
    pub total_bytes: usize,
    /// Items in the expiry heap, including stale ones awaiting compaction.
    pub expiry_index_len: usize,
}
