//! Memory entry model shared by every storage tier.

use std::borrow::Cow;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use ctx_primitives::ConsumerId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::{MemoryError, MemoryResult};

const MAX_KEY_LEN: usize = 512;

/// Upper bound accepted for entry lifetimes (roughly one century).
pub const MAX_TTL: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Category assigned to entries that do not specify one.
pub const DEFAULT_CATEGORY: &str = "general";

/// Ownership model of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    /// Visible to every consumer that may read the entry's scope.
    Shared,
    /// Owned by exactly one consumer (the entry's source consumer).
    ToolSpecific,
}

/// Retention and visibility scope of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// Lives for a single working session.
    Session,
    /// Shared across sessions within one project.
    Project,
    /// Long-lived knowledge available everywhere.
    Global,
}

impl Scope {
    /// Every scope, in ascending order of retention.
    pub const ALL: [Scope; 3] = [Scope::Session, Scope::Project, Scope::Global];

    /// Returns the lowercase label of the scope.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Session => "session",
            Self::Project => "project",
            Self::Global => "global",
        }
    }
}

/// Lossy compression currently applied to an entry's content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionLevel {
    /// Original content.
    None,
    /// Truncated to a configurable fraction of the original.
    Light,
    /// Reduced to a short fixed-size excerpt.
    Heavy,
}

impl CompressionLevel {
    /// Levels in the order they are attempted when fitting content to a budget.
    pub const ESCALATION: [CompressionLevel; 3] = [
        CompressionLevel::None,
        CompressionLevel::Light,
        CompressionLevel::Heavy,
    ];

    /// Returns the lowercase label of the level.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Light => "light",
            Self::Heavy => "heavy",
        }
    }
}

/// Storage tier an entry was last served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageTier {
    /// In-process map owned by the cache manager.
    Hot,
    /// TTL-bounded backend.
    Warm,
    /// Long-term durable backend.
    Cold,
}

impl StorageTier {
    /// Returns the lowercase label used in log fields.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Hot => "hot",
            Self::Warm => "warm",
            Self::Cold => "cold",
        }
    }
}

/// Opaque entry payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Content {
    /// Free-form text. Text entries are eligible for vector indexing.
    Text(String),
    /// Structured JSON data.
    Structured(Value),
}

impl Content {
    /// Creates text content.
    #[must_use]
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    /// Returns `true` for text payloads.
    #[must_use]
    pub fn is_textual(&self) -> bool {
        matches!(self, Self::Text(_))
    }

    /// Canonical textual rendering. Structured data renders as compact JSON.
    #[must_use]
    pub fn as_text(&self) -> Cow<'_, str> {
        match self {
            Self::Text(text) => Cow::Borrowed(text),
            Self::Structured(value) => Cow::Owned(value.to_string()),
        }
    }

    /// Size of the canonical textual rendering in bytes.
    #[must_use]
    pub fn byte_len(&self) -> usize {
        match self {
            Self::Text(text) => text.len(),
            Self::Structured(value) => value.to_string().len(),
        }
    }

    /// SHA-256 hex digest of the canonical textual rendering.
    #[must_use]
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.as_text().as_bytes());
        hex::encode(hasher.finalize())
    }
}

impl From<String> for Content {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for Content {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl From<Value> for Content {
    fn from(value: Value) -> Self {
        Self::Structured(value)
    }
}

/// Bookkeeping carried alongside every entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryMetadata {
    /// Consumer that produced the entry. Owner of tool-specific entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_consumer: Option<ConsumerId>,
    /// First write of this key. Expiry is measured from here.
    pub created_at: SystemTime,
    /// Most recent write of this key.
    pub last_modified: SystemTime,
    /// Most recent read.
    pub last_accessed: SystemTime,
    /// Number of reads served.
    pub access_count: u64,
    /// Caller-assigned usefulness in `[0.0, 1.0]`.
    pub relevance_score: f32,
    /// SHA-256 hex digest of the uncompressed content.
    pub content_hash: String,
    /// Routing label for vector collections and retention overrides.
    pub category: String,
}

/// Canonical unit of stored context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    key: String,
    entry_type: EntryType,
    scope: Scope,
    priority: i32,
    compression_level: CompressionLevel,
    ttl: Duration,
    content: Content,
    metadata: EntryMetadata,
    storage_tier: StorageTier,
}

impl MemoryEntry {
    /// Creates a builder for a new entry.
    #[must_use]
    pub fn builder(key: impl Into<String>, content: impl Into<Content>) -> MemoryEntryBuilder {
        MemoryEntryBuilder {
            key: key.into(),
            content: content.into(),
            entry_type: EntryType::Shared,
            scope: Scope::Session,
            priority: 0,
            ttl: Duration::from_secs(3600),
            source_consumer: None,
            relevance_score: 0.5,
            category: DEFAULT_CATEGORY.to_owned(),
            timestamp: None,
        }
    }

    /// Returns the immutable key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Returns the ownership model.
    #[must_use]
    pub fn entry_type(&self) -> EntryType {
        self.entry_type
    }

    /// Returns the scope.
    #[must_use]
    pub fn scope(&self) -> Scope {
        self.scope
    }

    /// Returns the caller-assigned priority.
    #[must_use]
    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// Returns the compression applied to [`content`](Self::content).
    #[must_use]
    pub fn compression_level(&self) -> CompressionLevel {
        self.compression_level
    }

    /// Returns the configured lifetime.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Returns the lifetime in whole seconds.
    #[must_use]
    pub fn ttl_seconds(&self) -> u64 {
        self.ttl.as_secs()
    }

    /// Returns the payload.
    #[must_use]
    pub fn content(&self) -> &Content {
        &self.content
    }

    /// Returns the metadata.
    #[must_use]
    pub fn metadata(&self) -> &EntryMetadata {
        &self.metadata
    }

    /// Returns the tier this copy was served from.
    #[must_use]
    pub fn storage_tier(&self) -> StorageTier {
        self.storage_tier
    }

    /// Owner of the entry, if any.
    #[must_use]
    pub fn source_consumer(&self) -> Option<&ConsumerId> {
        self.metadata.source_consumer.as_ref()
    }

    /// Point in time after which the entry is invisible.
    #[must_use]
    pub fn expires_at(&self) -> SystemTime {
        saturating_add(self.metadata.created_at, self.ttl)
    }

    /// Returns `true` once `now` has reached the expiry time.
    #[must_use]
    pub fn is_expired_at(&self, now: SystemTime) -> bool {
        now >= self.expires_at()
    }

    /// Lifetime left at `now`, zero once expired.
    #[must_use]
    pub fn remaining_ttl(&self, now: SystemTime) -> Duration {
        self.expires_at().duration_since(now).unwrap_or_default()
    }

    /// Returns `true` when `consumer` may see this entry given the scopes it reads.
    #[must_use]
    pub fn is_visible_to(&self, consumer: &ConsumerId, readable_scopes: &[Scope]) -> bool {
        if !readable_scopes.contains(&self.scope) {
            return false;
        }
        match self.entry_type {
            EntryType::Shared => true,
            EntryType::ToolSpecific => self.source_consumer() == Some(consumer),
        }
    }

    /// Relevance after exponential decay since the last access.
    ///
    /// A zero half-life disables decay.
    #[must_use]
    pub fn relevance_at(&self, now: SystemTime, half_life: Duration) -> f32 {
        let score = self.metadata.relevance_score;
        if half_life.is_zero() {
            return score;
        }
        let idle = now
            .duration_since(self.metadata.last_accessed)
            .unwrap_or_default();
        #[allow(clippy::cast_possible_truncation)]
        let factor = 0.5_f64.powf(idle.as_secs_f64() / half_life.as_secs_f64()) as f32;
        score * factor
    }

    pub(crate) fn metadata_mut(&mut self) -> &mut EntryMetadata {
        &mut self.metadata
    }

    /// Records a read at `now`.
    pub fn touch(&mut self, now: SystemTime) {
        self.metadata.last_accessed = now;
        self.metadata.access_count = self.metadata.access_count.saturating_add(1);
    }

    /// Carries creation and access history over from the previous version of this key.
    ///
    /// Keys never change on update, so mismatched keys are left untouched.
    pub fn inherit_history(&mut self, previous: &MemoryEntry) {
        if previous.key != self.key {
            return;
        }
        self.metadata.created_at = previous.metadata.created_at;
        self.metadata.access_count = previous.metadata.access_count;
        self.metadata.last_accessed = previous
            .metadata
            .last_accessed
            .max(self.metadata.last_accessed);
    }

    /// Marks the tier this copy is served from.
    pub fn set_storage_tier(&mut self, tier: StorageTier) {
        self.storage_tier = tier;
    }

    /// Returns a projection copy carrying compressed content.
    ///
    /// The content hash keeps pointing at the original payload.
    #[must_use]
    pub fn with_compressed(&self, content: Content, level: CompressionLevel) -> Self {
        let mut projected = self.clone();
        projected.content = content;
        projected.compression_level = level;
        projected
    }
}

/// Builder type used to assemble [`MemoryEntry`] instances safely.
#[derive(Debug)]
pub struct MemoryEntryBuilder {
    key: String,
    content: Content,
    entry_type: EntryType,
    scope: Scope,
    priority: i32,
    ttl: Duration,
    source_consumer: Option<ConsumerId>,
    relevance_score: f32,
    category: String,
    timestamp: Option<SystemTime>,
}

impl MemoryEntryBuilder {
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

    /// Sets the lifetime.
    #[must_use]
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Sets the producing consumer.
    #[must_use]
    pub fn source_consumer(mut self, consumer: ConsumerId) -> Self {
        self.source_consumer = Some(consumer);
        self
    }

    /// Sets the relevance score; validated in [`build`](Self::build).
    #[must_use]
    pub fn relevance(mut self, score: f32) -> Self {
        self.relevance_score = score;
        self
    }

    /// Sets the routing category.
    #[must_use]
    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    /// Overrides the creation timestamp (defaults to now).
    #[must_use]
    pub fn timestamp(mut self, timestamp: SystemTime) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Finalises the builder and produces the entry.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::InvalidEntry`] when the key is empty or too long,
    /// the TTL is zero or beyond [`MAX_TTL`], the relevance score is outside
    /// `[0, 1]`, the category is blank, or a tool-specific entry has no owner.
    pub fn build(self) -> MemoryResult<MemoryEntry> {
        if self.key.trim().is_empty() {
            return Err(MemoryError::InvalidEntry("entry key must not be empty"));
        }
        if self.key.len() > MAX_KEY_LEN {
            return Err(MemoryError::InvalidEntry("entry key exceeds 512 bytes"));
        }
        if self.ttl.is_zero() {
            return Err(MemoryError::InvalidEntry("entry ttl must be greater than zero"));
        }
        if self.ttl > MAX_TTL {
            return Err(MemoryError::InvalidEntry("entry ttl exceeds the maximum lifetime"));
        }
        if !self.relevance_score.is_finite() || !(0.0..=1.0).contains(&self.relevance_score) {
            return Err(MemoryError::InvalidEntry(
                "relevance score must be within [0.0, 1.0]",
            ));
        }
        if self.category.trim().is_empty() {
            return Err(MemoryError::InvalidEntry("entry category must not be empty"));
        }
        if self.entry_type == EntryType::ToolSpecific && self.source_consumer.is_none() {
            return Err(MemoryError::InvalidEntry(
                "tool-specific entries require a source consumer",
            ));
        }

        let now = self.timestamp.unwrap_or_else(SystemTime::now);
        let content_hash = self.content.digest();
        Ok(MemoryEntry {
            key: self.key,
            entry_type: self.entry_type,
            scope: self.scope,
            priority: self.priority,
            compression_level: CompressionLevel::None,
            ttl: self.ttl,
            content: self.content,
            metadata: EntryMetadata {
                source_consumer: self.source_consumer,
                created_at: now,
                last_modified: now,
                last_accessed: now,
                access_count: 0,
                relevance_score: self.relevance_score,
                content_hash,
                category: self.category,
            },
            storage_tier: StorageTier::Hot,
        })
    }
}

pub(crate) fn saturating_add(base: SystemTime, offset: Duration) -> SystemTime {
    base.checked_add(offset)
        .or_else(|| base.checked_add(MAX_TTL))
        .unwrap_or(base)
}

pub(crate) fn to_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}

pub(crate) fn from_millis(millis: u64) -> SystemTime {
    saturating_add(UNIX_EPOCH, Duration::from_millis(millis))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn consumer(id: &str) -> ConsumerId {
        ConsumerId::new(id).unwrap()
    }

    #[test]
    fn builder_validates_fields() {
        let err = MemoryEntry::builder(" ", "x").build().unwrap_err();
        assert!(matches!(err, MemoryError::InvalidEntry(_)));

        let err = MemoryEntry::builder("k", "x")
            .ttl(Duration::ZERO)
            .build()
            .unwrap_err();
        assert!(matches!(err, MemoryError::InvalidEntry(_)));

        let err = MemoryEntry::builder("k", "x")
            .relevance(1.5)
            .build()
            .unwrap_err();
        assert!(matches!(err, MemoryError::InvalidEntry(_)));

        let err = MemoryEntry::builder("k", "x")
            .entry_type(EntryType::ToolSpecific)
            .build()
            .expect_err("tool-specific entry without owner");
        assert!(matches!(err, MemoryError::InvalidEntry(_)));
    }

    #[test]
    fn expiry_is_measured_from_creation() {
        let start = UNIX_EPOCH + Duration::from_secs(1_000);
        let entry = MemoryEntry::builder("k", "hello")
            .ttl(Duration::from_secs(10))
            .timestamp(start)
            .build()
            .unwrap();

        assert_eq!(entry.expires_at(), start + Duration::from_secs(10));
        assert!(!entry.is_expired_at(start + Duration::from_secs(9)));
        assert!(entry.is_expired_at(start + Duration::from_secs(11)));
        assert_eq!(
            entry.remaining_ttl(start + Duration::from_secs(4)),
            Duration::from_secs(6)
        );
        assert_eq!(entry.remaining_ttl(start + Duration::from_secs(40)), Duration::ZERO);
    }

    #[test]
    fn tool_specific_entries_are_private() {
        let owner = consumer("cursor");
        let other = consumer("claude");
        let entry = MemoryEntry::builder("k", "secret")
            .entry_type(EntryType::ToolSpecific)
            .source_consumer(owner.clone())
            .scope(Scope::Project)
            .build()
            .unwrap();

        assert!(entry.is_visible_to(&owner, &Scope::ALL));
        assert!(!entry.is_visible_to(&other, &Scope::ALL));
        assert!(!entry.is_visible_to(&owner, &[Scope::Session]));
    }

    #[test]
    fn relevance_decays_with_idle_time() {
        let start = UNIX_EPOCH + Duration::from_secs(1_000);
        let entry = MemoryEntry::builder("k", "x")
            .relevance(0.8)
            .timestamp(start)
            .build()
            .unwrap();

        let half_life = Duration::from_secs(60);
        let decayed = entry.relevance_at(start + half_life, half_life);
        assert!((decayed - 0.4).abs() < 1e-4);
        assert!((entry.relevance_at(start + half_life, Duration::ZERO) - 0.8).abs() < f32::EPSILON);
    }

    #[test]
    fn structured_content_hashes_canonical_json() {
        let entry = MemoryEntry::builder("k", json!({"a": 1}))
            .build()
            .unwrap();
        assert!(!entry.content().is_textual());
        assert_eq!(entry.content().as_text(), "{\"a\":1}");
        assert_eq!(entry.metadata().content_hash.len(), 64);
        assert_eq!(entry.metadata().content_hash, Content::text("{\"a\":1}").digest());
    }

    #[test]
    fn inherit_history_keeps_creation_time() {
        let start = UNIX_EPOCH + Duration::from_secs(1_000);
        let mut first = MemoryEntry::builder("k", "v1").timestamp(start).build().unwrap();
        first.touch(start + Duration::from_secs(1));
        let mut second = MemoryEntry::builder("k", "v2")
            .timestamp(start + Duration::from_secs(5))
            .build()
            .unwrap();
        second.inherit_history(&first);

        assert_eq!(second.metadata().created_at, start);
        assert_eq!(second.metadata().last_modified, start + Duration::from_secs(5));
        assert_eq!(second.metadata().access_count, 1);
        assert_eq!(second.content(), &Content::text("v2"));
    }

    #[test]
    fn update_does_not_extend_lifetime() {
        let start = UNIX_EPOCH + Duration::from_secs(1_000);
        let first = MemoryEntry::builder("k", "v1")
            .ttl(Duration::from_secs(10))
            .timestamp(start)
            .build()
            .unwrap();
        let mut second = MemoryEntry::builder("k", "v2")
            .ttl(Duration::from_secs(10))
            .timestamp(start + Duration::from_secs(8))
            .build()
            .unwrap();
        second.inherit_history(&first);

        assert_eq!(second.expires_at(), start + Duration::from_secs(10));
        assert!(second.is_expired_at(start + Duration::from_secs(12)));
    }

    #[test]
    fn millis_helpers_round_trip() {
        let time = UNIX_EPOCH + Duration::from_millis(1_234_567);
        assert_eq!(from_millis(to_millis(time)), time);
    }
}
