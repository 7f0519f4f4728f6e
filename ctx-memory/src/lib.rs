//! Memory model and storage tiers for the context synchronization engine.
//!
//! This crate owns the canonical [`MemoryEntry`], the [`StorageBackend`] contract
//! used by the warm and cold tiers (with in-memory and file reference
//! implementations), the expiry-ordered [`HotTier`], and the
//! [`VectorBatchQueue`] that feeds an external vector index.

#![warn(missing_docs, clippy::pedantic)]

mod backend;
mod entry;
mod error;
mod hot;
mod journal;
mod retention;
mod vector;
mod vector_index;

pub use backend::{BackendStats, InMemoryBackend, ScanFilter, StorageBackend};
pub use entry::{
    CompressionLevel, Content, DEFAULT_CATEGORY, EntryMetadata, EntryType, MAX_TTL, MemoryEntry,
    MemoryEntryBuilder, Scope, StorageTier,
};
pub use error::{MemoryError, MemoryResult};
pub use hot::{HotTier, HotTierConfig, HotTierStats};
pub use journal::FileBackend;
pub use retention::RetentionPolicy;
pub use vector::{DEFAULT_COLLECTION, FlushReport, QueueConfig, QueueStats, VectorBatchQueue};
pub use vector_index::{BatchOutcome, LocalVectorIndex, VectorDocument, VectorIndexClient};
