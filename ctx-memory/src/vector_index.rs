//! External vector-index contract and a local in-memory implementation.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::RwLock;

use crate::MemoryResult;
use crate::entry::{Content, MemoryEntry, to_millis};

/// Document submitted to the vector index.
///
/// Embeddings are computed by the index service; the engine only ships text
/// and filterable properties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorDocument {
    id: String,
    #[serde(default)]
    properties: Map<String, Value>,
}

impl VectorDocument {
    /// Creates a document with no properties.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            properties: Map::new(),
        }
    }

    /// Adds a property to the document.
    #[must_use]
    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    /// Builds the document for a textual entry. Structured entries are not indexed.
    #[must_use]
    pub fn from_entry(entry: &MemoryEntry) -> Option<Self> {
        let Content::Text(text) = entry.content() else {
            return None;
        };
        let metadata = entry.metadata();
        let mut document = Self::new(entry.key())
            .with_property("content", text.clone())
            .with_property("scope", entry.scope().as_str())
            .with_property("priority", entry.priority())
            .with_property("category", metadata.category.clone())
            .with_property("content_hash", metadata.content_hash.clone())
            .with_property("last_modified_ms", to_millis(metadata.last_modified));
        if let Some(source) = entry.source_consumer() {
            document = document.with_property("source_consumer", source.as_str());
        }
        Some(document)
    }

    /// Returns the identifier (the entry key).
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the filterable properties.
    #[must_use]
    pub fn properties(&self) -> &Map<String, Value> {
        &self.properties
    }

    /// Returns the `category` property, if present.
    #[must_use]
    pub fn category(&self) -> Option<&str> {
        self.properties.get("category").and_then(Value::as_str)
    }
}

/// Result of a batch submission that did not fail outright.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchOutcome {
    /// Every document was accepted.
    Complete,
    /// The listed documents were rejected.
    Partial {
        /// Identifiers the index refused.
        failed_ids: Vec<String>,
    },
}

impl BatchOutcome {
    /// Returns `true` when every document was accepted.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete)
    }
}

/// Interface for vector index clients.
#[async_trait]
pub trait VectorIndexClient: Send + Sync {
    /// Inserts or replaces `documents` in `collection`.
    ///
    /// An `Err` signals total failure of the batch.
    async fn batch_upsert(
        &self,
        collection: &str,
        documents: &[VectorDocument],
    ) -> MemoryResult<BatchOutcome>;
}

/// In-memory index keyed by collection then document id.
#[derive(Debug, Default)]
pub struct LocalVectorIndex {
    collections: RwLock<HashMap<String, HashMap<String, VectorDocument>>>,
}

impl LocalVectorIndex {
    /// Creates an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Documents stored in `collection`, ordered by id.
    pub async fn documents(&self, collection: &str) -> Vec<VectorDocument> {
        let guard = self.collections.read().await;
        let mut documents: Vec<VectorDocument> = guard
            .get(collection)
            .map(|docs| docs.values().cloned().collect())
            .unwrap_or_default();
        documents.sort_by(|a, b| a.id.cmp(&b.id));
        documents
    }

    /// Total documents across all collections.
    pub async fn count(&self) -> usize {
        self.collections.read().await.values().map(HashMap::len).sum()
    }
}

#[async_trait]
impl VectorIndexClient for LocalVectorIndex {
    async fn batch_upsert(
        &self,
        collection: &str,
        documents: &[VectorDocument],
    ) -> MemoryResult<BatchOutcome> {
        let mut guard = self.collections.write().await;
        let target = guard.entry(collection.to_owned()).or_default();
        for document in documents {
            target.insert(document.id.clone(), document.clone());
        }
        Ok(BatchOutcome::Complete)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn only_text_entries_become_documents() {
        let text = MemoryEntry::builder("notes/1", "tokio runtime")
            .category("notes")
            .build()
            .unwrap();
        let document = VectorDocument::from_entry(&text).unwrap();
        assert_eq!(document.id(), "notes/1");
        assert_eq!(document.category(), Some("notes"));
        assert_eq!(document.properties()["content"], json!("tokio runtime"));

        let structured = MemoryEntry::builder("cfg", json!({"depth": 3}))
            .build()
            .unwrap();
        assert!(VectorDocument::from_entry(&structured).is_none());
    }

    #[tokio::test]
    async fn upsert_replaces_by_id() {
        let index = LocalVectorIndex::new();
        index
            .batch_upsert("memories", &[VectorDocument::new("a").with_property("v", 1)])
            .await
            .unwrap();
        let outcome = index
            .batch_upsert(
                "memories",
                &[
                    VectorDocument::new("a").with_property("v", 2),
                    VectorDocument::new("b"),
                ],
            )
            .await
            .unwrap();

        assert!(outcome.is_complete());
        assert_eq!(index.count().await, 2);
        let documents = index.documents("memories").await;
        assert_eq!(documents[0].properties()["v"], json!(2));
        assert!(index.documents("other").await.is_empty());
    }
}
