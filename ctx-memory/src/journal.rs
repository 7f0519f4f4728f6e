//! Durable append-only journal used as the default cold tier.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::MemoryResult;
use crate::backend::{BackendStats, ScanFilter, StorageBackend, StoredValue, index_stats, scan_index};

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum JournalOp {
    Put {
        key: String,
        #[serde(flatten)]
        stored: StoredValue,
    },
    Delete {
        key: String,
    },
}

struct JournalState {
    file: File,
    index: HashMap<String, StoredValue>,
    appended: usize,
}

/// File-backed store writing newline-delimited JSON operations.
///
/// The log is replayed into an in-memory index on open; reads never touch the
/// file. [`compact`](Self::compact) rewrites the log down to live records.
pub struct FileBackend {
    path: PathBuf,
    state: Mutex<JournalState>,
}

impl FileBackend {
    /// Opens (or creates) a journal at the provided path and replays it.
    ///
    /// Lines that fail to decode are skipped with a data-integrity warning.
    ///
    /// # Errors
    ///
    /// Propagates I/O errors encountered while preparing or reading the file.
    pub async fn open(path: impl Into<PathBuf>) -> MemoryResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let index = match fs::read(&path).await {
            Ok(data) => replay(&path, &data),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(err) => return Err(err.into()),
        };

        let file = open_append(&path).await?;
        debug!(path = %path.display(), records = index.len(), "cold journal opened");

        Ok(Self {
            path,
            state: Mutex::new(JournalState {
                file,
                index,
                appended: 0,
            }),
        })
    }

    /// Returns the underlying path of the journal file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of operations appended since open or the last compaction.
    pub async fn appended_ops(&self) -> usize {
        self.state.lock().await.appended
    }

    /// Rewrites the journal so it only contains live records.
    ///
    /// # Errors
    ///
    /// Propagates I/O and serialization errors. The previous journal stays in
    /// place when writing the replacement fails.
    pub async fn compact(&self) -> MemoryResult<()> {
        let mut guard = self.state.lock().await;
        let now = SystemTime::now();
        guard.index.retain(|_, stored| stored.is_live(now));

        let mut keys: Vec<&String> = guard.index.keys().collect();
        keys.sort();
        let mut buffer = Vec::new();
        for key in keys {
            let op = JournalOp::Put {
                key: key.clone(),
                stored: guard.index[key].clone(),
            };
            serde_json::to_writer(&mut buffer, &op)?;
            buffer.push(b'\n');
        }

        let staging = self.path.with_extension("compact");
        fs::write(&staging, &buffer).await?;
        fs::rename(&staging, &self.path).await?;
        guard.file = open_append(&self.path).await?;
        guard.appended = 0;
        debug!(path = %self.path.display(), records = guard.index.len(), "cold journal compacted");
        Ok(())
    }

    async fn append(state: &mut JournalState, op: &JournalOp) -> MemoryResult<()> {
        let line = serde_json::to_vec(op)?;
        state.file.write_all(&line).await?;
        state.file.write_u8(b'\n').await?;
        state.file.flush().await?;
        state.appended += 1;
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for FileBackend {
    async fn get(&self, key: &str) -> MemoryResult<Option<Bytes>> {
        let now = SystemTime::now();
        let guard = self.state.lock().await;
        Ok(guard
            .index
            .get(key)
            .filter(|stored| stored.is_live(now))
            .map(|stored| stored.value.clone()))
    }

    async fn put(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> MemoryResult<()> {
        let stored = StoredValue::new(value, ttl, SystemTime::now());
        let op = JournalOp::Put {
            key: key.to_owned(),
            stored,
        };
        let mut guard = self.state.lock().await;
        Self::append(&mut guard, &op).await?;
        if let JournalOp::Put { key, stored } = op {
            guard.index.insert(key, stored);
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> MemoryResult<()> {
        let mut guard = self.state.lock().await;
        if !guard.index.contains_key(key) {
            return Ok(());
        }
        Self::append(
            &mut guard,
            &JournalOp::Delete {
                key: key.to_owned(),
            },
        )
        .await?;
        guard.index.remove(key);
        Ok(())
    }

    async fn scan(&self, filter: &ScanFilter) -> MemoryResult<Vec<(String, Bytes)>> {
        let guard = self.state.lock().await;
        Ok(scan_index(&guard.index, filter, SystemTime::now()))
    }

    async fn stats(&self) -> MemoryResult<BackendStats> {
        let guard = self.state.lock().await;
        Ok(index_stats(&guard.index, SystemTime::now()))
    }

    async fn compact_if_needed(&self, min_ops: usize) -> MemoryResult<bool> {
        if self.appended_ops().await < min_ops {
            return Ok(false);
        }
        self.compact().await?;
        Ok(true)
    }
}

async fn open_append(path: &Path) -> MemoryResult<File> {
    Ok(OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?)
}

fn replay(path: &Path, data: &[u8]) -> HashMap<String, StoredValue> {
    let mut index = HashMap::new();
    for (line_no, chunk) in data
        .split(|byte| *byte == b'\n')
        .enumerate()
        .filter(|(_, chunk)| !chunk.is_empty())
    {
        match serde_json::from_slice::<JournalOp>(chunk) {
            Ok(JournalOp::Put { key, stored }) => {
                index.insert(key, stored);
            }
            Ok(JournalOp::Delete { key }) => {
                index.remove(&key);
            }
            Err(err) => {
                warn!(
                    target: "ctx_memory::integrity",
                    path = %path.display(),
                    line = line_no + 1,
                    ?err,
                    "skipping undecodable journal line"
                );
            }
        }
    }
    index
}
