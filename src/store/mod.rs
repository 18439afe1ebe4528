//! Document store: an LRU memory cache in front of durable JSON records.
//!
//! [`LayeredStore`] is constructed explicitly with [`LayeredStore::open`]
//! and handed to the orchestrator; there is no process-wide instance.
//!
//! * Writes go to disk first, then to memory.
//! * Reads check memory, then disk, promoting on a disk hit.
//! * Eviction only ever drops the memory copy.
//!
//! Mutations of one `document_id` (save, delete, promotion) are serialized
//! through a per-key async lock; different ids proceed concurrently.

pub mod file;
pub mod memory;

pub use file::FileStore;
pub use memory::{CacheStats, MemoryCache};

use crate::config::StoreConfig;
use crate::document::Document;
use crate::error::PerceptionError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Persistence capability used by the orchestrator.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Persist and return the document id.
    async fn save(&self, document: Arc<Document>) -> Result<String, PerceptionError>;

    /// Fails with [`PerceptionError::NotFound`] for unknown ids.
    async fn get(&self, id: &str) -> Result<Arc<Document>, PerceptionError>;

    /// `true` if something was deleted.
    async fn delete(&self, id: &str) -> Result<bool, PerceptionError>;

    /// Ids in creation order, paginated.
    async fn list(&self, limit: usize, offset: usize) -> Result<Vec<String>, PerceptionError>;

    async fn count(&self) -> Result<usize, PerceptionError>;
}

/// Per-key async mutexes, created on demand and dropped when unused.
#[derive(Default)]
struct KeyLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyLocks {
    fn handle(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.retain(|_, l| Arc::strong_count(l) > 1);
        Arc::clone(locks.entry(id.to_string()).or_default())
    }
}

/// Memory cache + file store.
pub struct LayeredStore {
    memory: MemoryCache,
    file: FileStore,
    locks: KeyLocks,
    closed: AtomicBool,
}

impl LayeredStore {
    /// Create the record directory if needed and start with a cold cache.
    ///
    /// ```rust
    /// use docsense::{DocumentStore, StoreConfig};
    /// use docsense::store::LayeredStore;
    ///
    /// # tokio_test::block_on(async {
    /// let dir = tempfile::tempdir().unwrap();
    /// let store = LayeredStore::open(StoreConfig::new(dir.path()).max_cached_documents(16))
    ///     .await
    ///     .unwrap();
    /// assert_eq!(store.count().await.unwrap(), 0);
    /// assert!(store.list(10, 0).await.unwrap().is_empty());
    /// # });
    /// ```
    pub async fn open(config: StoreConfig) -> Result<Self, PerceptionError> {
        let file = FileStore::open(&config.root).await?;
        info!(
            "Opened document store at {} (cache: {} docs, {} bytes)",
            file.dir().display(),
            config.max_cached_documents,
            config.max_cached_bytes
        );
        Ok(Self {
            memory: MemoryCache::new(config.max_cached_documents, config.max_cached_bytes),
            file,
            locks: KeyLocks::default(),
            closed: AtomicBool::new(false),
        })
    }

    /// Drop the memory layer and refuse further operations. Durable records
    /// are already complete: every write is synchronous.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.memory.clear();
        info!("Closed document store at {}", self.file.dir().display());
    }

    fn ensure_open(&self) -> Result<(), PerceptionError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PerceptionError::Internal("document store is closed".into()));
        }
        Ok(())
    }

    pub fn root(&self) -> &Path {
        self.file.dir()
    }

    pub async fn contains(&self, id: &str) -> Result<bool, PerceptionError> {
        self.ensure_open()?;
        if self.memory.contains(id) {
            return Ok(true);
        }
        match self.file.exists(id).await {
            Err(PerceptionError::NotFound { .. }) => Ok(false),
            other => other,
        }
    }

    /// Whether `id` is currently resident in memory.
    pub fn is_cached(&self, id: &str) -> bool {
        self.memory.contains(id)
    }

    pub fn clear_cache(&self) {
        self.memory.clear();
    }

    pub fn stats(&self) -> CacheStats {
        self.memory.stats()
    }
}

#[async_trait]
impl DocumentStore for LayeredStore {
    async fn save(&self, document: Arc<Document>) -> Result<String, PerceptionError> {
        self.ensure_open()?;
        let id = document.document_id.clone();
        let lock = self.locks.handle(&id);
        let _guard = lock.lock().await;

        let bytes = self.file.write(&document).await?;
        self.memory.insert(document, bytes);
        Ok(id)
    }

    async fn get(&self, id: &str) -> Result<Arc<Document>, PerceptionError> {
        self.ensure_open()?;
        if let Some(doc) = self.memory.get(id) {
            return Ok(doc);
        }

        let lock = self.locks.handle(id);
        let _guard = lock.lock().await;
        // Another task may have promoted it while we waited.
        if self.memory.contains(id) {
            if let Some(doc) = self.memory.get(id) {
                return Ok(doc);
            }
        }
        match self.file.read(id).await? {
            Some((document, bytes)) => {
                debug!("Promoting document {} from disk", id);
                let document = Arc::new(document);
                self.memory.insert(Arc::clone(&document), bytes);
                Ok(document)
            }
            None => Err(PerceptionError::NotFound { id: id.to_string() }),
        }
    }

    async fn delete(&self, id: &str) -> Result<bool, PerceptionError> {
        self.ensure_open()?;
        let lock = self.locks.handle(id);
        let _guard = lock.lock().await;

        let in_memory = self.memory.remove(id);
        let on_disk = match self.file.remove(id).await {
            Err(PerceptionError::NotFound { .. }) => false,
            other => other?,
        };
        Ok(in_memory || on_disk)
    }

    async fn list(&self, limit: usize, offset: usize) -> Result<Vec<String>, PerceptionError> {
        self.ensure_open()?;
        Ok(self
            .file
            .ids()
            .await?
            .into_iter()
            .skip(offset)
            .take(limit)
            .collect())
    }

    async fn count(&self) -> Result<usize, PerceptionError> {
        self.ensure_open()?;
        Ok(self.file.ids().await?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::tests::doc;

    async fn store(dir: &Path, max_docs: usize) -> LayeredStore {
        LayeredStore::open(StoreConfig::new(dir).max_cached_documents(max_docs))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn get_unknown_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let s = store(tmp.path(), 4).await;
        assert!(matches!(
            s.get("missing").await,
            Err(PerceptionError::NotFound { .. })
        ));
        assert!(!s.delete("missing").await.unwrap());
        assert!(!s.contains("missing").await.unwrap());
    }

    #[tokio::test]
    async fn delete_removes_both_layers() {
        let tmp = tempfile::tempdir().unwrap();
        let s = store(tmp.path(), 4).await;
        s.save(doc("a")).await.unwrap();
        assert!(s.is_cached("a"));
        assert!(s.delete("a").await.unwrap());
        assert!(!s.is_cached("a"));
        assert!(!s.contains("a").await.unwrap());
        assert_eq!(s.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn closed_store_rejects_operations() {
        let tmp = tempfile::tempdir().unwrap();
        let s = store(tmp.path(), 4).await;
        s.save(doc("a")).await.unwrap();
        s.close();
        assert!(s.get("a").await.is_err());
        // The durable copy survives reopening.
        let reopened = store(tmp.path(), 4).await;
        assert_eq!(reopened.get("a").await.unwrap().document_id, "a");
    }
}
