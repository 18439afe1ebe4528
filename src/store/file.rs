//! Durable layer: one JSON record per document.
//!
//! Layout: `<root>/documents/<document_id>.json`. Writes go to a temporary
//! file in the same directory which is fsynced and then renamed over the
//! target, so a crash mid-write leaves either the old record or the new
//! one, never a torn file. Concurrent writers to the same id: last rename
//! wins.

use crate::document::Document;
use crate::error::PerceptionError;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

const RECORD_EXTENSION: &str = "json";

/// Filesystem-backed document records.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Open (creating if needed) the store under `root`.
    pub async fn open(root: &Path) -> Result<Self, PerceptionError> {
        let dir = root.join("documents");
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| PerceptionError::storage(&dir, e))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Record path for `id`; ids that could escape the directory do not exist.
    fn path_for(&self, id: &str) -> Result<PathBuf, PerceptionError> {
        let valid = !id.is_empty()
            && id.len() <= 128
            && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(PerceptionError::NotFound { id: id.to_string() });
        }
        Ok(self.dir.join(format!("{id}.{RECORD_EXTENSION}")))
    }

    /// Serialize and atomically replace the record. Returns its size.
    pub async fn write(&self, document: &Document) -> Result<usize, PerceptionError> {
        let path = self.path_for(&document.document_id)?;
        let bytes = serde_json::to_vec(document)?;
        let len = bytes.len();
        let dir = self.dir.clone();
        tokio::task::spawn_blocking(move || write_atomic(&dir, &path, &bytes))
            .await
            .map_err(|e| PerceptionError::Internal(format!("store write task failed: {e}")))??;
        debug!("Persisted document {} ({} bytes)", document.document_id, len);
        Ok(len)
    }

    /// Load a record; `Ok(None)` if it does not exist.
    pub async fn read(&self, id: &str) -> Result<Option<(Document, usize)>, PerceptionError> {
        let path = self.path_for(id)?;
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(PerceptionError::storage(&path, e)),
        };
        let document: Document = serde_json::from_slice(&bytes)?;
        Ok(Some((document, bytes.len())))
    }

    pub async fn remove(&self, id: &str) -> Result<bool, PerceptionError> {
        let path = self.path_for(id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(PerceptionError::storage(&path, e)),
        }
    }

    pub async fn exists(&self, id: &str) -> Result<bool, PerceptionError> {
        let path = self.path_for(id)?;
        tokio::fs::try_exists(&path)
            .await
            .map_err(|e| PerceptionError::storage(&path, e))
    }

    /// Every stored id, sorted. Ids are UUIDv7, so this is creation order.
    pub async fn ids(&self) -> Result<Vec<String>, PerceptionError> {
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| PerceptionError::storage(&self.dir, e))?;
        let mut ids = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| PerceptionError::storage(&self.dir, e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if !stem.starts_with('.') {
                    ids.push(stem.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }
}

fn write_atomic(dir: &Path, path: &Path, bytes: &[u8]) -> Result<(), PerceptionError> {
    let mut tmp = tempfile::Builder::new()
        .prefix(".tmp-")
        .suffix(".partial")
        .tempfile_in(dir)
        .map_err(|e| PerceptionError::storage(dir, e))?;
    tmp.write_all(bytes)
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(|e| PerceptionError::storage(tmp.path(), e))?;
    tmp.persist(path)
        .map_err(|e| PerceptionError::storage(path, e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::tests::doc;

    #[tokio::test]
    async fn write_read_remove() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileStore::open(tmp.path()).await.unwrap();
        let d = doc("0190a1b2-0000-7000-8000-000000000001");

        let len = store.write(&d).await.unwrap();
        let (back, read_len) = store.read(&d.document_id).await.unwrap().unwrap();
        assert_eq!(back, *d);
        assert_eq!(len, read_len);
        assert!(store.exists(&d.document_id).await.unwrap());

        assert!(store.remove(&d.document_id).await.unwrap());
        assert!(!store.remove(&d.document_id).await.unwrap());
        assert!(store.read(&d.document_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn no_temp_files_are_left_behind() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileStore::open(tmp.path()).await.unwrap();
        store.write(&doc("b")).await.unwrap();
        store.write(&doc("a")).await.unwrap();
        store.write(&doc("a")).await.unwrap();

        let names: Vec<String> = std::fs::read_dir(store.dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 2, "{names:?}");
        assert_eq!(store.ids().await.unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn path_traversal_ids_do_not_exist() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileStore::open(tmp.path()).await.unwrap();
        let err = store.read("../etc/passwd").await.unwrap_err();
        assert!(matches!(err, PerceptionError::NotFound { .. }));
    }
}
