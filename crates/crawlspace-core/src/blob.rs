//! Blob store abstraction for opaque key → bytes storage.
//!
//! The platform stores dataset items and key-value records as blobs behind
//! this contract. S3/MinIO is one production implementation; the bundled
//! backends are an in-memory store for tests and a filesystem store for
//! single-node deployments.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use crate::error::{Error, Result};

/// Metadata about a stored blob.
#[derive(Debug, Clone)]
pub struct BlobMeta {
    /// Blob key.
    pub key: String,
    /// Blob size in bytes.
    pub size: u64,
    /// Last modification timestamp, when the backend tracks one.
    pub last_modified: Option<DateTime<Utc>>,
}

/// Blob store contract.
///
/// Keys are opaque `/`-separated strings. Writes overwrite; there is no
/// versioning. Backends must be safe for concurrent use.
#[async_trait]
pub trait BlobStore: Send + Sync + 'static {
    /// Reads an entire blob.
    ///
    /// Returns `Error::NotFound` if the key does not exist.
    async fn get(&self, key: &str) -> Result<Bytes>;

    /// Writes a blob, replacing any existing value.
    async fn put(&self, key: &str, data: Bytes) -> Result<()>;

    /// Deletes a blob. Succeeds even if the key does not exist.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Lists keys with the given prefix in lexicographic order.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Gets blob metadata without reading content.
    ///
    /// Returns `None` if the key does not exist.
    async fn head(&self, key: &str) -> Result<Option<BlobMeta>>;
}

/// In-memory blob store for testing.
///
/// Thread-safe via `RwLock`. Not suitable for production.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: Arc<RwLock<BTreeMap<String, StoredBlob>>>,
}

#[derive(Debug, Clone)]
struct StoredBlob {
    data: Bytes,
    last_modified: DateTime<Utc>,
}

impl MemoryBlobStore {
    /// Creates a new empty memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn get(&self, key: &str) -> Result<Bytes> {
        let blobs = self.blobs.read().map_err(|_| Error::Internal {
            message: "lock poisoned".into(),
        })?;
        blobs
            .get(key)
            .map(|b| b.data.clone())
            .ok_or_else(|| Error::NotFound(format!("blob not found: {key}")))
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        let mut blobs = self.blobs.write().map_err(|_| Error::Internal {
            message: "lock poisoned".into(),
        })?;
        blobs.insert(
            key.to_string(),
            StoredBlob {
                data,
                last_modified: Utc::now(),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut blobs = self.blobs.write().map_err(|_| Error::Internal {
            message: "lock poisoned".into(),
        })?;
        blobs.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let blobs = self.blobs.read().map_err(|_| Error::Internal {
            message: "lock poisoned".into(),
        })?;
        Ok(blobs
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn head(&self, key: &str) -> Result<Option<BlobMeta>> {
        let blobs = self.blobs.read().map_err(|_| Error::Internal {
            message: "lock poisoned".into(),
        })?;
        Ok(blobs.get(key).map(|b| BlobMeta {
            key: key.to_string(),
            size: b.data.len() as u64,
            last_modified: Some(b.last_modified),
        }))
    }
}

/// Filesystem blob store for single-node deployments.
///
/// Blob keys map to paths under the configured root; key segments are used
/// as directory components verbatim, so callers are responsible for
/// url-encoding anything that may contain separators.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    /// Creates a filesystem store rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() || key.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..") {
            return Err(Error::InvalidInput(format!("invalid blob key: {key}")));
        }
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn get(&self, key: &str) -> Result<Bytes> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(format!("blob not found: {key}")))
            }
            Err(e) => Err(Error::storage_with_source(format!("read {key}"), e)),
        }
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::storage_with_source(format!("mkdir for {key}"), e))?;
        }
        tokio::fs::write(&path, &data)
            .await
            .map_err(|e| Error::storage_with_source(format!("write {key}"), e))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::storage_with_source(format!("delete {key}"), e)),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        // Walk the deepest directory implied by the prefix, then filter.
        let dir_part = prefix.rsplit_once('/').map_or("", |(dir, _)| dir);
        let dir = if dir_part.is_empty() {
            self.root.clone()
        } else {
            self.root.join(dir_part)
        };

        let mut keys = Vec::new();
        let mut stack = vec![dir];
        while let Some(current) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&current).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(Error::storage_with_source("list blobs", e)),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| Error::storage_with_source("list blobs", e))?
            {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else if let Ok(rel) = path.strip_prefix(&self.root) {
                    let key = rel.to_string_lossy().replace('\\', "/");
                    if key.starts_with(prefix) {
                        keys.push(key);
                    }
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn head(&self, key: &str) -> Result<Option<BlobMeta>> {
        let path = self.path_for(key)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) => Ok(Some(BlobMeta {
                key: key.to_string(),
                size: meta.len(),
                last_modified: meta.modified().ok().map(DateTime::<Utc>::from),
            })),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::storage_with_source(format!("head {key}"), e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_roundtrip() {
        let store = MemoryBlobStore::new();
        store.put("a/b.json", Bytes::from("{}")).await.unwrap();

        let data = store.get("a/b.json").await.unwrap();
        assert_eq!(data, Bytes::from("{}"));

        let meta = store.head("a/b.json").await.unwrap().unwrap();
        assert_eq!(meta.size, 2);

        store.delete("a/b.json").await.unwrap();
        assert!(store.get("a/b.json").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn memory_store_lists_in_lexicographic_order() {
        let store = MemoryBlobStore::new();
        for key in ["p/b", "p/a", "p/c", "q/z"] {
            store.put(key, Bytes::from("x")).await.unwrap();
        }
        let keys = store.list("p/").await.unwrap();
        assert_eq!(keys, vec!["p/a", "p/b", "p/c"]);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let store = MemoryBlobStore::new();
        store.delete("never-written").await.unwrap();
    }

    #[tokio::test]
    async fn fs_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());

        store
            .put("datasets/abc/000000000.json", Bytes::from("[1]"))
            .await
            .unwrap();
        let data = store.get("datasets/abc/000000000.json").await.unwrap();
        assert_eq!(data, Bytes::from("[1]"));

        let keys = store.list("datasets/abc/").await.unwrap();
        assert_eq!(keys, vec!["datasets/abc/000000000.json"]);

        store.delete("datasets/abc/000000000.json").await.unwrap();
        assert!(store
            .head("datasets/abc/000000000.json")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn fs_store_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());
        assert!(store.get("../escape").await.is_err());
    }
}
