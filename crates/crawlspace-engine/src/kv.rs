//! Key-value store service.
//!
//! Bodies are blob pass-through at `key-value-stores/<id>/<url-encoded-key>`;
//! the metadata store keeps per-record bookkeeping (content type, size) that
//! also drives lexicographic key listing.

use bytes::Bytes;
use chrono::Utc;
use std::sync::Arc;

use crawlspace_core::{BlobStore, KeyValueStoreId, Principal, PrincipalId, PrincipalKind};

use crate::error::{EngineError, Result};
use crate::meta::MetaStore;
use crate::model::{KeyValueStore, KvRecordMeta};
use crate::util::with_retry;

/// A fetched record: body plus declared content type.
#[derive(Debug, Clone)]
pub struct KvRecord {
    /// Record body.
    pub body: Bytes,
    /// Declared content type.
    pub content_type: String,
}

/// One page of listed keys.
#[derive(Debug, Clone)]
pub struct KeyListing {
    /// Record bookkeeping in lexicographic key order.
    pub items: Vec<KvRecordMeta>,
    /// More keys exist beyond this page.
    pub is_truncated: bool,
    /// Pass as `exclusiveStartKey` to continue; set iff truncated.
    pub next_exclusive_start_key: Option<String>,
}

fn record_key(store: &KeyValueStoreId, key: &str) -> String {
    format!("key-value-stores/{store}/{}", urlencoding::encode(key))
}

/// Key-value store service.
#[derive(Clone)]
pub struct KeyValueService {
    meta: Arc<dyn MetaStore>,
    blob: Arc<dyn BlobStore>,
}

impl std::fmt::Debug for KeyValueService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyValueService").finish_non_exhaustive()
    }
}

impl KeyValueService {
    /// Creates the service over its backing stores.
    #[must_use]
    pub fn new(meta: Arc<dyn MetaStore>, blob: Arc<dyn BlobStore>) -> Self {
        Self { meta, blob }
    }

    /// Creates a store, optionally named.
    pub async fn create(&self, owner: &PrincipalId, name: Option<String>) -> Result<KeyValueStore> {
        let now = Utc::now();
        let store = KeyValueStore {
            id: KeyValueStoreId::generate(),
            name,
            owner_id: owner.clone(),
            created_at: now,
            modified_at: now,
        };
        self.meta.insert_kv_store(&store).await?;
        Ok(store)
    }

    /// Resolves a path selector (`default`, an id, or a name) to a store;
    /// see the request-queue service for the alias rules.
    pub async fn resolve(
        &self,
        principal: &Principal,
        selector: &str,
        create_missing: bool,
    ) -> Result<KeyValueStore> {
        if selector == "default" {
            if let PrincipalKind::Run(run_id) = &principal.kind {
                let run = self
                    .meta
                    .get_run(run_id)
                    .await?
                    .ok_or_else(|| EngineError::not_found("run", run_id))?;
                return self
                    .meta
                    .get_kv_store(&run.default_key_value_store_id)
                    .await?
                    .ok_or_else(|| {
                        EngineError::not_found("key-value-store", &run.default_key_value_store_id)
                    });
            }
            if let Some(store) = self
                .meta
                .find_kv_store_by_name(&principal.id, "default")
                .await?
            {
                return Ok(store);
            }
            return self
                .create(&principal.id, Some("default".to_string()))
                .await;
        }

        if let Ok(id) = selector.parse::<KeyValueStoreId>() {
            if let Some(store) = self.meta.get_kv_store(&id).await? {
                if store.owner_id == principal.id || principal.is_service() {
                    return Ok(store);
                }
                return Err(EngineError::not_found("key-value-store", selector));
            }
        }

        if let Some(store) = self
            .meta
            .find_kv_store_by_name(&principal.id, selector)
            .await?
        {
            return Ok(store);
        }
        if create_missing {
            return self
                .create(&principal.id, Some(selector.to_string()))
                .await;
        }
        Err(EngineError::not_found("key-value-store", selector))
    }

    /// Reads a store by id.
    pub async fn get_store(&self, id: &KeyValueStoreId) -> Result<KeyValueStore> {
        self.meta
            .get_kv_store(id)
            .await?
            .ok_or_else(|| EngineError::not_found("key-value-store", id))
    }

    /// Deletes a store row and its record bookkeeping.
    pub async fn delete_store(&self, id: &KeyValueStoreId) -> Result<()> {
        if !self.meta.delete_kv_store(id).await? {
            return Err(EngineError::not_found("key-value-store", id));
        }
        Ok(())
    }

    /// Writes a record; overwrites any previous value.
    pub async fn put(
        &self,
        store: &KeyValueStoreId,
        key: &str,
        body: Bytes,
        content_type: &str,
    ) -> Result<()> {
        if key.is_empty() {
            return Err(EngineError::Validation("record key must not be empty".into()));
        }
        let blob_key = record_key(store, key);
        with_retry(|| async {
            self.blob
                .put(&blob_key, body.clone())
                .await
                .map_err(EngineError::from)
        })
        .await?;
        self.meta
            .upsert_kv_record(
                store,
                &KvRecordMeta {
                    key: key.to_string(),
                    content_type: content_type.to_string(),
                    size: body.len() as u64,
                },
            )
            .await
    }

    /// Reads a record. `Ok(None)` means the key is absent (the store itself
    /// must already be resolved, so "store missing" never reaches here).
    pub async fn get(&self, store: &KeyValueStoreId, key: &str) -> Result<Option<KvRecord>> {
        let Some(meta) = self.meta.get_kv_record(store, key).await? else {
            return Ok(None);
        };
        match self.blob.get(&record_key(store, key)).await {
            Ok(body) => Ok(Some(KvRecord {
                body,
                content_type: meta.content_type,
            })),
            // Bookkeeping ahead of the blob store; treat as absent.
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Deletes a record. Idempotent.
    pub async fn delete(&self, store: &KeyValueStoreId, key: &str) -> Result<()> {
        self.blob.delete(&record_key(store, key)).await?;
        self.meta.delete_kv_record(store, key).await
    }

    /// Lists keys in lexicographic order, starting after `exclusive_start_key`.
    pub async fn list_keys(
        &self,
        store: &KeyValueStoreId,
        limit: u64,
        exclusive_start_key: Option<&str>,
    ) -> Result<KeyListing> {
        let mut items = self
            .meta
            .list_kv_records(store, exclusive_start_key, limit + 1)
            .await?;
        let is_truncated = items.len() as u64 > limit;
        if is_truncated {
            items.truncate(limit as usize);
        }
        let next_exclusive_start_key = if is_truncated {
            items.last().map(|r| r.key.clone())
        } else {
            None
        };
        Ok(KeyListing {
            items,
            is_truncated,
            next_exclusive_start_key,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::MemoryMetaStore;
    use crawlspace_core::MemoryBlobStore;

    fn service() -> KeyValueService {
        KeyValueService::new(Arc::new(MemoryMetaStore::new()), Arc::new(MemoryBlobStore::new()))
    }

    #[tokio::test]
    async fn put_get_roundtrip_preserves_content_type() {
        let svc = service();
        let store = svc.create(&PrincipalId::generate(), None).await.unwrap();

        svc.put(&store.id, "INPUT", Bytes::from("{\"x\":1}"), "application/json")
            .await
            .unwrap();

        let record = svc.get(&store.id, "INPUT").await.unwrap().unwrap();
        assert_eq!(record.body, Bytes::from("{\"x\":1}"));
        assert_eq!(record.content_type, "application/json");
    }

    #[tokio::test]
    async fn put_overwrites() {
        let svc = service();
        let store = svc.create(&PrincipalId::generate(), None).await.unwrap();

        svc.put(&store.id, "k", Bytes::from("one"), "text/plain")
            .await
            .unwrap();
        svc.put(&store.id, "k", Bytes::from("two"), "text/plain")
            .await
            .unwrap();

        let record = svc.get(&store.id, "k").await.unwrap().unwrap();
        assert_eq!(record.body, Bytes::from("two"));
    }

    #[tokio::test]
    async fn missing_key_is_none_and_delete_is_idempotent() {
        let svc = service();
        let store = svc.create(&PrincipalId::generate(), None).await.unwrap();

        assert!(svc.get(&store.id, "nope").await.unwrap().is_none());
        svc.delete(&store.id, "nope").await.unwrap();
    }

    #[tokio::test]
    async fn list_keys_paginates_lexicographically() {
        let svc = service();
        let store = svc.create(&PrincipalId::generate(), None).await.unwrap();
        for key in ["b", "a", "d", "c"] {
            svc.put(&store.id, key, Bytes::from("x"), "text/plain")
                .await
                .unwrap();
        }

        let page = svc.list_keys(&store.id, 2, None).await.unwrap();
        let keys: Vec<_> = page.items.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, vec!["a", "b"]);
        assert!(page.is_truncated);
        assert_eq!(page.next_exclusive_start_key.as_deref(), Some("b"));

        let page = svc.list_keys(&store.id, 10, Some("b")).await.unwrap();
        let keys: Vec<_> = page.items.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, vec!["c", "d"]);
        assert!(!page.is_truncated);
        assert!(page.next_exclusive_start_key.is_none());
    }

    #[tokio::test]
    async fn keys_with_slashes_are_encoded_in_blob_paths() {
        let svc = service();
        let store = svc.create(&PrincipalId::generate(), None).await.unwrap();

        svc.put(&store.id, "a/b c", Bytes::from("v"), "text/plain")
            .await
            .unwrap();
        let record = svc.get(&store.id, "a/b c").await.unwrap().unwrap();
        assert_eq!(record.body, Bytes::from("v"));
    }
}
