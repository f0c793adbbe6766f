//! Request queue engine.
//!
//! A multi-producer, multi-consumer, deduplicated, lease-locked FIFO. Rows
//! live in the metadata store; the pending order mirror and the lease locks
//! live in the coordination store. The coordination store is authoritative
//! for lease ownership; the row columns `locked_until`/`locked_by` are
//! best-effort mirrors written after the CAS succeeds.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

use crawlspace_core::{CoordStore, Principal, PrincipalId, PrincipalKind, RequestId, RequestQueueId};

use crate::error::{EngineError, Result};
use crate::meta::MetaStore;
use crate::model::{NewRequest, QueuedRequest, RequestPatch, RequestQueue};
use crate::util::with_retry;

/// Candidate batch size when scanning the pending set.
const SCAN_CHUNK: u64 = 64;

/// Bound on rebuilding a queue's pending mirror from the metadata store.
const MIRROR_REBUILD_LIMIT: u64 = 10_000;

/// Outcome of a single request insert.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AddRequestOutcome {
    /// Id of the row now owning the unique key.
    pub request_id: RequestId,
    /// The effective unique key (derived when the caller omitted one).
    pub unique_key: String,
    /// A request with this unique key already existed.
    pub was_already_present: bool,
    /// The existing request was already handled.
    pub was_already_handled: bool,
}

/// A batch item that could not be inserted.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnprocessedRequest {
    /// URL of the failed item.
    pub url: String,
    /// Unique key, when one was supplied or derivable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unique_key: Option<String>,
    /// Why the item failed.
    pub message: String,
}

/// Outcome of a batch insert; per-item failures do not abort the batch.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchOutcome {
    /// Successfully inserted (or deduplicated) items.
    pub processed: Vec<AddRequestOutcome>,
    /// Items that failed.
    pub unprocessed: Vec<UnprocessedRequest>,
}

/// Result of `acquire_head`.
#[derive(Debug, Clone)]
pub struct AcquiredHead {
    /// Requests now locked for the caller, oldest first.
    pub items: Vec<QueuedRequest>,
    /// When the acquired leases lapse.
    pub lock_expires_at: DateTime<Utc>,
    /// The queue still holds requests locked by somebody (including the
    /// caller) after this call.
    pub queue_has_locked_requests: bool,
    /// Sticky multi-client flag after registering this caller.
    pub had_multiple_clients: bool,
}

/// Normalizes a URL for dedup purposes: lowercased, trimmed, fragment and
/// trailing slash removed.
fn normalize_url(url: &str) -> String {
    let mut s = url.trim().to_lowercase();
    if let Some(pos) = s.find('#') {
        s.truncate(pos);
    }
    if s.ends_with('/') {
        s.pop();
    }
    s
}

/// Derives the canonical unique key for a request.
///
/// `GET` without a payload dedups on the normalized URL alone; anything else
/// mixes in the method and the first 8 characters of the base64-encoded
/// SHA-256 of the payload. The value is observable to clients, so the shape
/// is part of the wire contract.
#[must_use]
pub fn derive_unique_key(url: &str, method: &str, payload: Option<&str>) -> String {
    let normalized = normalize_url(url);
    if method == "GET" && payload.is_none() {
        return normalized;
    }
    let digest = Sha256::digest(payload.unwrap_or_default().as_bytes());
    let encoded = BASE64.encode(digest);
    format!("{method}({}):{normalized}", &encoded[..8])
}

fn lock_key(queue_id: &RequestQueueId, request_id: &RequestId) -> String {
    format!("rq-lock:{queue_id}:{request_id}")
}

fn pending_set(queue_id: &RequestQueueId) -> String {
    format!("rq-pending:{queue_id}")
}

/// Request queue service.
#[derive(Clone)]
pub struct RequestQueueService {
    meta: Arc<dyn MetaStore>,
    coord: Arc<dyn CoordStore>,
}

impl std::fmt::Debug for RequestQueueService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestQueueService").finish_non_exhaustive()
    }
}

impl RequestQueueService {
    /// Creates the service over its backing stores.
    #[must_use]
    pub fn new(meta: Arc<dyn MetaStore>, coord: Arc<dyn CoordStore>) -> Self {
        Self { meta, coord }
    }

    /// Creates a queue, optionally named.
    pub async fn create(&self, owner: &PrincipalId, name: Option<String>) -> Result<RequestQueue> {
        let now = Utc::now();
        let queue = RequestQueue {
            id: RequestQueueId::generate(),
            name,
            owner_id: owner.clone(),
            total_request_count: 0,
            handled_request_count: 0,
            pending_request_count: 0,
            had_multiple_clients: false,
            created_at: now,
            modified_at: now,
        };
        self.meta.insert_queue(&queue).await?;
        Ok(queue)
    }

    /// Resolves a path selector (`default`, an id, or a name) to a queue.
    ///
    /// The `default` alias resolves per-principal: a run-scoped principal
    /// gets its run's queue handle, anyone else a per-principal queue named
    /// `default` (created on first use). An unknown name is created only
    /// when `create_missing` is set.
    pub async fn resolve(
        &self,
        principal: &Principal,
        selector: &str,
        create_missing: bool,
    ) -> Result<RequestQueue> {
        if selector == "default" {
            if let PrincipalKind::Run(run_id) = &principal.kind {
                let run = self
                    .meta
                    .get_run(run_id)
                    .await?
                    .ok_or_else(|| EngineError::not_found("run", run_id))?;
                return self
                    .meta
                    .get_queue(&run.default_request_queue_id)
                    .await?
                    .ok_or_else(|| {
                        EngineError::not_found("request-queue", &run.default_request_queue_id)
                    });
            }
            if let Some(queue) = self
                .meta
                .find_queue_by_name(&principal.id, "default")
                .await?
            {
                return Ok(queue);
            }
            return self
                .create(&principal.id, Some("default".to_string()))
                .await;
        }

        if let Ok(id) = selector.parse::<RequestQueueId>() {
            if let Some(queue) = self.meta.get_queue(&id).await? {
                if queue.owner_id == principal.id || principal.is_service() {
                    return Ok(queue);
                }
                return Err(EngineError::not_found("request-queue", selector));
            }
        }

        if let Some(queue) = self
            .meta
            .find_queue_by_name(&principal.id, selector)
            .await?
        {
            return Ok(queue);
        }
        if create_missing {
            return self
                .create(&principal.id, Some(selector.to_string()))
                .await;
        }
        Err(EngineError::not_found("request-queue", selector))
    }

    /// Reads a queue by id.
    pub async fn get(&self, id: &RequestQueueId) -> Result<RequestQueue> {
        self.meta
            .get_queue(id)
            .await?
            .ok_or_else(|| EngineError::not_found("request-queue", id))
    }

    /// Deletes a queue and its requests.
    pub async fn delete(&self, id: &RequestQueueId) -> Result<()> {
        if !self.meta.delete_queue(id).await? {
            return Err(EngineError::not_found("request-queue", id));
        }
        Ok(())
    }

    /// Inserts one request; an existing unique key dedups instead of failing.
    pub async fn add_request(
        &self,
        queue: &RequestQueueId,
        new: &NewRequest,
        forefront: bool,
    ) -> Result<AddRequestOutcome> {
        let url = new.url.trim();
        if url.is_empty() {
            return Err(EngineError::Validation("request url must not be empty".into()));
        }
        let method = new
            .method
            .as_deref()
            .unwrap_or("GET")
            .trim()
            .to_uppercase();
        let unique_key = new
            .unique_key
            .clone()
            .unwrap_or_else(|| derive_unique_key(url, &method, new.payload.as_deref()));

        let row = QueuedRequest {
            id: RequestId::generate(),
            queue_id: queue.clone(),
            unique_key: unique_key.clone(),
            url: url.to_string(),
            method,
            payload: new.payload.clone(),
            headers: new.headers.clone().unwrap_or_default(),
            user_data: new
                .user_data
                .clone()
                .unwrap_or(serde_json::Value::Object(Default::default())),
            retry_count: new.retry_count.unwrap_or(0),
            no_retry: new.no_retry.unwrap_or(false),
            error_messages: new.error_messages.clone().unwrap_or_default(),
            handled_at: None,
            order_no: 0,
            locked_until: None,
            locked_by: None,
        };

        let outcome = with_retry(|| self.meta.insert_request(&row, forefront)).await?;
        if !outcome.was_already_present {
            self.coord
                .zadd(
                    &pending_set(queue),
                    outcome.request.id.as_str(),
                    outcome.request.order_no,
                )
                .await?;
        }
        Ok(AddRequestOutcome {
            request_id: outcome.request.id,
            unique_key,
            was_already_present: outcome.was_already_present,
            was_already_handled: outcome.request.handled_at.is_some(),
        })
    }

    /// Inserts a batch; failures are reported per item, not as a batch error.
    pub async fn add_requests_batch(
        &self,
        queue: &RequestQueueId,
        requests: &[NewRequest],
        forefront: bool,
    ) -> Result<BatchOutcome> {
        let mut processed = Vec::with_capacity(requests.len());
        let mut unprocessed = Vec::new();
        for new in requests {
            match self.add_request(queue, new, forefront).await {
                Ok(outcome) => processed.push(outcome),
                Err(e) => unprocessed.push(UnprocessedRequest {
                    url: new.url.clone(),
                    unique_key: new.unique_key.clone(),
                    message: e.to_string(),
                }),
            }
        }
        Ok(BatchOutcome {
            processed,
            unprocessed,
        })
    }

    /// Reads one request, verifying it belongs to `queue`.
    pub async fn get_request(
        &self,
        queue: &RequestQueueId,
        id: &RequestId,
    ) -> Result<QueuedRequest> {
        let request = self
            .meta
            .get_request(id)
            .await?
            .filter(|r| r.queue_id == *queue)
            .ok_or_else(|| EngineError::not_found("request", id))?;
        Ok(request)
    }

    /// Returns pending candidates from the coordination-store mirror,
    /// rebuilding the mirror from the metadata store when it is cold.
    async fn pending_candidates(
        &self,
        queue: &RequestQueue,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<String>> {
        let set = pending_set(&queue.id);
        let members = self
            .coord
            .zrange(&set, offset as usize, limit as usize)
            .await?;
        if !members.is_empty() || offset > 0 || queue.pending_request_count == 0 {
            return Ok(members.into_iter().map(|(m, _)| m).collect());
        }

        // Cold mirror (fresh coordination store); rebuild from rows.
        let rows = self
            .meta
            .list_pending_requests(&queue.id, 0, MIRROR_REBUILD_LIMIT)
            .await?;
        for row in &rows {
            self.coord
                .zadd(&set, row.id.as_str(), row.order_no)
                .await?;
        }
        let members = self
            .coord
            .zrange(&set, offset as usize, limit as usize)
            .await?;
        Ok(members.into_iter().map(|(m, _)| m).collect())
    }

    /// Walks the pending set, classifying each candidate and collecting up
    /// to `limit` requests through `lock`: `None` skips a locked candidate,
    /// `Some(row)` keeps it.
    async fn scan_head<F, Fut>(
        &self,
        queue: &RequestQueue,
        limit: u64,
        mut lock: F,
    ) -> Result<(Vec<QueuedRequest>, bool)>
    where
        F: FnMut(QueuedRequest) -> Fut,
        Fut: std::future::Future<Output = Result<Option<QueuedRequest>>>,
    {
        let set = pending_set(&queue.id);
        let mut items = Vec::new();
        let mut saw_locked = false;
        let mut offset = 0u64;

        while (items.len() as u64) < limit {
            let candidates = self.pending_candidates(queue, offset, SCAN_CHUNK).await?;
            if candidates.is_empty() {
                break;
            }
            offset += candidates.len() as u64;

            for member in candidates {
                if items.len() as u64 >= limit {
                    break;
                }
                let Ok(request_id) = member.parse::<RequestId>() else {
                    self.coord.zrem(&set, &member).await?;
                    // Evictions shift later members left; keep the cursor aligned.
                    offset = offset.saturating_sub(1);
                    continue;
                };
                let row = self.meta.get_request(&request_id).await?;
                let Some(row) = row.filter(QueuedRequest::is_pending) else {
                    // Handled or deleted; evict the stale mirror entry.
                    self.coord.zrem(&set, &member).await?;
                    offset = offset.saturating_sub(1);
                    continue;
                };
                match lock(row).await? {
                    Some(row) => items.push(row),
                    None => saw_locked = true,
                }
            }
        }
        Ok((items, saw_locked))
    }

    /// Peeks at the head of the queue without locking: the oldest pending,
    /// unlocked requests.
    pub async fn get_head(
        &self,
        queue_id: &RequestQueueId,
        limit: u64,
    ) -> Result<Vec<QueuedRequest>> {
        let queue = self.get(queue_id).await?;
        let coord = Arc::clone(&self.coord);
        let queue_for_lock = queue.id.clone();
        let (items, _) = self
            .scan_head(&queue, limit, move |row| {
                let coord = Arc::clone(&coord);
                let key = lock_key(&queue_for_lock, &row.id);
                async move {
                    match coord.get_lease(&key).await? {
                        Some(_) => Ok(None),
                        None => Ok(Some(row)),
                    }
                }
            })
            .await?;
        Ok(items)
    }

    /// Locks up to `limit` pending requests for `client_key`.
    pub async fn acquire_head(
        &self,
        queue_id: &RequestQueueId,
        limit: u64,
        lock_secs: u64,
        client_key: &str,
    ) -> Result<AcquiredHead> {
        if client_key.is_empty() {
            return Err(EngineError::Validation("clientKey must not be empty".into()));
        }
        if lock_secs == 0 {
            return Err(EngineError::Validation("lockSecs must be positive".into()));
        }
        let queue = self.get(queue_id).await?;
        let had_multiple_clients = self
            .meta
            .register_queue_client(&queue.id, client_key)
            .await?;

        let ttl = Duration::from_secs(lock_secs);
        let lock_expires_at = Utc::now()
            + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(60));

        let coord = Arc::clone(&self.coord);
        let meta = Arc::clone(&self.meta);
        let queue_for_lock = queue.id.clone();
        let client = client_key.to_string();
        let (items, saw_locked) = self
            .scan_head(&queue, limit, move |mut row| {
                let coord = Arc::clone(&coord);
                let meta = Arc::clone(&meta);
                let key = lock_key(&queue_for_lock, &row.id);
                let client = client.clone();
                async move {
                    match coord.try_acquire_lease(&key, &client, ttl).await? {
                        Some(lease) => {
                            meta.mirror_request_lock(
                                &row.id,
                                Some(lease.expires_at),
                                Some(&lease.client_key),
                            )
                            .await?;
                            row.locked_until = Some(lease.expires_at);
                            row.locked_by = Some(lease.client_key);
                            Ok(Some(row))
                        }
                        None => Ok(None),
                    }
                }
            })
            .await?;

        Ok(AcquiredHead {
            queue_has_locked_requests: saw_locked || !items.is_empty(),
            had_multiple_clients,
            lock_expires_at,
            items,
        })
    }

    /// Extends the caller's lease on a request to `now + lock_secs`.
    pub async fn prolong_lock(
        &self,
        queue_id: &RequestQueueId,
        request_id: &RequestId,
        client_key: &str,
        lock_secs: u64,
    ) -> Result<DateTime<Utc>> {
        let request = self.get_request(queue_id, request_id).await?;
        let key = lock_key(queue_id, &request.id);
        let lease = self
            .coord
            .prolong_lease(&key, client_key, Duration::from_secs(lock_secs))
            .await?
            .ok_or_else(|| EngineError::NotLockOwner {
                request_id: request_id.to_string(),
            })?;
        self.meta
            .mirror_request_lock(&request.id, Some(lease.expires_at), Some(&lease.client_key))
            .await?;
        Ok(lease.expires_at)
    }

    /// Releases the caller's lease, returning the request to the pending
    /// head.
    pub async fn release_lock(
        &self,
        queue_id: &RequestQueueId,
        request_id: &RequestId,
        client_key: &str,
    ) -> Result<()> {
        let request = self.get_request(queue_id, request_id).await?;
        let key = lock_key(queue_id, &request.id);
        if !self.coord.release_lease(&key, client_key).await? {
            return Err(EngineError::NotLockOwner {
                request_id: request_id.to_string(),
            });
        }
        self.meta
            .mirror_request_lock(&request.id, None, None)
            .await?;
        Ok(())
    }

    /// Applies a patch to a request.
    ///
    /// Fails with `LockedByOther` when the request is locked and the caller's
    /// `client_key` does not match the holder. A successful update releases
    /// the caller's lease implicitly; marking a request handled removes it
    /// from the pending set and moves the queue counters in the same
    /// metadata transaction.
    pub async fn update_request(
        &self,
        queue_id: &RequestQueueId,
        request_id: &RequestId,
        patch: &RequestPatch,
        client_key: Option<&str>,
    ) -> Result<QueuedRequest> {
        let mut request = self.get_request(queue_id, request_id).await?;
        let key = lock_key(queue_id, &request.id);

        let lease = self.coord.get_lease(&key).await?;
        if let Some(lease) = &lease {
            if client_key != Some(lease.client_key.as_str()) {
                return Err(EngineError::LockedByOther {
                    request_id: request_id.to_string(),
                });
            }
        }

        let newly_handled = request.handled_at.is_none() && patch.handled_at.is_some();
        if let Some(handled_at) = patch.handled_at {
            if request.handled_at.is_none() {
                request.handled_at = Some(handled_at);
            }
        }
        if let Some(retry_count) = patch.retry_count {
            request.retry_count = retry_count;
        }
        if let Some(error_messages) = &patch.error_messages {
            request.error_messages = error_messages.clone();
        }
        if let Some(user_data) = &patch.user_data {
            request.user_data = user_data.clone();
        }
        request.locked_until = None;
        request.locked_by = None;

        with_retry(|| self.meta.update_request(&request, newly_handled)).await?;

        if newly_handled {
            self.coord
                .zrem(&pending_set(queue_id), request.id.as_str())
                .await?;
        }
        if let Some(lease) = lease {
            let _ = self
                .coord
                .release_lease(&key, &lease.client_key)
                .await?;
        }
        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::MemoryMetaStore;
    use crawlspace_core::MemoryCoordStore;

    fn service() -> RequestQueueService {
        RequestQueueService::new(
            Arc::new(MemoryMetaStore::new()),
            Arc::new(MemoryCoordStore::new()),
        )
    }

    fn owner() -> PrincipalId {
        PrincipalId::generate()
    }

    fn req(url: &str) -> NewRequest {
        NewRequest {
            url: url.to_string(),
            ..NewRequest::default()
        }
    }

    #[test]
    fn unique_key_for_plain_get_is_normalized_url() {
        assert_eq!(
            derive_unique_key("  https://Example.COM/Path/ ", "GET", None),
            "https://example.com/path"
        );
        assert_eq!(
            derive_unique_key("https://example.com/a#frag", "GET", None),
            "https://example.com/a"
        );
    }

    #[test]
    fn unique_key_for_post_includes_method_and_payload_hash() {
        let key = derive_unique_key("https://example.com/a", "POST", Some("{\"x\":1}"));
        assert!(key.starts_with("POST("));
        assert!(key.ends_with("):https://example.com/a"));
        // 8 base64 characters between the parenthesis and the colon.
        let hash = &key["POST(".len()..key.len() - "):https://example.com/a".len()];
        assert_eq!(hash.len(), 8);

        // Different payloads must produce different keys.
        let other = derive_unique_key("https://example.com/a", "POST", Some("{\"x\":2}"));
        assert_ne!(key, other);

        // The derivation is deterministic.
        assert_eq!(
            key,
            derive_unique_key("https://example.com/a", "POST", Some("{\"x\":1}"))
        );
    }

    #[tokio::test]
    async fn add_request_is_idempotent() {
        let svc = service();
        let queue = svc.create(&owner(), None).await.unwrap();

        let first = svc
            .add_request(&queue.id, &req("https://a"), false)
            .await
            .unwrap();
        assert!(!first.was_already_present);

        let second = svc
            .add_request(&queue.id, &req("https://a"), false)
            .await
            .unwrap();
        assert!(second.was_already_present);
        assert_eq!(first.request_id, second.request_id);

        let queue = svc.get(&queue.id).await.unwrap();
        assert_eq!(queue.total_request_count, 1);
        assert_eq!(queue.pending_request_count, 1);
    }

    #[tokio::test]
    async fn batch_dedups_and_counts() {
        let svc = service();
        let queue = svc.create(&owner(), None).await.unwrap();

        for _ in 0..3 {
            let outcome = svc
                .add_requests_batch(
                    &queue.id,
                    &[req("https://a"), req("https://a"), req("https://b")],
                    false,
                )
                .await
                .unwrap();
            assert_eq!(outcome.processed.len(), 3);
            assert!(outcome.unprocessed.is_empty());
        }

        let queue = svc.get(&queue.id).await.unwrap();
        assert_eq!(queue.total_request_count, 2);
        assert_eq!(queue.pending_request_count, 2);
    }

    #[tokio::test]
    async fn batch_reports_invalid_items_without_aborting() {
        let svc = service();
        let queue = svc.create(&owner(), None).await.unwrap();

        let outcome = svc
            .add_requests_batch(&queue.id, &[req("https://a"), req("   ")], false)
            .await
            .unwrap();
        assert_eq!(outcome.processed.len(), 1);
        assert_eq!(outcome.unprocessed.len(), 1);
    }

    #[tokio::test]
    async fn forefront_precedes_fifo() {
        let svc = service();
        let queue = svc.create(&owner(), None).await.unwrap();

        svc.add_request(&queue.id, &req("https://r1"), false)
            .await
            .unwrap();
        svc.add_request(&queue.id, &req("https://r2"), true)
            .await
            .unwrap();
        svc.add_request(&queue.id, &req("https://r3"), true)
            .await
            .unwrap();

        let head = svc.get_head(&queue.id, 10).await.unwrap();
        let urls: Vec<_> = head.iter().map(|r| r.url.as_str()).collect();
        // Forefront first, most recent forefront insertion leading.
        assert_eq!(urls, vec!["https://r3", "https://r2", "https://r1"]);
    }

    #[tokio::test]
    async fn acquire_head_locks_and_respects_limit() {
        let svc = service();
        let queue = svc.create(&owner(), None).await.unwrap();
        for i in 0..5 {
            svc.add_request(&queue.id, &req(&format!("https://r{i}")), false)
                .await
                .unwrap();
        }

        let acquired = svc.acquire_head(&queue.id, 2, 60, "w1").await.unwrap();
        assert_eq!(acquired.items.len(), 2);
        assert!(acquired.queue_has_locked_requests);
        assert!(!acquired.had_multiple_clients);

        // A second client sees the lock and skips past it.
        let acquired2 = svc.acquire_head(&queue.id, 10, 60, "w2").await.unwrap();
        assert_eq!(acquired2.items.len(), 3);
        assert!(acquired2.had_multiple_clients);

        // Nothing pending and unlocked remains.
        let head = svc.get_head(&queue.id, 10).await.unwrap();
        assert!(head.is_empty());
    }

    #[tokio::test]
    async fn update_by_non_owner_is_rejected_while_locked() {
        let svc = service();
        let queue = svc.create(&owner(), None).await.unwrap();
        svc.add_request(&queue.id, &req("https://a"), false)
            .await
            .unwrap();

        let acquired = svc.acquire_head(&queue.id, 1, 60, "w1").await.unwrap();
        let request = &acquired.items[0];

        let patch = RequestPatch {
            handled_at: Some(Utc::now()),
            ..RequestPatch::default()
        };
        let err = svc
            .update_request(&queue.id, &request.id, &patch, Some("w2"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::LockedByOther { .. }));

        let row = svc.get_request(&queue.id, &request.id).await.unwrap();
        assert!(row.handled_at.is_none());

        // The lock owner succeeds, counters move, lease is released.
        let updated = svc
            .update_request(&queue.id, &request.id, &patch, Some("w1"))
            .await
            .unwrap();
        assert!(updated.handled_at.is_some());

        let queue = svc.get(&queue.id).await.unwrap();
        assert_eq!(queue.handled_request_count, 1);
        assert_eq!(queue.pending_request_count, 0);
    }

    #[tokio::test]
    async fn lease_round_trip_returns_request_to_pending() {
        let svc = service();
        let queue = svc.create(&owner(), None).await.unwrap();
        svc.add_request(&queue.id, &req("https://a"), false)
            .await
            .unwrap();

        let acquired = svc.acquire_head(&queue.id, 1, 60, "w1").await.unwrap();
        let request_id = acquired.items[0].id.clone();

        svc.release_lock(&queue.id, &request_id, "w1")
            .await
            .unwrap();

        let acquired = svc.acquire_head(&queue.id, 1, 60, "w1").await.unwrap();
        assert_eq!(acquired.items[0].id, request_id);
    }

    #[tokio::test]
    async fn expired_lease_is_reacquirable_and_stale_client_rejected() {
        let svc = service();
        let queue = svc.create(&owner(), None).await.unwrap();
        svc.add_request(&queue.id, &req("https://a"), false)
            .await
            .unwrap();

        let acquired = svc.acquire_head(&queue.id, 1, 1, "w1").await.unwrap();
        let request_id = acquired.items[0].id.clone();

        tokio::time::sleep(Duration::from_millis(1100)).await;

        let acquired = svc.acquire_head(&queue.id, 1, 60, "w2").await.unwrap();
        assert_eq!(acquired.items[0].id, request_id);

        let err = svc
            .prolong_lock(&queue.id, &request_id, "w1", 60)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotLockOwner { .. }));
    }

    #[tokio::test]
    async fn handled_requests_leave_the_head() {
        let svc = service();
        let queue = svc.create(&owner(), None).await.unwrap();
        svc.add_request(&queue.id, &req("https://a"), false)
            .await
            .unwrap();
        svc.add_request(&queue.id, &req("https://b"), false)
            .await
            .unwrap();

        let acquired = svc.acquire_head(&queue.id, 1, 60, "w1").await.unwrap();
        let patch = RequestPatch {
            handled_at: Some(Utc::now()),
            ..RequestPatch::default()
        };
        svc.update_request(&queue.id, &acquired.items[0].id, &patch, Some("w1"))
            .await
            .unwrap();

        let head = svc.get_head(&queue.id, 10).await.unwrap();
        assert_eq!(head.len(), 1);
        assert_eq!(head[0].url, "https://b");

        // Re-adding the handled unique key reports it as such.
        let outcome = svc
            .add_request(&queue.id, &req("https://a"), false)
            .await
            .unwrap();
        assert!(outcome.was_already_present);
        assert!(outcome.was_already_handled);
    }
}
