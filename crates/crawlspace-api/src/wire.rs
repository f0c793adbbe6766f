//! Stable wire shapes.
//!
//! Rows are snake_case internally; everything here serializes camelCase.
//! Successful responses wrap their payload in `{"data": …}`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crawlspace_core::{
    ActorId, DatasetId, KeyValueStoreId, PrincipalId, RequestId, RequestQueueId, RunId,
};
use crawlspace_engine::{
    Actor, AcquiredHead, AddRequestOutcome, Dataset, KeyValueStore, KvRecordMeta, LogEntry,
    QueuedRequest, RequestQueue, Run, RunStatus, UnprocessedRequest,
};

/// The `{"data": …}` success envelope.
#[derive(Debug, Serialize, Deserialize)]
pub struct Data<T> {
    /// Response payload.
    pub data: T,
}

impl<T> Data<T> {
    /// Wraps a payload.
    pub fn new(data: T) -> Self {
        Self { data }
    }
}

/// Pagination headers attached to dataset item listings.
pub mod pagination_headers {
    /// Total matching items.
    pub const TOTAL: &str = "x-apify-pagination-total";
    /// Requested offset.
    pub const OFFSET: &str = "x-apify-pagination-offset";
    /// Requested limit.
    pub const LIMIT: &str = "x-apify-pagination-limit";
}

// ============================================================================
// Actors
// ============================================================================

/// Actor wire shape.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActorWire {
    pub id: ActorId,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub default_run_options: RunOptionsWire,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

/// Default run options wire shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOptionsWire {
    pub image: String,
    pub memory_mbytes: u32,
    pub timeout_secs: u64,
}

impl From<Actor> for ActorWire {
    fn from(actor: Actor) -> Self {
        Self {
            id: actor.id,
            name: actor.name,
            title: actor.title,
            description: actor.description,
            default_run_options: RunOptionsWire {
                image: actor.default_run_options.image,
                memory_mbytes: actor.default_run_options.memory_mbytes,
                timeout_secs: actor.default_run_options.timeout_secs,
            },
            created_at: actor.created_at,
            modified_at: actor.modified_at,
        }
    }
}

/// Body for actor create/update.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActorUpsert {
    pub name: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub default_run_options: Option<RunOptionsWire>,
}

// ============================================================================
// Runs
// ============================================================================

/// Run wire shape.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunWire {
    pub id: RunId,
    pub actor_id: ActorId,
    pub user_id: PrincipalId,
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub default_dataset_id: DatasetId,
    pub default_key_value_store_id: KeyValueStoreId,
    pub default_request_queue_id: RequestQueueId,
    pub timeout_secs: u64,
    pub memory_mbytes: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
    pub stats: RunStatsWire,
    pub created_at: DateTime<Utc>,
}

/// Run statistics wire shape.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStatsWire {
    pub input_body_len: u64,
    pub restart_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_millis: Option<u64>,
}

impl From<Run> for RunWire {
    fn from(run: Run) -> Self {
        Self {
            id: run.id,
            actor_id: run.actor_id,
            user_id: run.principal_id,
            status: run.status,
            status_message: run.status_message,
            started_at: run.started_at,
            finished_at: run.finished_at,
            default_dataset_id: run.default_dataset_id,
            default_key_value_store_id: run.default_key_value_store_id,
            default_request_queue_id: run.default_request_queue_id,
            timeout_secs: run.timeout_secs,
            memory_mbytes: run.memory_mbytes,
            exit_code: run.exit_code,
            stats: RunStatsWire {
                input_body_len: run.stats.input_body_len,
                restart_count: run.stats.restart_count,
                duration_millis: run.stats.duration_millis,
            },
            created_at: run.created_at,
        }
    }
}

/// Body for `POST /acts/:id/runs`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRunBody {
    #[serde(default)]
    pub input: Option<serde_json::Value>,
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub memory: Option<u32>,
}

/// Body for the trusted `PUT /actor-runs/:id`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRunBody {
    pub status: RunStatus,
    #[serde(default)]
    pub status_message: Option<String>,
    #[serde(default)]
    pub exit_code: Option<i64>,
}

// ============================================================================
// Storages
// ============================================================================

/// Body for storage creation.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateStorageBody {
    #[serde(default)]
    pub name: Option<String>,
}

/// Dataset wire shape.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetWire {
    pub id: DatasetId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub item_count: u64,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl From<Dataset> for DatasetWire {
    fn from(dataset: Dataset) -> Self {
        Self {
            id: dataset.id,
            name: dataset.name,
            item_count: dataset.item_count,
            created_at: dataset.created_at,
            modified_at: dataset.modified_at,
        }
    }
}

/// Key-value store wire shape.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyValueStoreWire {
    pub id: KeyValueStoreId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl From<KeyValueStore> for KeyValueStoreWire {
    fn from(store: KeyValueStore) -> Self {
        Self {
            id: store.id,
            name: store.name,
            created_at: store.created_at,
            modified_at: store.modified_at,
        }
    }
}

/// One listed key.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyInfoWire {
    pub key: String,
    pub size: u64,
    pub content_type: String,
}

impl From<KvRecordMeta> for KeyInfoWire {
    fn from(meta: KvRecordMeta) -> Self {
        Self {
            key: meta.key,
            size: meta.size,
            content_type: meta.content_type,
        }
    }
}

/// `GET /key-value-stores/:id/keys` payload.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyListingWire {
    pub items: Vec<KeyInfoWire>,
    pub is_truncated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_exclusive_start_key: Option<String>,
}

// ============================================================================
// Request queues
// ============================================================================

/// Request queue wire shape.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestQueueWire {
    pub id: RequestQueueId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub total_request_count: u64,
    pub handled_request_count: u64,
    pub pending_request_count: u64,
    pub had_multiple_clients: bool,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl From<RequestQueue> for RequestQueueWire {
    fn from(queue: RequestQueue) -> Self {
        Self {
            id: queue.id,
            name: queue.name,
            total_request_count: queue.total_request_count,
            handled_request_count: queue.handled_request_count,
            pending_request_count: queue.pending_request_count,
            had_multiple_clients: queue.had_multiple_clients,
            created_at: queue.created_at,
            modified_at: queue.modified_at,
        }
    }
}

/// Queued request wire shape.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestWire {
    pub id: RequestId,
    pub unique_key: String,
    pub url: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub user_data: serde_json::Value,
    pub retry_count: u32,
    pub no_retry: bool,
    pub error_messages: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handled_at: Option<DateTime<Utc>>,
    pub order_no: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locked_until: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locked_by: Option<String>,
}

impl From<QueuedRequest> for RequestWire {
    fn from(request: QueuedRequest) -> Self {
        Self {
            id: request.id,
            unique_key: request.unique_key,
            url: request.url,
            method: request.method,
            payload: request.payload,
            headers: request.headers,
            user_data: request.user_data,
            retry_count: request.retry_count,
            no_retry: request.no_retry,
            error_messages: request.error_messages,
            handled_at: request.handled_at,
            order_no: request.order_no,
            locked_until: request.locked_until,
            locked_by: request.locked_by,
        }
    }
}

/// `POST /requests` payload.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddRequestWire {
    pub request_id: RequestId,
    pub unique_key: String,
    pub was_already_present: bool,
    pub was_already_handled: bool,
}

impl From<AddRequestOutcome> for AddRequestWire {
    fn from(outcome: AddRequestOutcome) -> Self {
        Self {
            request_id: outcome.request_id,
            unique_key: outcome.unique_key,
            was_already_present: outcome.was_already_present,
            was_already_handled: outcome.was_already_handled,
        }
    }
}

/// `POST /requests/batch` payload.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchWire {
    pub processed: Vec<AddRequestWire>,
    pub unprocessed: Vec<UnprocessedWire>,
}

/// One failed batch item.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnprocessedWire {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unique_key: Option<String>,
    pub message: String,
}

impl From<UnprocessedRequest> for UnprocessedWire {
    fn from(item: UnprocessedRequest) -> Self {
        Self {
            url: item.url,
            unique_key: item.unique_key,
            message: item.message,
        }
    }
}

/// `GET /head` payload.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueHeadWire {
    pub limit: u64,
    pub items: Vec<RequestWire>,
}

/// `POST /head/lock` payload.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockedHeadWire {
    pub items: Vec<RequestWire>,
    pub lock_expires_at: DateTime<Utc>,
    pub queue_has_locked_requests: bool,
    pub had_multiple_clients: bool,
}

impl From<AcquiredHead> for LockedHeadWire {
    fn from(head: AcquiredHead) -> Self {
        Self {
            items: head.items.into_iter().map(RequestWire::from).collect(),
            lock_expires_at: head.lock_expires_at,
            queue_has_locked_requests: head.queue_has_locked_requests,
            had_multiple_clients: head.had_multiple_clients,
        }
    }
}

/// `PUT /requests/:id/lock` payload.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProlongedLockWire {
    pub lock_expires_at: DateTime<Utc>,
}

/// Body for `POST /requests` (single or batch element).
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewRequestWire {
    pub url: String,
    #[serde(default)]
    pub unique_key: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub payload: Option<String>,
    #[serde(default)]
    pub headers: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub user_data: Option<serde_json::Value>,
    #[serde(default)]
    pub retry_count: Option<u32>,
    #[serde(default)]
    pub no_retry: Option<bool>,
    #[serde(default)]
    pub error_messages: Option<Vec<String>>,
}

impl From<NewRequestWire> for crawlspace_engine::NewRequest {
    fn from(wire: NewRequestWire) -> Self {
        Self {
            unique_key: wire.unique_key,
            url: wire.url,
            method: wire.method,
            payload: wire.payload,
            headers: wire.headers,
            user_data: wire.user_data,
            retry_count: wire.retry_count,
            no_retry: wire.no_retry,
            error_messages: wire.error_messages,
        }
    }
}

/// Body for `PUT /requests/:id`.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestPatchWire {
    #[serde(default)]
    pub handled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retry_count: Option<u32>,
    #[serde(default)]
    pub error_messages: Option<Vec<String>>,
    #[serde(default)]
    pub user_data: Option<serde_json::Value>,
}

impl From<RequestPatchWire> for crawlspace_engine::RequestPatch {
    fn from(wire: RequestPatchWire) -> Self {
        Self {
            handled_at: wire.handled_at,
            retry_count: wire.retry_count,
            error_messages: wire.error_messages,
            user_data: wire.user_data,
        }
    }
}

// ============================================================================
// Logs
// ============================================================================

/// One fetched log entry.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntryWire {
    pub timestamp: DateTime<Utc>,
    pub level: crawlspace_engine::LogLevel,
    pub message: String,
}

impl From<LogEntry> for LogEntryWire {
    fn from(entry: LogEntry) -> Self {
        Self {
            timestamp: entry.timestamp,
            level: entry.level,
            message: entry.message,
        }
    }
}

/// `GET /logs` payload.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogPageWire {
    pub items: Vec<LogEntryWire>,
    pub total: u64,
    pub offset: u64,
    pub limit: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_wire_serializes_camel_case_with_envelope() {
        let run = Run {
            id: RunId::generate(),
            actor_id: ActorId::generate(),
            principal_id: PrincipalId::generate(),
            status: RunStatus::TimedOut,
            status_message: None,
            created_at: Utc::now(),
            started_at: Some(Utc::now()),
            finished_at: Some(Utc::now()),
            default_dataset_id: DatasetId::generate(),
            default_key_value_store_id: KeyValueStoreId::generate(),
            default_request_queue_id: RequestQueueId::generate(),
            image: "img".into(),
            timeout_secs: 60,
            memory_mbytes: 256,
            exit_code: Some(143),
            stats: crawlspace_engine::RunStats::default(),
        };

        let json = serde_json::to_value(Data::new(RunWire::from(run))).unwrap();
        let data = &json["data"];
        assert_eq!(data["status"], "TIMED-OUT");
        assert_eq!(data["exitCode"], 143);
        assert!(data.get("defaultDatasetId").is_some());
        assert!(data.get("defaultKeyValueStoreId").is_some());
        assert!(data.get("defaultRequestQueueId").is_some());
        assert!(data.get("default_dataset_id").is_none());
    }
}
