//! Domain records persisted in the metadata store.
//!
//! Field names here are snake_case row shapes; the API crate owns the
//! camelCase wire translation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crawlspace_core::{
    ActorId, DatasetId, KeyValueStoreId, PrincipalId, RequestId, RequestQueueId, RunId,
};

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    /// Created, waiting for a dispatcher worker.
    #[serde(rename = "READY")]
    Ready,
    /// Claimed by a worker; a container driver is (or should be) live.
    #[serde(rename = "RUNNING")]
    Running,
    /// Container exited with code 0.
    #[serde(rename = "SUCCEEDED")]
    Succeeded,
    /// Container exited with a non-zero, non-timeout code, or was orphaned.
    #[serde(rename = "FAILED")]
    Failed,
    /// The run exceeded its timeout and was stopped.
    #[serde(rename = "TIMED-OUT")]
    TimedOut,
    /// The run was aborted by a client.
    #[serde(rename = "ABORTED")]
    Aborted,
}

impl RunStatus {
    /// Returns true for statuses that end a run.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::TimedOut | Self::Aborted
        )
    }

    /// Returns true when a status update may move a run from `self` to `next`.
    ///
    /// Resurrection (terminal → RUNNING) is deliberately excluded; it is its
    /// own operation, not a status update.
    #[must_use]
    pub fn allows_update_to(self, next: Self) -> bool {
        match (self, next) {
            (Self::Ready, Self::Running) => true,
            (Self::Running, to) => to.is_terminal(),
            _ => false,
        }
    }

    /// Stable wire name of the status.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ready => "READY",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::TimedOut => "TIMED-OUT",
            Self::Aborted => "ABORTED",
        }
    }

    /// Parses a stable wire name.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "READY" => Some(Self::Ready),
            "RUNNING" => Some(Self::Running),
            "SUCCEEDED" => Some(Self::Succeeded),
            "FAILED" => Some(Self::Failed),
            "TIMED-OUT" => Some(Self::TimedOut),
            "ABORTED" => Some(Self::Aborted),
            _ => None,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Default execution options stored on an actor, merged under per-run
/// overrides at `CreateRun` time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOptions {
    /// Container image reference.
    pub image: String,
    /// Memory cap in megabytes.
    pub memory_mbytes: u32,
    /// Wall-clock timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            image: String::new(),
            memory_mbytes: 1024,
            timeout_secs: 3600,
        }
    }
}

/// A deployable containerized scraping job definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Actor {
    /// Actor identifier.
    pub id: ActorId,
    /// Owning principal.
    pub owner_id: PrincipalId,
    /// Unique name per owner.
    pub name: String,
    /// Optional human title.
    pub title: Option<String>,
    /// Optional description.
    pub description: Option<String>,
    /// Defaults applied to new runs.
    pub default_run_options: RunOptions,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last modification timestamp.
    pub modified_at: DateTime<Utc>,
}

/// Aggregate statistics captured on a run row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    /// Size of the INPUT record in bytes.
    pub input_body_len: u64,
    /// Number of resurrections.
    pub restart_count: u32,
    /// Wall-clock duration, set when the run finishes.
    pub duration_millis: Option<u64>,
}

/// One execution attempt of an actor.
///
/// `actor_id` may dangle after actor deletion; runs are retained for audit.
/// The three storage handles are created at run creation and never
/// reassigned, including across resurrections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    /// Run identifier.
    pub id: RunId,
    /// The actor this run executes.
    pub actor_id: ActorId,
    /// Principal that created the run.
    pub principal_id: PrincipalId,
    /// Lifecycle status.
    pub status: RunStatus,
    /// Optional human-readable status detail.
    pub status_message: Option<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Set when a worker claims the run.
    pub started_at: Option<DateTime<Utc>>,
    /// Set iff the status is terminal.
    pub finished_at: Option<DateTime<Utc>>,
    /// Default dataset handle.
    pub default_dataset_id: DatasetId,
    /// Default key-value store handle.
    pub default_key_value_store_id: KeyValueStoreId,
    /// Default request queue handle.
    pub default_request_queue_id: RequestQueueId,
    /// Container image reference resolved at creation.
    pub image: String,
    /// Wall-clock timeout in seconds.
    pub timeout_secs: u64,
    /// Memory cap in megabytes.
    pub memory_mbytes: u32,
    /// Container exit code, when one was observed.
    pub exit_code: Option<i64>,
    /// Aggregate statistics.
    pub stats: RunStats,
}

/// An ordered append-only sequence of JSON items.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dataset {
    /// Dataset identifier.
    pub id: DatasetId,
    /// Optional unique name.
    pub name: Option<String>,
    /// Owning principal.
    pub owner_id: PrincipalId,
    /// Number of persisted item slots; item indices are `0..item_count`.
    pub item_count: u64,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last modification timestamp.
    pub modified_at: DateTime<Utc>,
}

/// A key → (blob, content-type) map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyValueStore {
    /// Store identifier.
    pub id: KeyValueStoreId,
    /// Optional unique name.
    pub name: Option<String>,
    /// Owning principal.
    pub owner_id: PrincipalId,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last modification timestamp.
    pub modified_at: DateTime<Utc>,
}

/// Bookkeeping row for one key-value record; the body lives in the blob
/// store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvRecordMeta {
    /// Record key.
    pub key: String,
    /// Declared content type of the body.
    pub content_type: String,
    /// Body size in bytes.
    pub size: u64,
}

/// A deduplicated FIFO of web-request descriptors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestQueue {
    /// Queue identifier.
    pub id: RequestQueueId,
    /// Optional unique name.
    pub name: Option<String>,
    /// Owning principal.
    pub owner_id: PrincipalId,
    /// Requests ever inserted (dedup hits excluded).
    pub total_request_count: u64,
    /// Requests marked handled.
    pub handled_request_count: u64,
    /// Invariant: `total_request_count - handled_request_count`.
    pub pending_request_count: u64,
    /// Sticky flag: the queue has ever seen two distinct lock clients.
    pub had_multiple_clients: bool,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last modification timestamp.
    pub modified_at: DateTime<Utc>,
}

/// One element of a request queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedRequest {
    /// Request identifier.
    pub id: RequestId,
    /// Owning queue.
    pub queue_id: RequestQueueId,
    /// Dedup key, unique per queue.
    pub unique_key: String,
    /// Target URL.
    pub url: String,
    /// HTTP method, uppercase.
    pub method: String,
    /// Optional request payload.
    pub payload: Option<String>,
    /// Request headers.
    pub headers: BTreeMap<String, String>,
    /// Opaque client data carried with the request.
    pub user_data: serde_json::Value,
    /// Number of retries so far.
    pub retry_count: u32,
    /// When true, the crawler must not retry this request.
    pub no_retry: bool,
    /// Errors recorded by crawler clients.
    pub error_messages: Vec<String>,
    /// Set when the request was handled; handled requests leave the pending
    /// set.
    pub handled_at: Option<DateTime<Utc>>,
    /// Signed FIFO position; forefront insertions are negative.
    pub order_no: i64,
    /// Best-effort mirror of the coordination-store lease expiry.
    pub locked_until: Option<DateTime<Utc>>,
    /// Best-effort mirror of the lease holder.
    pub locked_by: Option<String>,
}

impl QueuedRequest {
    /// Returns true when the request is still in the pending set.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.handled_at.is_none()
    }
}

/// Caller-supplied shape for inserting a request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewRequest {
    /// Explicit dedup key; derived from the URL when absent.
    pub unique_key: Option<String>,
    /// Target URL.
    pub url: String,
    /// HTTP method; defaults to GET.
    pub method: Option<String>,
    /// Optional request payload.
    pub payload: Option<String>,
    /// Request headers.
    pub headers: Option<BTreeMap<String, String>>,
    /// Opaque client data.
    pub user_data: Option<serde_json::Value>,
    /// Retry count carried over by clients re-adding requests.
    pub retry_count: Option<u32>,
    /// When true, the crawler must not retry this request.
    pub no_retry: Option<bool>,
    /// Errors recorded by crawler clients.
    pub error_messages: Option<Vec<String>>,
}

/// Patch applied by `UpdateRequest`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestPatch {
    /// Marks the request handled; counters update on the null → value edge.
    pub handled_at: Option<DateTime<Utc>>,
    /// New retry count.
    pub retry_count: Option<u32>,
    /// Replacement error messages.
    pub error_messages: Option<Vec<String>>,
    /// Replacement user data.
    pub user_data: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses_are_exactly_the_four() {
        assert!(!RunStatus::Ready.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Succeeded.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::TimedOut.is_terminal());
        assert!(RunStatus::Aborted.is_terminal());
    }

    #[test]
    fn update_transitions_follow_state_machine() {
        assert!(RunStatus::Ready.allows_update_to(RunStatus::Running));
        assert!(RunStatus::Running.allows_update_to(RunStatus::Succeeded));
        assert!(RunStatus::Running.allows_update_to(RunStatus::TimedOut));
        assert!(RunStatus::Running.allows_update_to(RunStatus::Aborted));

        assert!(!RunStatus::Ready.allows_update_to(RunStatus::Succeeded));
        assert!(!RunStatus::Succeeded.allows_update_to(RunStatus::Running));
        assert!(!RunStatus::Running.allows_update_to(RunStatus::Ready));
    }

    #[test]
    fn status_wire_names_roundtrip() {
        for status in [
            RunStatus::Ready,
            RunStatus::Running,
            RunStatus::Succeeded,
            RunStatus::Failed,
            RunStatus::TimedOut,
            RunStatus::Aborted,
        ] {
            assert_eq!(RunStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(
            serde_json::to_string(&RunStatus::TimedOut).unwrap(),
            "\"TIMED-OUT\""
        );
    }
}
