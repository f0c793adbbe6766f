//! Typed access to the relational metadata store.
//!
//! The [`MetaStore`] contract is the only path to metadata rows; every
//! compound mutation (request insert with counter updates, run claim, status
//! transition) is atomic inside a single implementation-level transaction.
//! [`PostgresMetaStore`] is the production backend; [`MemoryMetaStore`]
//! backs tests and single-process deployments.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use crawlspace_core::{ActorId, DatasetId, KeyValueStoreId, PrincipalId, RequestId, RequestQueueId, RunId};

use crate::error::Result;
use crate::model::{
    Actor, Dataset, KeyValueStore, KvRecordMeta, QueuedRequest, RequestQueue, Run, RunStatus,
};

pub use memory::MemoryMetaStore;
pub use postgres::PostgresMetaStore;

/// Result of a conditional run transition.
#[derive(Debug, Clone)]
pub enum TransitionOutcome {
    /// The transition applied; carries the updated run.
    Done(Run),
    /// The run was not in any of the expected states.
    WrongState {
        /// The status observed instead.
        current: RunStatus,
    },
}

/// Result of a request insert.
#[derive(Debug, Clone)]
pub struct RequestInsertOutcome {
    /// The row now present for the unique key (fresh or pre-existing).
    pub request: QueuedRequest,
    /// True when a request with the same unique key already existed.
    pub was_already_present: bool,
}

/// A page of rows plus the total matching count.
#[derive(Debug, Clone)]
pub struct Page<T> {
    /// The page contents.
    pub items: Vec<T>,
    /// Total rows matching the query.
    pub total: u64,
}

/// Metadata store contract.
///
/// Uniqueness errors surface as [`crate::EngineError::Conflict`]; transient
/// connectivity failures as [`crate::EngineError::Dependency`].
#[async_trait]
pub trait MetaStore: Send + Sync + 'static {
    /// Verifies connectivity; used by readiness checks.
    async fn ping(&self) -> Result<()>;

    // ------------------------------------------------------------------
    // Actors
    // ------------------------------------------------------------------

    /// Inserts an actor. Fails with `Conflict` when `(owner, name)` is taken.
    async fn insert_actor(&self, actor: &Actor) -> Result<()>;

    /// Reads an actor by id.
    async fn get_actor(&self, id: &ActorId) -> Result<Option<Actor>>;

    /// Finds an actor by owner and name.
    async fn find_actor_by_name(&self, owner: &PrincipalId, name: &str) -> Result<Option<Actor>>;

    /// Rewrites a mutable actor row (title, description, options, name).
    async fn update_actor(&self, actor: &Actor) -> Result<()>;

    /// Deletes an actor. Runs keep their (now dangling) `actor_id`.
    async fn delete_actor(&self, id: &ActorId) -> Result<bool>;

    /// Lists actors owned by `owner`, newest first.
    async fn list_actors(&self, owner: &PrincipalId, offset: u64, limit: u64)
        -> Result<Page<Actor>>;

    // ------------------------------------------------------------------
    // Runs
    // ------------------------------------------------------------------

    /// Inserts a run row.
    async fn insert_run(&self, run: &Run) -> Result<()>;

    /// Reads a run by id.
    async fn get_run(&self, id: &RunId) -> Result<Option<Run>>;

    /// Lists runs created by `principal`, newest first.
    async fn list_runs(&self, principal: &PrincipalId, offset: u64, limit: u64)
        -> Result<Page<Run>>;

    /// Claims the oldest READY run: atomically sets it RUNNING and stamps
    /// `started_at`.
    ///
    /// This is the at-most-one-worker primitive. The Postgres implementation
    /// uses a skip-locked row read so concurrent workers never observe the
    /// same pending row; alternative backends must preserve that property.
    async fn claim_pending_run(&self) -> Result<Option<Run>>;

    /// Conditionally transitions a run.
    ///
    /// When the current status is in `expected`, sets `to`, the optional
    /// message and exit code, and maintains `finished_at`/`duration_millis`
    /// (set iff `to` is terminal, cleared otherwise) in one atomic step.
    async fn transition_run(
        &self,
        id: &RunId,
        expected: &[RunStatus],
        to: RunStatus,
        status_message: Option<String>,
        exit_code: Option<i64>,
    ) -> Result<TransitionOutcome>;

    /// Resurrects a terminal run: status RUNNING, `finished_at` and
    /// `exit_code` cleared, `started_at` restamped, `restart_count`
    /// incremented. Storage handles are untouched.
    async fn resurrect_run(&self, id: &RunId) -> Result<TransitionOutcome>;

    /// Fails RUNNING rows whose `started_at + timeout_secs + grace` has
    /// passed, marking them `"orphaned"`. Returns the runs transitioned.
    async fn fail_orphaned_runs(&self, grace: Duration) -> Result<Vec<Run>>;

    // ------------------------------------------------------------------
    // Datasets
    // ------------------------------------------------------------------

    /// Inserts a dataset. Fails with `Conflict` on a duplicate name.
    async fn insert_dataset(&self, dataset: &Dataset) -> Result<()>;

    /// Reads a dataset by id.
    async fn get_dataset(&self, id: &DatasetId) -> Result<Option<Dataset>>;

    /// Finds a dataset by owner and name.
    async fn find_dataset_by_name(
        &self,
        owner: &PrincipalId,
        name: &str,
    ) -> Result<Option<Dataset>>;

    /// Deletes a dataset row.
    async fn delete_dataset(&self, id: &DatasetId) -> Result<bool>;

    /// Advances `item_count` by `n` after all item blobs are durable.
    async fn advance_dataset_items(&self, id: &DatasetId, n: u64) -> Result<Dataset>;

    // ------------------------------------------------------------------
    // Key-value stores
    // ------------------------------------------------------------------

    /// Inserts a key-value store. Fails with `Conflict` on a duplicate name.
    async fn insert_kv_store(&self, store: &KeyValueStore) -> Result<()>;

    /// Reads a store by id.
    async fn get_kv_store(&self, id: &KeyValueStoreId) -> Result<Option<KeyValueStore>>;

    /// Finds a store by owner and name.
    async fn find_kv_store_by_name(
        &self,
        owner: &PrincipalId,
        name: &str,
    ) -> Result<Option<KeyValueStore>>;

    /// Deletes a store row.
    async fn delete_kv_store(&self, id: &KeyValueStoreId) -> Result<bool>;

    /// Upserts record bookkeeping (content type, size) for a key.
    async fn upsert_kv_record(&self, store: &KeyValueStoreId, record: &KvRecordMeta) -> Result<()>;

    /// Reads record bookkeeping for a key.
    async fn get_kv_record(
        &self,
        store: &KeyValueStoreId,
        key: &str,
    ) -> Result<Option<KvRecordMeta>>;

    /// Deletes record bookkeeping for a key. Idempotent.
    async fn delete_kv_record(&self, store: &KeyValueStoreId, key: &str) -> Result<()>;

    /// Lists record bookkeeping in lexicographic key order, starting after
    /// `exclusive_start`.
    async fn list_kv_records(
        &self,
        store: &KeyValueStoreId,
        exclusive_start: Option<&str>,
        limit: u64,
    ) -> Result<Vec<KvRecordMeta>>;

    // ------------------------------------------------------------------
    // Request queues
    // ------------------------------------------------------------------

    /// Inserts a queue. Fails with `Conflict` on a duplicate name.
    async fn insert_queue(&self, queue: &RequestQueue) -> Result<()>;

    /// Reads a queue by id.
    async fn get_queue(&self, id: &RequestQueueId) -> Result<Option<RequestQueue>>;

    /// Finds a queue by owner and name.
    async fn find_queue_by_name(
        &self,
        owner: &PrincipalId,
        name: &str,
    ) -> Result<Option<RequestQueue>>;

    /// Deletes a queue row and its requests.
    async fn delete_queue(&self, id: &RequestQueueId) -> Result<bool>;

    /// Records a lock client against the queue; flips the sticky
    /// `had_multiple_clients` flag on the second distinct client. Returns
    /// the flag's value after the update.
    async fn register_queue_client(&self, id: &RequestQueueId, client_key: &str) -> Result<bool>;

    // ------------------------------------------------------------------
    // Requests
    // ------------------------------------------------------------------

    /// Inserts a request, assigning its `order_no` from the queue's
    /// monotonic counter (negated for forefront insertions) and bumping the
    /// queue's total/pending counters, all in one transaction.
    ///
    /// When a row with the same `(queue_id, unique_key)` exists, nothing is
    /// written and the existing row is returned.
    async fn insert_request(
        &self,
        request: &QueuedRequest,
        forefront: bool,
    ) -> Result<RequestInsertOutcome>;

    /// Reads a request by id.
    async fn get_request(&self, id: &RequestId) -> Result<Option<QueuedRequest>>;

    /// Lists unhandled requests in ascending `order_no`, skipping `offset`.
    async fn list_pending_requests(
        &self,
        queue: &RequestQueueId,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<QueuedRequest>>;

    /// Rewrites a request row. When `newly_handled` is set, the owning
    /// queue's handled/pending counters move in the same transaction.
    async fn update_request(&self, request: &QueuedRequest, newly_handled: bool) -> Result<()>;

    /// Writes the best-effort lock mirror columns.
    async fn mirror_request_lock(
        &self,
        id: &RequestId,
        locked_until: Option<DateTime<Utc>>,
        locked_by: Option<&str>,
    ) -> Result<()>;
}
