//! In-memory metadata store.
//!
//! Every operation takes one internal mutex, which is what makes the
//! compound operations (claim, insert-with-counters) atomic here. Backs
//! tests and single-process deployments; state is lost on restart.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crawlspace_core::{ActorId, DatasetId, KeyValueStoreId, PrincipalId, RequestId, RequestQueueId, RunId};

use crate::error::{EngineError, Result};
use crate::model::{
    Actor, Dataset, KeyValueStore, KvRecordMeta, QueuedRequest, RequestQueue, Run, RunStatus,
};

use super::{MetaStore, Page, RequestInsertOutcome, TransitionOutcome};

#[derive(Default)]
struct State {
    actors: HashMap<ActorId, Actor>,
    runs: HashMap<RunId, Run>,
    datasets: HashMap<DatasetId, Dataset>,
    kv_stores: HashMap<KeyValueStoreId, KeyValueStore>,
    kv_records: HashMap<KeyValueStoreId, BTreeMap<String, KvRecordMeta>>,
    queues: HashMap<RequestQueueId, RequestQueue>,
    queue_counters: HashMap<RequestQueueId, i64>,
    queue_first_client: HashMap<RequestQueueId, String>,
    requests: HashMap<RequestId, QueuedRequest>,
    requests_by_key: HashMap<(RequestQueueId, String), RequestId>,
}

/// In-memory [`MetaStore`] implementation.
#[derive(Clone, Default)]
pub struct MemoryMetaStore {
    state: Arc<Mutex<State>>,
}

impl MemoryMetaStore {
    /// Creates a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| EngineError::internal("metadata state poisoned"))
    }
}

impl std::fmt::Debug for MemoryMetaStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryMetaStore").finish_non_exhaustive()
    }
}

fn finish_fields(run: &mut Run, to: RunStatus, now: DateTime<Utc>) {
    run.status = to;
    if to.is_terminal() {
        run.finished_at = Some(now);
        run.stats.duration_millis = run.started_at.map(|started| {
            u64::try_from((now - started).num_milliseconds().max(0)).unwrap_or(0)
        });
    } else {
        run.finished_at = None;
        run.stats.duration_millis = None;
    }
}

#[async_trait]
impl MetaStore for MemoryMetaStore {
    async fn ping(&self) -> Result<()> {
        self.lock().map(|_| ())
    }

    async fn insert_actor(&self, actor: &Actor) -> Result<()> {
        let mut state = self.lock()?;
        let taken = state
            .actors
            .values()
            .any(|a| a.owner_id == actor.owner_id && a.name == actor.name);
        if taken {
            return Err(EngineError::Conflict {
                message: format!("actor name already exists: {}", actor.name),
            });
        }
        state.actors.insert(actor.id.clone(), actor.clone());
        Ok(())
    }

    async fn get_actor(&self, id: &ActorId) -> Result<Option<Actor>> {
        Ok(self.lock()?.actors.get(id).cloned())
    }

    async fn find_actor_by_name(&self, owner: &PrincipalId, name: &str) -> Result<Option<Actor>> {
        Ok(self
            .lock()?
            .actors
            .values()
            .find(|a| a.owner_id == *owner && a.name == name)
            .cloned())
    }

    async fn update_actor(&self, actor: &Actor) -> Result<()> {
        let mut state = self.lock()?;
        let taken = state
            .actors
            .values()
            .any(|a| a.id != actor.id && a.owner_id == actor.owner_id && a.name == actor.name);
        if taken {
            return Err(EngineError::Conflict {
                message: format!("actor name already exists: {}", actor.name),
            });
        }
        match state.actors.get_mut(&actor.id) {
            Some(existing) => {
                *existing = actor.clone();
                Ok(())
            }
            None => Err(EngineError::not_found("actor", &actor.id)),
        }
    }

    async fn delete_actor(&self, id: &ActorId) -> Result<bool> {
        Ok(self.lock()?.actors.remove(id).is_some())
    }

    async fn list_actors(
        &self,
        owner: &PrincipalId,
        offset: u64,
        limit: u64,
    ) -> Result<Page<Actor>> {
        let state = self.lock()?;
        let mut items: Vec<Actor> = state
            .actors
            .values()
            .filter(|a| a.owner_id == *owner)
            .cloned()
            .collect();
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let total = items.len() as u64;
        let items = items
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect();
        Ok(Page { items, total })
    }

    async fn insert_run(&self, run: &Run) -> Result<()> {
        self.lock()?.runs.insert(run.id.clone(), run.clone());
        Ok(())
    }

    async fn get_run(&self, id: &RunId) -> Result<Option<Run>> {
        Ok(self.lock()?.runs.get(id).cloned())
    }

    async fn list_runs(
        &self,
        principal: &PrincipalId,
        offset: u64,
        limit: u64,
    ) -> Result<Page<Run>> {
        let state = self.lock()?;
        let mut items: Vec<Run> = state
            .runs
            .values()
            .filter(|r| r.principal_id == *principal)
            .cloned()
            .collect();
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let total = items.len() as u64;
        let items = items
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect();
        Ok(Page { items, total })
    }

    async fn claim_pending_run(&self) -> Result<Option<Run>> {
        let mut state = self.lock()?;
        let oldest = state
            .runs
            .values()
            .filter(|r| r.status == RunStatus::Ready)
            .min_by_key(|r| r.created_at)
            .map(|r| r.id.clone());
        let Some(id) = oldest else {
            return Ok(None);
        };
        let run = state
            .runs
            .get_mut(&id)
            .ok_or_else(|| EngineError::internal("claimed run vanished"))?;
        run.status = RunStatus::Running;
        run.started_at = Some(Utc::now());
        Ok(Some(run.clone()))
    }

    async fn transition_run(
        &self,
        id: &RunId,
        expected: &[RunStatus],
        to: RunStatus,
        status_message: Option<String>,
        exit_code: Option<i64>,
    ) -> Result<TransitionOutcome> {
        let mut state = self.lock()?;
        let run = state
            .runs
            .get_mut(id)
            .ok_or_else(|| EngineError::not_found("run", id))?;
        if !expected.contains(&run.status) {
            return Ok(TransitionOutcome::WrongState {
                current: run.status,
            });
        }
        finish_fields(run, to, Utc::now());
        if status_message.is_some() {
            run.status_message = status_message;
        }
        if exit_code.is_some() {
            run.exit_code = exit_code;
        }
        Ok(TransitionOutcome::Done(run.clone()))
    }

    async fn resurrect_run(&self, id: &RunId) -> Result<TransitionOutcome> {
        let mut state = self.lock()?;
        let run = state
            .runs
            .get_mut(id)
            .ok_or_else(|| EngineError::not_found("run", id))?;
        if !run.status.is_terminal() {
            return Ok(TransitionOutcome::WrongState {
                current: run.status,
            });
        }
        run.status = RunStatus::Running;
        run.finished_at = None;
        run.exit_code = None;
        run.status_message = None;
        run.started_at = Some(Utc::now());
        run.stats.duration_millis = None;
        run.stats.restart_count += 1;
        Ok(TransitionOutcome::Done(run.clone()))
    }

    async fn fail_orphaned_runs(&self, grace: Duration) -> Result<Vec<Run>> {
        let mut state = self.lock()?;
        let now = Utc::now();
        let grace = chrono::Duration::from_std(grace).unwrap_or_else(|_| chrono::Duration::zero());
        let mut orphaned = Vec::new();
        for run in state.runs.values_mut() {
            if run.status != RunStatus::Running {
                continue;
            }
            let Some(started) = run.started_at else {
                continue;
            };
            let deadline = started
                + chrono::Duration::seconds(i64::try_from(run.timeout_secs).unwrap_or(i64::MAX))
                + grace;
            if deadline < now {
                finish_fields(run, RunStatus::Failed, now);
                run.status_message = Some("orphaned".to_string());
                orphaned.push(run.clone());
            }
        }
        Ok(orphaned)
    }

    async fn insert_dataset(&self, dataset: &Dataset) -> Result<()> {
        let mut state = self.lock()?;
        if let Some(name) = &dataset.name {
            let taken = state
                .datasets
                .values()
                .any(|d| d.owner_id == dataset.owner_id && d.name.as_deref() == Some(name));
            if taken {
                return Err(EngineError::Conflict {
                    message: format!("dataset name already exists: {name}"),
                });
            }
        }
        state.datasets.insert(dataset.id.clone(), dataset.clone());
        Ok(())
    }

    async fn get_dataset(&self, id: &DatasetId) -> Result<Option<Dataset>> {
        Ok(self.lock()?.datasets.get(id).cloned())
    }

    async fn find_dataset_by_name(
        &self,
        owner: &PrincipalId,
        name: &str,
    ) -> Result<Option<Dataset>> {
        Ok(self
            .lock()?
            .datasets
            .values()
            .find(|d| d.owner_id == *owner && d.name.as_deref() == Some(name))
            .cloned())
    }

    async fn delete_dataset(&self, id: &DatasetId) -> Result<bool> {
        Ok(self.lock()?.datasets.remove(id).is_some())
    }

    async fn advance_dataset_items(&self, id: &DatasetId, n: u64) -> Result<Dataset> {
        let mut state = self.lock()?;
        let dataset = state
            .datasets
            .get_mut(id)
            .ok_or_else(|| EngineError::not_found("dataset", id))?;
        dataset.item_count += n;
        dataset.modified_at = Utc::now();
        Ok(dataset.clone())
    }

    async fn insert_kv_store(&self, store: &KeyValueStore) -> Result<()> {
        let mut state = self.lock()?;
        if let Some(name) = &store.name {
            let taken = state
                .kv_stores
                .values()
                .any(|s| s.owner_id == store.owner_id && s.name.as_deref() == Some(name));
            if taken {
                return Err(EngineError::Conflict {
                    message: format!("key-value store name already exists: {name}"),
                });
            }
        }
        state.kv_stores.insert(store.id.clone(), store.clone());
        Ok(())
    }

    async fn get_kv_store(&self, id: &KeyValueStoreId) -> Result<Option<KeyValueStore>> {
        Ok(self.lock()?.kv_stores.get(id).cloned())
    }

    async fn find_kv_store_by_name(
        &self,
        owner: &PrincipalId,
        name: &str,
    ) -> Result<Option<KeyValueStore>> {
        Ok(self
            .lock()?
            .kv_stores
            .values()
            .find(|s| s.owner_id == *owner && s.name.as_deref() == Some(name))
            .cloned())
    }

    async fn delete_kv_store(&self, id: &KeyValueStoreId) -> Result<bool> {
        let mut state = self.lock()?;
        state.kv_records.remove(id);
        Ok(state.kv_stores.remove(id).is_some())
    }

    async fn upsert_kv_record(&self, store: &KeyValueStoreId, record: &KvRecordMeta) -> Result<()> {
        let mut state = self.lock()?;
        state
            .kv_records
            .entry(store.clone())
            .or_default()
            .insert(record.key.clone(), record.clone());
        if let Some(s) = state.kv_stores.get_mut(store) {
            s.modified_at = Utc::now();
        }
        Ok(())
    }

    async fn get_kv_record(
        &self,
        store: &KeyValueStoreId,
        key: &str,
    ) -> Result<Option<KvRecordMeta>> {
        Ok(self
            .lock()?
            .kv_records
            .get(store)
            .and_then(|records| records.get(key).cloned()))
    }

    async fn delete_kv_record(&self, store: &KeyValueStoreId, key: &str) -> Result<()> {
        if let Some(records) = self.lock()?.kv_records.get_mut(store) {
            records.remove(key);
        }
        Ok(())
    }

    async fn list_kv_records(
        &self,
        store: &KeyValueStoreId,
        exclusive_start: Option<&str>,
        limit: u64,
    ) -> Result<Vec<KvRecordMeta>> {
        let state = self.lock()?;
        let Some(records) = state.kv_records.get(store) else {
            return Ok(Vec::new());
        };
        let iter: Box<dyn Iterator<Item = (&String, &KvRecordMeta)> + '_> = match exclusive_start {
            Some(start) => Box::new(
                records
                    .range(start.to_string()..)
                    .filter(move |(k, _)| k.as_str() != start),
            ),
            None => Box::new(records.iter()),
        };
        Ok(iter.take(limit as usize).map(|(_, v)| v.clone()).collect())
    }

    async fn insert_queue(&self, queue: &RequestQueue) -> Result<()> {
        let mut state = self.lock()?;
        if let Some(name) = &queue.name {
            let taken = state
                .queues
                .values()
                .any(|q| q.owner_id == queue.owner_id && q.name.as_deref() == Some(name));
            if taken {
                return Err(EngineError::Conflict {
                    message: format!("request queue name already exists: {name}"),
                });
            }
        }
        state.queues.insert(queue.id.clone(), queue.clone());
        Ok(())
    }

    async fn get_queue(&self, id: &RequestQueueId) -> Result<Option<RequestQueue>> {
        Ok(self.lock()?.queues.get(id).cloned())
    }

    async fn find_queue_by_name(
        &self,
        owner: &PrincipalId,
        name: &str,
    ) -> Result<Option<RequestQueue>> {
        Ok(self
            .lock()?
            .queues
            .values()
            .find(|q| q.owner_id == *owner && q.name.as_deref() == Some(name))
            .cloned())
    }

    async fn delete_queue(&self, id: &RequestQueueId) -> Result<bool> {
        let mut state = self.lock()?;
        state.requests.retain(|_, r| r.queue_id != *id);
        state.requests_by_key.retain(|(queue, _), _| queue != id);
        state.queue_counters.remove(id);
        state.queue_first_client.remove(id);
        Ok(state.queues.remove(id).is_some())
    }

    async fn register_queue_client(&self, id: &RequestQueueId, client_key: &str) -> Result<bool> {
        let mut state = self.lock()?;
        let first = state
            .queue_first_client
            .entry(id.clone())
            .or_insert_with(|| client_key.to_string())
            .clone();
        let queue = state
            .queues
            .get_mut(id)
            .ok_or_else(|| EngineError::not_found("request-queue", id))?;
        if first != client_key {
            queue.had_multiple_clients = true;
        }
        Ok(queue.had_multiple_clients)
    }

    async fn insert_request(
        &self,
        request: &QueuedRequest,
        forefront: bool,
    ) -> Result<RequestInsertOutcome> {
        let mut state = self.lock()?;
        let key = (request.queue_id.clone(), request.unique_key.clone());
        if let Some(existing_id) = state.requests_by_key.get(&key) {
            let existing = state
                .requests
                .get(existing_id)
                .cloned()
                .ok_or_else(|| EngineError::internal("request index out of sync"))?;
            return Ok(RequestInsertOutcome {
                request: existing,
                was_already_present: true,
            });
        }

        if !state.queues.contains_key(&request.queue_id) {
            return Err(EngineError::not_found("request-queue", &request.queue_id));
        }

        let counter = state
            .queue_counters
            .entry(request.queue_id.clone())
            .or_insert(0);
        *counter += 1;
        let order_no = if forefront { -*counter } else { *counter };

        let mut row = request.clone();
        row.order_no = order_no;

        state.requests_by_key.insert(key, row.id.clone());
        state.requests.insert(row.id.clone(), row.clone());

        let queue = state
            .queues
            .get_mut(&request.queue_id)
            .ok_or_else(|| EngineError::internal("queue vanished during insert"))?;
        queue.total_request_count += 1;
        queue.pending_request_count += 1;
        queue.modified_at = Utc::now();

        Ok(RequestInsertOutcome {
            request: row,
            was_already_present: false,
        })
    }

    async fn get_request(&self, id: &RequestId) -> Result<Option<QueuedRequest>> {
        Ok(self.lock()?.requests.get(id).cloned())
    }

    async fn list_pending_requests(
        &self,
        queue: &RequestQueueId,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<QueuedRequest>> {
        let state = self.lock()?;
        let mut pending: Vec<QueuedRequest> = state
            .requests
            .values()
            .filter(|r| r.queue_id == *queue && r.is_pending())
            .cloned()
            .collect();
        pending.sort_by_key(|r| r.order_no);
        Ok(pending
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }

    async fn update_request(&self, request: &QueuedRequest, newly_handled: bool) -> Result<()> {
        let mut state = self.lock()?;
        if !state.requests.contains_key(&request.id) {
            return Err(EngineError::not_found("request", &request.id));
        }
        state.requests.insert(request.id.clone(), request.clone());
        if newly_handled {
            let queue = state
                .queues
                .get_mut(&request.queue_id)
                .ok_or_else(|| EngineError::not_found("request-queue", &request.queue_id))?;
            queue.handled_request_count += 1;
            queue.pending_request_count = queue.pending_request_count.saturating_sub(1);
            queue.modified_at = Utc::now();
        }
        Ok(())
    }

    async fn mirror_request_lock(
        &self,
        id: &RequestId,
        locked_until: Option<DateTime<Utc>>,
        locked_by: Option<&str>,
    ) -> Result<()> {
        let mut state = self.lock()?;
        if let Some(request) = state.requests.get_mut(id) {
            request.locked_until = locked_until;
            request.locked_by = locked_by.map(str::to_string);
        }
        Ok(())
    }
}
