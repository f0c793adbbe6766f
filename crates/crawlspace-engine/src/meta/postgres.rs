//! PostgreSQL metadata store.
//!
//! Uses runtime-checked queries against the schema in `migrations/`. The
//! dispatch claim relies on `FOR UPDATE SKIP LOCKED`, which is what makes
//! concurrent workers never hand out the same pending run.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use std::str::FromStr;
use std::time::Duration;

use crawlspace_core::{ActorId, DatasetId, KeyValueStoreId, PrincipalId, RequestId, RequestQueueId, RunId};

use crate::error::{EngineError, Result};
use crate::model::{
    Actor, Dataset, KeyValueStore, KvRecordMeta, QueuedRequest, RequestQueue, Run, RunOptions,
    RunStats, RunStatus,
};

use super::{MetaStore, Page, RequestInsertOutcome, TransitionOutcome};

/// Embedded schema migrations.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

const RUN_COLUMNS: &str = "id, actor_id, principal_id, status, status_message, created_at, \
     started_at, finished_at, default_dataset_id, default_key_value_store_id, \
     default_request_queue_id, image, timeout_secs, memory_mbytes, exit_code, \
     input_body_len, restart_count, duration_millis";

const REQUEST_COLUMNS: &str = "id, queue_id, unique_key, url, method, payload, headers, user_data, \
     retry_count, no_retry, error_messages, handled_at, order_no, locked_until, locked_by";

const TERMINAL_STATUSES: [&str; 4] = ["SUCCEEDED", "FAILED", "TIMED-OUT", "ABORTED"];

/// PostgreSQL-backed [`MetaStore`] implementation.
#[derive(Clone)]
pub struct PostgresMetaStore {
    pool: PgPool,
}

impl std::fmt::Debug for PostgresMetaStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresMetaStore").finish_non_exhaustive()
    }
}

impl PostgresMetaStore {
    /// Wraps an existing pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connects to `database_url` and applies pending migrations.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(16)
            .connect(database_url)
            .await
            .map_err(map_sqlx)?;
        MIGRATOR
            .run(&pool)
            .await
            .map_err(|e| EngineError::dependency(format!("migrations failed: {e}")))?;
        Ok(Self::new(pool))
    }

    /// Returns the underlying pool.
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn map_sqlx(e: sqlx::Error) -> EngineError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => EngineError::Conflict {
            message: db.message().to_string(),
        },
        _ => EngineError::dependency(e),
    }
}

fn parse_id<T: FromStr>(value: String, what: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| EngineError::internal(format!("corrupt {what} in row: {e}")))
}

fn parse_status(value: &str) -> Result<RunStatus> {
    RunStatus::parse(value)
        .ok_or_else(|| EngineError::internal(format!("corrupt run status in row: {value}")))
}

fn to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn to_u32(value: i32) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

fn actor_from_row(row: &PgRow) -> Result<Actor> {
    Ok(Actor {
        id: parse_id(row.try_get("id").map_err(map_sqlx)?, "actor id")?,
        owner_id: parse_id(row.try_get("owner_id").map_err(map_sqlx)?, "owner id")?,
        name: row.try_get("name").map_err(map_sqlx)?,
        title: row.try_get("title").map_err(map_sqlx)?,
        description: row.try_get("description").map_err(map_sqlx)?,
        default_run_options: RunOptions {
            image: row.try_get("image").map_err(map_sqlx)?,
            memory_mbytes: to_u32(row.try_get("memory_mbytes").map_err(map_sqlx)?),
            timeout_secs: to_u64(row.try_get("timeout_secs").map_err(map_sqlx)?),
        },
        created_at: row.try_get("created_at").map_err(map_sqlx)?,
        modified_at: row.try_get("modified_at").map_err(map_sqlx)?,
    })
}

fn run_from_row(row: &PgRow) -> Result<Run> {
    let status: String = row.try_get("status").map_err(map_sqlx)?;
    let duration: Option<i64> = row.try_get("duration_millis").map_err(map_sqlx)?;
    Ok(Run {
        id: parse_id(row.try_get("id").map_err(map_sqlx)?, "run id")?,
        actor_id: parse_id(row.try_get("actor_id").map_err(map_sqlx)?, "actor id")?,
        principal_id: parse_id(
            row.try_get("principal_id").map_err(map_sqlx)?,
            "principal id",
        )?,
        status: parse_status(&status)?,
        status_message: row.try_get("status_message").map_err(map_sqlx)?,
        created_at: row.try_get("created_at").map_err(map_sqlx)?,
        started_at: row.try_get("started_at").map_err(map_sqlx)?,
        finished_at: row.try_get("finished_at").map_err(map_sqlx)?,
        default_dataset_id: parse_id(
            row.try_get("default_dataset_id").map_err(map_sqlx)?,
            "dataset id",
        )?,
        default_key_value_store_id: parse_id(
            row.try_get("default_key_value_store_id").map_err(map_sqlx)?,
            "key-value store id",
        )?,
        default_request_queue_id: parse_id(
            row.try_get("default_request_queue_id").map_err(map_sqlx)?,
            "request queue id",
        )?,
        image: row.try_get("image").map_err(map_sqlx)?,
        timeout_secs: to_u64(row.try_get("timeout_secs").map_err(map_sqlx)?),
        memory_mbytes: to_u32(row.try_get("memory_mbytes").map_err(map_sqlx)?),
        exit_code: row.try_get("exit_code").map_err(map_sqlx)?,
        stats: RunStats {
            input_body_len: to_u64(row.try_get("input_body_len").map_err(map_sqlx)?),
            restart_count: to_u32(row.try_get("restart_count").map_err(map_sqlx)?),
            duration_millis: duration.map(to_u64),
        },
    })
}

fn dataset_from_row(row: &PgRow) -> Result<Dataset> {
    Ok(Dataset {
        id: parse_id(row.try_get("id").map_err(map_sqlx)?, "dataset id")?,
        name: row.try_get("name").map_err(map_sqlx)?,
        owner_id: parse_id(row.try_get("owner_id").map_err(map_sqlx)?, "owner id")?,
        item_count: to_u64(row.try_get("item_count").map_err(map_sqlx)?),
        created_at: row.try_get("created_at").map_err(map_sqlx)?,
        modified_at: row.try_get("modified_at").map_err(map_sqlx)?,
    })
}

fn kv_store_from_row(row: &PgRow) -> Result<KeyValueStore> {
    Ok(KeyValueStore {
        id: parse_id(row.try_get("id").map_err(map_sqlx)?, "key-value store id")?,
        name: row.try_get("name").map_err(map_sqlx)?,
        owner_id: parse_id(row.try_get("owner_id").map_err(map_sqlx)?, "owner id")?,
        created_at: row.try_get("created_at").map_err(map_sqlx)?,
        modified_at: row.try_get("modified_at").map_err(map_sqlx)?,
    })
}

fn queue_from_row(row: &PgRow) -> Result<RequestQueue> {
    Ok(RequestQueue {
        id: parse_id(row.try_get("id").map_err(map_sqlx)?, "request queue id")?,
        name: row.try_get("name").map_err(map_sqlx)?,
        owner_id: parse_id(row.try_get("owner_id").map_err(map_sqlx)?, "owner id")?,
        total_request_count: to_u64(row.try_get("total_request_count").map_err(map_sqlx)?),
        handled_request_count: to_u64(row.try_get("handled_request_count").map_err(map_sqlx)?),
        pending_request_count: to_u64(row.try_get("pending_request_count").map_err(map_sqlx)?),
        had_multiple_clients: row.try_get("had_multiple_clients").map_err(map_sqlx)?,
        created_at: row.try_get("created_at").map_err(map_sqlx)?,
        modified_at: row.try_get("modified_at").map_err(map_sqlx)?,
    })
}

fn request_from_row(row: &PgRow) -> Result<QueuedRequest> {
    let headers: serde_json::Value = row.try_get("headers").map_err(map_sqlx)?;
    let error_messages: serde_json::Value = row.try_get("error_messages").map_err(map_sqlx)?;
    Ok(QueuedRequest {
        id: parse_id(row.try_get("id").map_err(map_sqlx)?, "request id")?,
        queue_id: parse_id(row.try_get("queue_id").map_err(map_sqlx)?, "queue id")?,
        unique_key: row.try_get("unique_key").map_err(map_sqlx)?,
        url: row.try_get("url").map_err(map_sqlx)?,
        method: row.try_get("method").map_err(map_sqlx)?,
        payload: row.try_get("payload").map_err(map_sqlx)?,
        headers: serde_json::from_value(headers)
            .map_err(|e| EngineError::internal(format!("corrupt request headers: {e}")))?,
        user_data: row.try_get("user_data").map_err(map_sqlx)?,
        retry_count: to_u32(row.try_get("retry_count").map_err(map_sqlx)?),
        no_retry: row.try_get("no_retry").map_err(map_sqlx)?,
        error_messages: serde_json::from_value(error_messages)
            .map_err(|e| EngineError::internal(format!("corrupt error messages: {e}")))?,
        handled_at: row.try_get("handled_at").map_err(map_sqlx)?,
        order_no: row.try_get("order_no").map_err(map_sqlx)?,
        locked_until: row.try_get("locked_until").map_err(map_sqlx)?,
        locked_by: row.try_get("locked_by").map_err(map_sqlx)?,
    })
}

#[async_trait]
impl MetaStore for PostgresMetaStore {
    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }

    async fn insert_actor(&self, actor: &Actor) -> Result<()> {
        sqlx::query(
            "INSERT INTO actors (id, owner_id, name, title, description, image, memory_mbytes, \
             timeout_secs, created_at, modified_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(actor.id.as_str())
        .bind(actor.owner_id.as_str())
        .bind(&actor.name)
        .bind(&actor.title)
        .bind(&actor.description)
        .bind(&actor.default_run_options.image)
        .bind(i32::try_from(actor.default_run_options.memory_mbytes).unwrap_or(i32::MAX))
        .bind(i64::try_from(actor.default_run_options.timeout_secs).unwrap_or(i64::MAX))
        .bind(actor.created_at)
        .bind(actor.modified_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn get_actor(&self, id: &ActorId) -> Result<Option<Actor>> {
        let row = sqlx::query("SELECT * FROM actors WHERE id = $1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;
        row.as_ref().map(actor_from_row).transpose()
    }

    async fn find_actor_by_name(&self, owner: &PrincipalId, name: &str) -> Result<Option<Actor>> {
        let row = sqlx::query("SELECT * FROM actors WHERE owner_id = $1 AND name = $2")
            .bind(owner.as_str())
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;
        row.as_ref().map(actor_from_row).transpose()
    }

    async fn update_actor(&self, actor: &Actor) -> Result<()> {
        let result = sqlx::query(
            "UPDATE actors SET name = $2, title = $3, description = $4, image = $5, \
             memory_mbytes = $6, timeout_secs = $7, modified_at = NOW() WHERE id = $1",
        )
        .bind(actor.id.as_str())
        .bind(&actor.name)
        .bind(&actor.title)
        .bind(&actor.description)
        .bind(&actor.default_run_options.image)
        .bind(i32::try_from(actor.default_run_options.memory_mbytes).unwrap_or(i32::MAX))
        .bind(i64::try_from(actor.default_run_options.timeout_secs).unwrap_or(i64::MAX))
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        if result.rows_affected() == 0 {
            return Err(EngineError::not_found("actor", &actor.id));
        }
        Ok(())
    }

    async fn delete_actor(&self, id: &ActorId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM actors WHERE id = $1")
            .bind(id.as_str())
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_actors(
        &self,
        owner: &PrincipalId,
        offset: u64,
        limit: u64,
    ) -> Result<Page<Actor>> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM actors WHERE owner_id = $1")
            .bind(owner.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx)?;
        let rows = sqlx::query(
            "SELECT * FROM actors WHERE owner_id = $1 ORDER BY created_at DESC \
             OFFSET $2 LIMIT $3",
        )
        .bind(owner.as_str())
        .bind(i64::try_from(offset).unwrap_or(i64::MAX))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(Page {
            items: rows.iter().map(actor_from_row).collect::<Result<_>>()?,
            total: to_u64(total),
        })
    }

    async fn insert_run(&self, run: &Run) -> Result<()> {
        sqlx::query(
            "INSERT INTO runs (id, actor_id, principal_id, status, status_message, created_at, \
             started_at, finished_at, default_dataset_id, default_key_value_store_id, \
             default_request_queue_id, image, timeout_secs, memory_mbytes, exit_code, \
             input_body_len, restart_count, duration_millis) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)",
        )
        .bind(run.id.as_str())
        .bind(run.actor_id.as_str())
        .bind(run.principal_id.as_str())
        .bind(run.status.as_str())
        .bind(&run.status_message)
        .bind(run.created_at)
        .bind(run.started_at)
        .bind(run.finished_at)
        .bind(run.default_dataset_id.as_str())
        .bind(run.default_key_value_store_id.as_str())
        .bind(run.default_request_queue_id.as_str())
        .bind(&run.image)
        .bind(i64::try_from(run.timeout_secs).unwrap_or(i64::MAX))
        .bind(i32::try_from(run.memory_mbytes).unwrap_or(i32::MAX))
        .bind(run.exit_code)
        .bind(i64::try_from(run.stats.input_body_len).unwrap_or(i64::MAX))
        .bind(i32::try_from(run.stats.restart_count).unwrap_or(i32::MAX))
        .bind(run.stats.duration_millis.map(|d| i64::try_from(d).unwrap_or(i64::MAX)))
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn get_run(&self, id: &RunId) -> Result<Option<Run>> {
        let row = sqlx::query(&format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = $1"))
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn list_runs(
        &self,
        principal: &PrincipalId,
        offset: u64,
        limit: u64,
    ) -> Result<Page<Run>> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM runs WHERE principal_id = $1")
            .bind(principal.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx)?;
        let rows = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM runs WHERE principal_id = $1 \
             ORDER BY created_at DESC OFFSET $2 LIMIT $3"
        ))
        .bind(principal.as_str())
        .bind(i64::try_from(offset).unwrap_or(i64::MAX))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(Page {
            items: rows.iter().map(run_from_row).collect::<Result<_>>()?,
            total: to_u64(total),
        })
    }

    async fn claim_pending_run(&self) -> Result<Option<Run>> {
        // The skip-locked sub-select guarantees at most one worker sees each
        // READY row even when many workers race the claim.
        let row = sqlx::query(&format!(
            "UPDATE runs SET status = 'RUNNING', started_at = NOW() \
             WHERE id = ( \
                 SELECT id FROM runs WHERE status = 'READY' \
                 ORDER BY created_at LIMIT 1 FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING {RUN_COLUMNS}"
        ))
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn transition_run(
        &self,
        id: &RunId,
        expected: &[RunStatus],
        to: RunStatus,
        status_message: Option<String>,
        exit_code: Option<i64>,
    ) -> Result<TransitionOutcome> {
        let expected: Vec<String> = expected.iter().map(|s| s.as_str().to_string()).collect();
        let terminal = to.is_terminal();
        let row = sqlx::query(&format!(
            "UPDATE runs SET status = $2, \
             status_message = COALESCE($3, status_message), \
             exit_code = COALESCE($4, exit_code), \
             finished_at = CASE WHEN $5 THEN NOW() ELSE NULL END, \
             duration_millis = CASE WHEN $5 THEN \
                 (EXTRACT(EPOCH FROM (NOW() - started_at)) * 1000)::BIGINT ELSE NULL END \
             WHERE id = $1 AND status = ANY($6) \
             RETURNING {RUN_COLUMNS}"
        ))
        .bind(id.as_str())
        .bind(to.as_str())
        .bind(status_message)
        .bind(exit_code)
        .bind(terminal)
        .bind(&expected)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;

        if let Some(row) = row {
            return Ok(TransitionOutcome::Done(run_from_row(&row)?));
        }
        let current: Option<String> = sqlx::query_scalar("SELECT status FROM runs WHERE id = $1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;
        match current {
            Some(status) => Ok(TransitionOutcome::WrongState {
                current: parse_status(&status)?,
            }),
            None => Err(EngineError::not_found("run", id)),
        }
    }

    async fn resurrect_run(&self, id: &RunId) -> Result<TransitionOutcome> {
        let row = sqlx::query(&format!(
            "UPDATE runs SET status = 'RUNNING', finished_at = NULL, exit_code = NULL, \
             status_message = NULL, started_at = NOW(), duration_millis = NULL, \
             restart_count = restart_count + 1 \
             WHERE id = $1 AND status = ANY($2) \
             RETURNING {RUN_COLUMNS}"
        ))
        .bind(id.as_str())
        .bind(
            TERMINAL_STATUSES
                .iter()
                .map(|s| (*s).to_string())
                .collect::<Vec<String>>(),
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;

        if let Some(row) = row {
            return Ok(TransitionOutcome::Done(run_from_row(&row)?));
        }
        let current: Option<String> = sqlx::query_scalar("SELECT status FROM runs WHERE id = $1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;
        match current {
            Some(status) => Ok(TransitionOutcome::WrongState {
                current: parse_status(&status)?,
            }),
            None => Err(EngineError::not_found("run", id)),
        }
    }

    async fn fail_orphaned_runs(&self, grace: Duration) -> Result<Vec<Run>> {
        let rows = sqlx::query(&format!(
            "UPDATE runs SET status = 'FAILED', status_message = 'orphaned', \
             finished_at = NOW(), \
             duration_millis = (EXTRACT(EPOCH FROM (NOW() - started_at)) * 1000)::BIGINT \
             WHERE status = 'RUNNING' AND started_at IS NOT NULL \
               AND started_at + make_interval(secs => (timeout_secs + $1)::double precision) < NOW() \
             RETURNING {RUN_COLUMNS}"
        ))
        .bind(i64::try_from(grace.as_secs()).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;
        rows.iter().map(run_from_row).collect()
    }

    async fn insert_dataset(&self, dataset: &Dataset) -> Result<()> {
        sqlx::query(
            "INSERT INTO datasets (id, name, owner_id, item_count, created_at, modified_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(dataset.id.as_str())
        .bind(&dataset.name)
        .bind(dataset.owner_id.as_str())
        .bind(i64::try_from(dataset.item_count).unwrap_or(0))
        .bind(dataset.created_at)
        .bind(dataset.modified_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn get_dataset(&self, id: &DatasetId) -> Result<Option<Dataset>> {
        let row = sqlx::query("SELECT * FROM datasets WHERE id = $1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;
        row.as_ref().map(dataset_from_row).transpose()
    }

    async fn find_dataset_by_name(
        &self,
        owner: &PrincipalId,
        name: &str,
    ) -> Result<Option<Dataset>> {
        let row = sqlx::query("SELECT * FROM datasets WHERE owner_id = $1 AND name = $2")
            .bind(owner.as_str())
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;
        row.as_ref().map(dataset_from_row).transpose()
    }

    async fn delete_dataset(&self, id: &DatasetId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM datasets WHERE id = $1")
            .bind(id.as_str())
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(result.rows_affected() > 0)
    }

    async fn advance_dataset_items(&self, id: &DatasetId, n: u64) -> Result<Dataset> {
        let row = sqlx::query(
            "UPDATE datasets SET item_count = item_count + $2, modified_at = NOW() \
             WHERE id = $1 RETURNING *",
        )
        .bind(id.as_str())
        .bind(i64::try_from(n).unwrap_or(0))
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;
        match row {
            Some(row) => dataset_from_row(&row),
            None => Err(EngineError::not_found("dataset", id)),
        }
    }

    async fn insert_kv_store(&self, store: &KeyValueStore) -> Result<()> {
        sqlx::query(
            "INSERT INTO key_value_stores (id, name, owner_id, created_at, modified_at) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(store.id.as_str())
        .bind(&store.name)
        .bind(store.owner_id.as_str())
        .bind(store.created_at)
        .bind(store.modified_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn get_kv_store(&self, id: &KeyValueStoreId) -> Result<Option<KeyValueStore>> {
        let row = sqlx::query("SELECT * FROM key_value_stores WHERE id = $1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;
        row.as_ref().map(kv_store_from_row).transpose()
    }

    async fn find_kv_store_by_name(
        &self,
        owner: &PrincipalId,
        name: &str,
    ) -> Result<Option<KeyValueStore>> {
        let row = sqlx::query("SELECT * FROM key_value_stores WHERE owner_id = $1 AND name = $2")
            .bind(owner.as_str())
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;
        row.as_ref().map(kv_store_from_row).transpose()
    }

    async fn delete_kv_store(&self, id: &KeyValueStoreId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM key_value_stores WHERE id = $1")
            .bind(id.as_str())
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(result.rows_affected() > 0)
    }

    async fn upsert_kv_record(&self, store: &KeyValueStoreId, record: &KvRecordMeta) -> Result<()> {
        sqlx::query(
            "INSERT INTO kv_records (store_id, key, content_type, size) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (store_id, key) DO UPDATE \
             SET content_type = EXCLUDED.content_type, size = EXCLUDED.size",
        )
        .bind(store.as_str())
        .bind(&record.key)
        .bind(&record.content_type)
        .bind(i64::try_from(record.size).unwrap_or(i64::MAX))
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        sqlx::query("UPDATE key_value_stores SET modified_at = NOW() WHERE id = $1")
            .bind(store.as_str())
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }

    async fn get_kv_record(
        &self,
        store: &KeyValueStoreId,
        key: &str,
    ) -> Result<Option<KvRecordMeta>> {
        let row = sqlx::query(
            "SELECT key, content_type, size FROM kv_records WHERE store_id = $1 AND key = $2",
        )
        .bind(store.as_str())
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;
        row.map(|row| {
            Ok(KvRecordMeta {
                key: row.try_get("key").map_err(map_sqlx)?,
                content_type: row.try_get("content_type").map_err(map_sqlx)?,
                size: to_u64(row.try_get("size").map_err(map_sqlx)?),
            })
        })
        .transpose()
    }

    async fn delete_kv_record(&self, store: &KeyValueStoreId, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM kv_records WHERE store_id = $1 AND key = $2")
            .bind(store.as_str())
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }

    async fn list_kv_records(
        &self,
        store: &KeyValueStoreId,
        exclusive_start: Option<&str>,
        limit: u64,
    ) -> Result<Vec<KvRecordMeta>> {
        let rows = sqlx::query(
            "SELECT key, content_type, size FROM kv_records \
             WHERE store_id = $1 AND ($2::TEXT IS NULL OR key > $2) \
             ORDER BY key LIMIT $3",
        )
        .bind(store.as_str())
        .bind(exclusive_start)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;
        rows.into_iter()
            .map(|row| {
                Ok(KvRecordMeta {
                    key: row.try_get("key").map_err(map_sqlx)?,
                    content_type: row.try_get("content_type").map_err(map_sqlx)?,
                    size: to_u64(row.try_get("size").map_err(map_sqlx)?),
                })
            })
            .collect()
    }

    async fn insert_queue(&self, queue: &RequestQueue) -> Result<()> {
        sqlx::query(
            "INSERT INTO request_queues (id, name, owner_id, total_request_count, \
             handled_request_count, pending_request_count, had_multiple_clients, \
             created_at, modified_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(queue.id.as_str())
        .bind(&queue.name)
        .bind(queue.owner_id.as_str())
        .bind(i64::try_from(queue.total_request_count).unwrap_or(0))
        .bind(i64::try_from(queue.handled_request_count).unwrap_or(0))
        .bind(i64::try_from(queue.pending_request_count).unwrap_or(0))
        .bind(queue.had_multiple_clients)
        .bind(queue.created_at)
        .bind(queue.modified_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn get_queue(&self, id: &RequestQueueId) -> Result<Option<RequestQueue>> {
        let row = sqlx::query("SELECT * FROM request_queues WHERE id = $1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;
        row.as_ref().map(queue_from_row).transpose()
    }

    async fn find_queue_by_name(
        &self,
        owner: &PrincipalId,
        name: &str,
    ) -> Result<Option<RequestQueue>> {
        let row = sqlx::query("SELECT * FROM request_queues WHERE owner_id = $1 AND name = $2")
            .bind(owner.as_str())
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;
        row.as_ref().map(queue_from_row).transpose()
    }

    async fn delete_queue(&self, id: &RequestQueueId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM request_queues WHERE id = $1")
            .bind(id.as_str())
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(result.rows_affected() > 0)
    }

    async fn register_queue_client(&self, id: &RequestQueueId, client_key: &str) -> Result<bool> {
        // Column references in SET read the pre-update row, so both
        // expressions see the same first_client_key.
        let flag: Option<bool> = sqlx::query_scalar(
            "UPDATE request_queues SET \
             first_client_key = COALESCE(first_client_key, $2), \
             had_multiple_clients = had_multiple_clients \
                 OR (first_client_key IS NOT NULL AND first_client_key <> $2) \
             WHERE id = $1 RETURNING had_multiple_clients",
        )
        .bind(id.as_str())
        .bind(client_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;
        flag.ok_or_else(|| EngineError::not_found("request-queue", id))
    }

    async fn insert_request(
        &self,
        request: &QueuedRequest,
        forefront: bool,
    ) -> Result<RequestInsertOutcome> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;

        let counter: Option<i64> = sqlx::query_scalar(
            "UPDATE request_queues SET order_counter = order_counter + 1, \
             total_request_count = total_request_count + 1, \
             pending_request_count = pending_request_count + 1, \
             modified_at = NOW() \
             WHERE id = $1 RETURNING order_counter",
        )
        .bind(request.queue_id.as_str())
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_sqlx)?;
        let Some(counter) = counter else {
            return Err(EngineError::not_found("request-queue", &request.queue_id));
        };
        let order_no = if forefront { -counter } else { counter };

        let headers = serde_json::to_value(&request.headers)
            .map_err(|e| EngineError::internal(format!("encode headers: {e}")))?;
        let error_messages = serde_json::to_value(&request.error_messages)
            .map_err(|e| EngineError::internal(format!("encode error messages: {e}")))?;

        let inserted = sqlx::query(&format!(
            "INSERT INTO requests (id, queue_id, unique_key, url, method, payload, headers, \
             user_data, retry_count, no_retry, error_messages, handled_at, order_no, \
             locked_until, locked_by) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, NULL, NULL) \
             ON CONFLICT (queue_id, unique_key) DO NOTHING \
             RETURNING {REQUEST_COLUMNS}"
        ))
        .bind(request.id.as_str())
        .bind(request.queue_id.as_str())
        .bind(&request.unique_key)
        .bind(&request.url)
        .bind(&request.method)
        .bind(&request.payload)
        .bind(headers)
        .bind(&request.user_data)
        .bind(i32::try_from(request.retry_count).unwrap_or(i32::MAX))
        .bind(request.no_retry)
        .bind(error_messages)
        .bind(request.handled_at)
        .bind(order_no)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_sqlx)?;

        match inserted {
            Some(row) => {
                let request = request_from_row(&row)?;
                tx.commit().await.map_err(map_sqlx)?;
                Ok(RequestInsertOutcome {
                    request,
                    was_already_present: false,
                })
            }
            None => {
                // Dedup hit: discard the counter bumps and return the row
                // that already owns the unique key.
                tx.rollback().await.map_err(map_sqlx)?;
                let row = sqlx::query(&format!(
                    "SELECT {REQUEST_COLUMNS} FROM requests \
                     WHERE queue_id = $1 AND unique_key = $2"
                ))
                .bind(request.queue_id.as_str())
                .bind(&request.unique_key)
                .fetch_optional(&self.pool)
                .await
                .map_err(map_sqlx)?;
                let row =
                    row.ok_or_else(|| EngineError::internal("dedup hit but row disappeared"))?;
                Ok(RequestInsertOutcome {
                    request: request_from_row(&row)?,
                    was_already_present: true,
                })
            }
        }
    }

    async fn get_request(&self, id: &RequestId) -> Result<Option<QueuedRequest>> {
        let row = sqlx::query(&format!(
            "SELECT {REQUEST_COLUMNS} FROM requests WHERE id = $1"
        ))
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;
        row.as_ref().map(request_from_row).transpose()
    }

    async fn list_pending_requests(
        &self,
        queue: &RequestQueueId,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<QueuedRequest>> {
        let rows = sqlx::query(&format!(
            "SELECT {REQUEST_COLUMNS} FROM requests \
             WHERE queue_id = $1 AND handled_at IS NULL \
             ORDER BY order_no OFFSET $2 LIMIT $3"
        ))
        .bind(queue.as_str())
        .bind(i64::try_from(offset).unwrap_or(i64::MAX))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;
        rows.iter().map(request_from_row).collect()
    }

    async fn update_request(&self, request: &QueuedRequest, newly_handled: bool) -> Result<()> {
        let headers = serde_json::to_value(&request.headers)
            .map_err(|e| EngineError::internal(format!("encode headers: {e}")))?;
        let error_messages = serde_json::to_value(&request.error_messages)
            .map_err(|e| EngineError::internal(format!("encode error messages: {e}")))?;

        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;
        let result = sqlx::query(
            "UPDATE requests SET url = $2, method = $3, payload = $4, headers = $5, \
             user_data = $6, retry_count = $7, no_retry = $8, error_messages = $9, \
             handled_at = $10, locked_until = $11, locked_by = $12 \
             WHERE id = $1",
        )
        .bind(request.id.as_str())
        .bind(&request.url)
        .bind(&request.method)
        .bind(&request.payload)
        .bind(headers)
        .bind(&request.user_data)
        .bind(i32::try_from(request.retry_count).unwrap_or(i32::MAX))
        .bind(request.no_retry)
        .bind(error_messages)
        .bind(request.handled_at)
        .bind(request.locked_until)
        .bind(&request.locked_by)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx)?;
        if result.rows_affected() == 0 {
            return Err(EngineError::not_found("request", &request.id));
        }
        if newly_handled {
            sqlx::query(
                "UPDATE request_queues SET \
                 handled_request_count = handled_request_count + 1, \
                 pending_request_count = GREATEST(pending_request_count - 1, 0), \
                 modified_at = NOW() WHERE id = $1",
            )
            .bind(request.queue_id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;
        }
        tx.commit().await.map_err(map_sqlx)?;
        Ok(())
    }

    async fn mirror_request_lock(
        &self,
        id: &RequestId,
        locked_until: Option<DateTime<Utc>>,
        locked_by: Option<&str>,
    ) -> Result<()> {
        sqlx::query("UPDATE requests SET locked_until = $2, locked_by = $3 WHERE id = $1")
            .bind(id.as_str())
            .bind(locked_until)
            .bind(locked_by)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }
}
