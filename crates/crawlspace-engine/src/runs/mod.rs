//! Run lifecycle orchestration.
//!
//! [`RunService`] owns the public run operations (create, abort, resurrect,
//! trusted status updates). The dispatcher/worker pool, the container
//! driver, and the orphan janitor live in the submodules.

pub mod dispatcher;
pub(crate) mod driver;
pub mod janitor;

use bytes::Bytes;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

use crawlspace_core::{ActorId, CoordStore, Principal, PrincipalId, RunId};

use crate::dataset::DatasetService;
use crate::error::{EngineError, Result};
use crate::kv::KeyValueService;
use crate::meta::{MetaStore, Page, TransitionOutcome};
use crate::model::{Run, RunStats, RunStatus};
use crate::queue::RequestQueueService;
use crate::util::random_token;

pub use dispatcher::{Orchestrator, OrchestratorConfig, OrchestratorHandle};

/// Channel announcing freshly created runs to dispatcher workers.
pub const RUN_NEW_CHANNEL: &str = "run:new";

/// Channel announcing resurrected runs, which bypass the claim loop.
pub const RUN_RESURRECTED_CHANNEL: &str = "run:resurrected";

/// Key-value record holding a run's input.
pub const INPUT_KEY: &str = "INPUT";

/// Extra lifetime a run token keeps beyond the run's timeout.
const RUN_TOKEN_TTL_MARGIN: Duration = Duration::from_secs(3600);

/// Caller-supplied options for `create_run`.
#[derive(Debug, Clone, Default)]
pub struct CreateRunParams {
    /// Actor input, written as the `INPUT` record of the run's store.
    pub input: Option<serde_json::Value>,
    /// Timeout override in seconds.
    pub timeout_secs: Option<u64>,
    /// Memory override in megabytes.
    pub memory_mbytes: Option<u32>,
}

/// Run lifecycle service.
#[derive(Clone)]
pub struct RunService {
    meta: Arc<dyn MetaStore>,
    coord: Arc<dyn CoordStore>,
    datasets: DatasetService,
    kv: KeyValueService,
    queues: RequestQueueService,
    public_base_url: String,
    storage_root: String,
}

impl std::fmt::Debug for RunService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunService").finish_non_exhaustive()
    }
}

impl RunService {
    /// Creates the service over its collaborators.
    #[must_use]
    pub fn new(
        meta: Arc<dyn MetaStore>,
        coord: Arc<dyn CoordStore>,
        datasets: DatasetService,
        kv: KeyValueService,
        queues: RequestQueueService,
        public_base_url: String,
        storage_root: String,
    ) -> Self {
        Self {
            meta,
            coord,
            datasets,
            kv,
            queues,
            public_base_url,
            storage_root,
        }
    }

    /// Creates a run in `READY`: three fresh storage handles, the `INPUT`
    /// record, the run row, a run token, and a `run:new` notification.
    pub async fn create_run(
        &self,
        principal: &Principal,
        actor_id: &ActorId,
        params: CreateRunParams,
    ) -> Result<Run> {
        let actor = self
            .meta
            .get_actor(actor_id)
            .await?
            .ok_or_else(|| EngineError::not_found("actor", actor_id))?;

        let dataset = self.datasets.create(&principal.id, None).await?;
        let kv_store = self.kv.create(&principal.id, None).await?;
        let queue = self.queues.create(&principal.id, None).await?;

        let mut input_body_len = 0u64;
        if let Some(input) = &params.input {
            let body = serde_json::to_vec(input)
                .map_err(|e| EngineError::internal(format!("encode run input: {e}")))?;
            input_body_len = body.len() as u64;
            self.kv
                .put(&kv_store.id, INPUT_KEY, Bytes::from(body), "application/json")
                .await?;
        }

        let run = Run {
            id: RunId::generate(),
            actor_id: actor.id.clone(),
            principal_id: principal.id.clone(),
            status: RunStatus::Ready,
            status_message: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            default_dataset_id: dataset.id,
            default_key_value_store_id: kv_store.id,
            default_request_queue_id: queue.id,
            image: actor.default_run_options.image.clone(),
            timeout_secs: params
                .timeout_secs
                .unwrap_or(actor.default_run_options.timeout_secs),
            memory_mbytes: params
                .memory_mbytes
                .unwrap_or(actor.default_run_options.memory_mbytes),
            exit_code: None,
            stats: RunStats {
                input_body_len,
                restart_count: 0,
                duration_millis: None,
            },
        };
        self.meta.insert_run(&run).await?;
        self.issue_run_token(&run).await?;

        self.coord
            .publish(RUN_NEW_CHANNEL, Bytes::from(run.id.to_string()))
            .await?;
        tracing::info!(run_id = %run.id, actor_id = %actor.id, "run created");
        Ok(run)
    }

    /// Reads a run by id.
    pub async fn get(&self, id: &RunId) -> Result<Run> {
        self.meta
            .get_run(id)
            .await?
            .ok_or_else(|| EngineError::not_found("run", id))
    }

    /// Lists runs created by `principal`, newest first.
    pub async fn list(
        &self,
        principal: &PrincipalId,
        offset: u64,
        limit: u64,
    ) -> Result<Page<Run>> {
        self.meta.list_runs(principal, offset, limit).await
    }

    /// Aborts a running run. The live driver observes the status flip on its
    /// next check and stops the container.
    pub async fn abort_run(&self, id: &RunId) -> Result<Run> {
        match self
            .meta
            .transition_run(
                id,
                &[RunStatus::Running],
                RunStatus::Aborted,
                Some("Aborted by client".to_string()),
                None,
            )
            .await?
        {
            TransitionOutcome::Done(run) => {
                tracing::info!(run_id = %id, "run aborted");
                Ok(run)
            }
            TransitionOutcome::WrongState { current } => Err(EngineError::invalid_state(format!(
                "run is {current}; only RUNNING runs can be aborted"
            ))),
        }
    }

    /// Resurrects a terminal run against its original storage handles.
    pub async fn resurrect_run(&self, id: &RunId) -> Result<Run> {
        match self.meta.resurrect_run(id).await? {
            TransitionOutcome::Done(run) => {
                // The old token may have lapsed with the original deadline.
                self.issue_run_token(&run).await?;
                self.coord
                    .publish(RUN_RESURRECTED_CHANNEL, Bytes::from(run.id.to_string()))
                    .await?;
                tracing::info!(run_id = %id, restart = run.stats.restart_count, "run resurrected");
                Ok(run)
            }
            TransitionOutcome::WrongState { current } => Err(EngineError::invalid_state(format!(
                "run is {current}; only finished runs can be resurrected"
            ))),
        }
    }

    /// Trusted status update from the runtime driver (or operator tooling).
    ///
    /// `finished_at` is maintained automatically: set iff the new status is
    /// terminal. Updates that do not follow the state machine are rejected
    /// with `InvalidTransition`.
    pub async fn update_status(
        &self,
        id: &RunId,
        to: RunStatus,
        status_message: Option<String>,
        exit_code: Option<i64>,
    ) -> Result<Run> {
        let expected: &[RunStatus] = match to {
            RunStatus::Running => &[RunStatus::Ready],
            t if t.is_terminal() => &[RunStatus::Running],
            _ => &[],
        };
        if expected.is_empty() {
            let run = self.get(id).await?;
            return Err(EngineError::InvalidTransition {
                from: run.status.to_string(),
                to: to.to_string(),
            });
        }
        match self
            .meta
            .transition_run(id, expected, to, status_message, exit_code)
            .await?
        {
            TransitionOutcome::Done(run) => Ok(run),
            TransitionOutcome::WrongState { current } => Err(EngineError::InvalidTransition {
                from: current.to_string(),
                to: to.to_string(),
            }),
        }
    }

    /// Returns the run's current token, minting a fresh one when absent.
    pub async fn run_token(&self, run: &Run) -> Result<String> {
        let pointer_key = format!("run-token-of:{}", run.id);
        if let Some(existing) = self.coord.get_value(&pointer_key).await? {
            return Ok(String::from_utf8_lossy(&existing).into_owned());
        }
        self.issue_run_token(run).await
    }

    /// Resolves a presented run token to its run-scoped principal.
    pub async fn resolve_run_token(&self, token: &str) -> Result<Option<Principal>> {
        let Some(raw) = self
            .coord
            .get_value(&format!("run-token:{token}"))
            .await?
        else {
            return Ok(None);
        };
        let principal = serde_json::from_slice(&raw)
            .map_err(|e| EngineError::internal(format!("corrupt run token record: {e}")))?;
        Ok(Some(principal))
    }

    async fn issue_run_token(&self, run: &Run) -> Result<String> {
        let token = random_token();
        let ttl = Duration::from_secs(run.timeout_secs) + RUN_TOKEN_TTL_MARGIN;
        let principal = Principal::for_run(run.principal_id.clone(), run.id.clone());
        let body = serde_json::to_vec(&principal)
            .map_err(|e| EngineError::internal(format!("encode run token record: {e}")))?;
        self.coord
            .put_value(&format!("run-token:{token}"), Bytes::from(body), ttl)
            .await?;
        self.coord
            .put_value(
                &format!("run-token-of:{}", run.id),
                Bytes::from(token.clone()),
                ttl,
            )
            .await?;
        Ok(token)
    }

    /// Materializes the environment block injected into the run's container.
    ///
    /// The variable names are an external contract read by third-party SDKs.
    #[must_use]
    pub fn env_for_run(&self, run: &Run, token: &str) -> Vec<(String, String)> {
        let timeout_at = run.started_at.unwrap_or_else(Utc::now)
            + chrono::Duration::seconds(i64::try_from(run.timeout_secs).unwrap_or(i64::MAX));
        vec![
            ("APIFY_ACTOR_ID".into(), run.actor_id.to_string()),
            ("APIFY_ACTOR_RUN_ID".into(), run.id.to_string()),
            ("APIFY_USER_ID".into(), run.principal_id.to_string()),
            ("APIFY_TOKEN".into(), token.to_string()),
            ("APIFY_API_BASE_URL".into(), self.public_base_url.clone()),
            (
                "APIFY_DEFAULT_DATASET_ID".into(),
                run.default_dataset_id.to_string(),
            ),
            (
                "APIFY_DEFAULT_KEY_VALUE_STORE_ID".into(),
                run.default_key_value_store_id.to_string(),
            ),
            (
                "APIFY_DEFAULT_REQUEST_QUEUE_ID".into(),
                run.default_request_queue_id.to_string(),
            ),
            ("APIFY_IS_AT_HOME".into(), "1".into()),
            ("APIFY_HEADLESS".into(), "1".into()),
            (
                "APIFY_MEMORY_MBYTES".into(),
                run.memory_mbytes.to_string(),
            ),
            (
                "APIFY_TIMEOUT_AT".into(),
                timeout_at.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            ),
            ("APIFY_LOCAL_STORAGE_DIR".into(), self.storage_root.clone()),
        ]
    }

    pub(crate) fn meta(&self) -> &Arc<dyn MetaStore> {
        &self.meta
    }
}
