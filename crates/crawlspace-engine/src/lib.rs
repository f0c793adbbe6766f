//! Crawlspace engine: run orchestration, request queues, datasets,
//! key-value stores, and the log pipeline.
//!
//! The [`Engine`] is the root context: it owns the leaf dependencies
//! (metadata store, blob store, coordination store, container runtime) and
//! hands out the services built on top of them. There are no process-wide
//! singletons; test doubles are swapped at this root.

pub mod dataset;
pub mod error;
pub mod kv;
pub mod logs;
pub mod meta;
pub mod model;
pub mod queue;
pub mod runs;
pub mod runtime;
mod util;

use std::sync::Arc;

use crawlspace_core::{BlobStore, CoordStore, MemoryBlobStore, MemoryCoordStore};

pub use dataset::DatasetService;
pub use error::{EngineError, Result};
pub use kv::{KeyListing, KeyValueService, KvRecord};
pub use logs::{LogEntry, LogLevel, LogPipeline, LogStream, LOG_CAP, REPLAY_COUNT};
pub use meta::{MemoryMetaStore, MetaStore, Page, PostgresMetaStore};
pub use model::{
    Actor, Dataset, KeyValueStore, KvRecordMeta, NewRequest, QueuedRequest, RequestPatch,
    RequestQueue, Run, RunOptions, RunStats, RunStatus,
};
pub use queue::{
    derive_unique_key, AcquiredHead, AddRequestOutcome, BatchOutcome, RequestQueueService,
    UnprocessedRequest,
};
pub use runs::{
    CreateRunParams, Orchestrator, OrchestratorConfig, OrchestratorHandle, RunService,
};
pub use runtime::{ContainerRuntime, ContainerSpec, MockRuntime, ProcessRuntime};

/// Engine-level configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Base URL injected into containers as the API endpoint.
    pub public_base_url: String,
    /// Storage-root path injected into containers.
    pub storage_root: String,
    /// Orchestrator tuning.
    pub orchestrator: OrchestratorConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            public_base_url: "http://localhost:8787".to_string(),
            storage_root: "/var/lib/crawlspace".to_string(),
            orchestrator: OrchestratorConfig::default(),
        }
    }
}

/// Root context wiring the leaf stores into the platform services.
pub struct Engine {
    meta: Arc<dyn MetaStore>,
    blob: Arc<dyn BlobStore>,
    coord: Arc<dyn CoordStore>,
    runtime: Arc<dyn ContainerRuntime>,
    logs: LogPipeline,
    datasets: DatasetService,
    kv: KeyValueService,
    queues: RequestQueueService,
    runs: RunService,
    config: EngineConfig,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Wires the services over the given leaves.
    #[must_use]
    pub fn new(
        meta: Arc<dyn MetaStore>,
        blob: Arc<dyn BlobStore>,
        coord: Arc<dyn CoordStore>,
        runtime: Arc<dyn ContainerRuntime>,
        config: EngineConfig,
    ) -> Arc<Self> {
        let logs = LogPipeline::new(Arc::clone(&coord));
        let datasets = DatasetService::new(Arc::clone(&meta), Arc::clone(&blob), Arc::clone(&coord));
        let kv = KeyValueService::new(Arc::clone(&meta), Arc::clone(&blob));
        let queues = RequestQueueService::new(Arc::clone(&meta), Arc::clone(&coord));
        let runs = RunService::new(
            Arc::clone(&meta),
            Arc::clone(&coord),
            datasets.clone(),
            kv.clone(),
            queues.clone(),
            config.public_base_url.clone(),
            config.storage_root.clone(),
        );
        Arc::new(Self {
            meta,
            blob,
            coord,
            runtime,
            logs,
            datasets,
            kv,
            queues,
            runs,
            config,
        })
    }

    /// Builds an engine over all-in-memory leaves (tests and local dev).
    #[must_use]
    pub fn in_memory(runtime: Arc<dyn ContainerRuntime>, config: EngineConfig) -> Arc<Self> {
        Self::new(
            Arc::new(MemoryMetaStore::new()),
            Arc::new(MemoryBlobStore::new()),
            Arc::new(MemoryCoordStore::new()),
            runtime,
            config,
        )
    }

    /// Run lifecycle service.
    #[must_use]
    pub fn runs(&self) -> &RunService {
        &self.runs
    }

    /// Request queue service.
    #[must_use]
    pub fn queues(&self) -> &RequestQueueService {
        &self.queues
    }

    /// Dataset service.
    #[must_use]
    pub fn datasets(&self) -> &DatasetService {
        &self.datasets
    }

    /// Key-value store service.
    #[must_use]
    pub fn kv(&self) -> &KeyValueService {
        &self.kv
    }

    /// Log pipeline.
    #[must_use]
    pub fn logs(&self) -> &LogPipeline {
        &self.logs
    }

    /// Metadata store (actor CRUD goes straight through).
    #[must_use]
    pub fn meta(&self) -> &Arc<dyn MetaStore> {
        &self.meta
    }

    /// Engine configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Starts the dispatcher worker pool, resurrection listener, and janitor.
    #[must_use]
    pub fn start_orchestrator(&self) -> OrchestratorHandle {
        Orchestrator::new(
            Arc::clone(&self.coord),
            Arc::clone(&self.runtime),
            self.logs.clone(),
            self.runs.clone(),
            self.config.orchestrator.clone(),
        )
        .start()
    }

    /// Deep readiness check across all leaves.
    pub async fn check_ready(&self) -> Result<()> {
        self.meta.ping().await?;
        // A HEAD on a missing key validates credentials and network path
        // without listing.
        self.blob.head("__crawlspace/ready-check").await?;
        self.coord.get_lease("__crawlspace/ready-check").await?;
        self.runtime
            .ping()
            .await
            .map_err(|e| EngineError::dependency(e))?;
        Ok(())
    }
}
