//! Dispatcher worker pool.
//!
//! One task per worker slot, up to the global concurrency cap. Each worker
//! wakes on a `run:new` notification or the poll tick, refuses to claim when
//! the cap is reached, and claims the oldest READY run through the metadata
//! store's skip-locked primitive. Claimed runs get a driver task that holds
//! one slot until the run finishes, whatever the outcome.

use futures::StreamExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crawlspace_core::CoordStore;

use crate::logs::LogPipeline;
use crate::model::RunStatus;
use crate::runs::driver::{drive_run, DriverDeps};
use crate::runs::janitor::janitor_loop;
use crate::runs::{RunService, RUN_NEW_CHANNEL, RUN_RESURRECTED_CHANNEL};
use crate::runtime::ContainerRuntime;

/// Orchestrator tuning.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Global cap on concurrently executing runs.
    pub max_concurrent_runs: usize,
    /// Poll tick for workers that missed a notification.
    pub poll_interval: Duration,
    /// Grace window granted to containers on stop.
    pub stop_grace: Duration,
    /// How often the janitor scans for orphaned runs.
    pub janitor_interval: Duration,
    /// Extra slack past a run's timeout before it counts as orphaned.
    pub janitor_grace: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_runs: 8,
            poll_interval: Duration::from_secs(1),
            stop_grace: Duration::from_secs(10),
            janitor_interval: Duration::from_secs(30),
            janitor_grace: Duration::from_secs(60),
        }
    }
}

/// The assembled orchestrator, ready to start.
#[derive(Clone)]
pub struct Orchestrator {
    coord: Arc<dyn CoordStore>,
    runtime: Arc<dyn ContainerRuntime>,
    logs: LogPipeline,
    runs: RunService,
    config: OrchestratorConfig,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Handle over the running worker pool; dropping it does NOT stop the tasks.
pub struct OrchestratorHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    active: Arc<AtomicUsize>,
}

impl std::fmt::Debug for OrchestratorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestratorHandle")
            .field("tasks", &self.tasks.len())
            .finish_non_exhaustive()
    }
}

impl OrchestratorHandle {
    /// Number of runs currently holding a driver slot.
    #[must_use]
    pub fn active_runs(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Signals all workers to stop and waits for them to drain.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
        info!("orchestrator stopped");
    }
}

impl Orchestrator {
    /// Assembles an orchestrator over its collaborators.
    #[must_use]
    pub fn new(
        coord: Arc<dyn CoordStore>,
        runtime: Arc<dyn ContainerRuntime>,
        logs: LogPipeline,
        runs: RunService,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            coord,
            runtime,
            logs,
            runs,
            config,
        }
    }

    fn driver_deps(&self) -> DriverDeps {
        DriverDeps {
            runtime: Arc::clone(&self.runtime),
            logs: self.logs.clone(),
            runs: self.runs.clone(),
            stop_grace: self.config.stop_grace,
        }
    }

    /// Starts the worker pool, the resurrection listener, and the janitor.
    #[must_use]
    pub fn start(self) -> OrchestratorHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let active = Arc::new(AtomicUsize::new(0));
        let mut tasks = Vec::new();

        for slot in 0..self.config.max_concurrent_runs {
            tasks.push(tokio::spawn(worker_loop(
                slot,
                self.clone(),
                Arc::clone(&active),
                shutdown_rx.clone(),
            )));
        }
        tasks.push(tokio::spawn(resurrection_loop(
            self.clone(),
            Arc::clone(&active),
            shutdown_rx.clone(),
        )));
        tasks.push(tokio::spawn(janitor_loop(
            self.runs.clone(),
            self.config.janitor_interval,
            self.config.janitor_grace,
            shutdown_rx,
        )));

        info!(
            workers = self.config.max_concurrent_runs,
            "orchestrator started"
        );
        OrchestratorHandle {
            shutdown: shutdown_tx,
            tasks,
            active,
        }
    }
}

fn spawn_driver(orchestrator: &Orchestrator, active: &Arc<AtomicUsize>, run: crate::model::Run) {
    let deps = orchestrator.driver_deps();
    let active = Arc::clone(active);
    active.fetch_add(1, Ordering::SeqCst);
    tokio::spawn(async move {
        drive_run(deps, run).await;
        // The slot frees regardless of outcome.
        active.fetch_sub(1, Ordering::SeqCst);
    });
}

async fn worker_loop(
    slot: usize,
    orchestrator: Orchestrator,
    active: Arc<AtomicUsize>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut notifications = match orchestrator.coord.subscribe(RUN_NEW_CHANNEL).await {
        Ok(sub) => Some(sub),
        Err(e) => {
            warn!(slot, error = %e, "run:new subscription failed; polling only");
            None
        }
    };
    let poll = orchestrator.config.poll_interval;
    let cap = orchestrator.config.max_concurrent_runs;

    loop {
        if *shutdown.borrow() {
            break;
        }

        if active.load(Ordering::SeqCst) >= cap {
            tokio::select! {
                _ = tokio::time::sleep(poll) => {}
                _ = shutdown.changed() => {}
            }
            continue;
        }

        match orchestrator.runs.meta().claim_pending_run().await {
            Ok(Some(run)) => {
                debug!(slot, run_id = %run.id, "claimed pending run");
                spawn_driver(&orchestrator, &active, run);
            }
            Ok(None) => {
                // Nothing pending; sleep until woken or the next tick.
                match &mut notifications {
                    Some(sub) => {
                        tokio::select! {
                            _ = sub.next() => {}
                            _ = tokio::time::sleep(poll) => {}
                            _ = shutdown.changed() => {}
                        }
                    }
                    None => {
                        tokio::select! {
                            _ = tokio::time::sleep(poll) => {}
                            _ = shutdown.changed() => {}
                        }
                    }
                }
            }
            Err(e) => {
                warn!(slot, error = %e, "claim failed");
                tokio::select! {
                    _ = tokio::time::sleep(poll) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
    }
    debug!(slot, "worker stopped");
}

/// Resurrected runs are already RUNNING and never pass through the claim
/// loop; launch their drivers directly.
async fn resurrection_loop(
    orchestrator: Orchestrator,
    active: Arc<AtomicUsize>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut notifications = match orchestrator.coord.subscribe(RUN_RESURRECTED_CHANNEL).await {
        Ok(sub) => sub,
        Err(e) => {
            warn!(error = %e, "resurrection subscription failed; resurrected runs need a restart");
            return;
        }
    };

    loop {
        let payload = tokio::select! {
            payload = notifications.next() => payload,
            _ = shutdown.changed() => break,
        };
        let Some(payload) = payload else { break };
        let Ok(run_id) = std::str::from_utf8(&payload)
            .unwrap_or_default()
            .parse::<crawlspace_core::RunId>()
        else {
            continue;
        };
        match orchestrator.runs.get(&run_id).await {
            Ok(run) if run.status == RunStatus::Running => {
                info!(run_id = %run_id, "launching driver for resurrected run");
                spawn_driver(&orchestrator, &active, run);
            }
            Ok(run) => {
                debug!(run_id = %run_id, status = %run.status, "resurrected run no longer running");
            }
            Err(e) => warn!(run_id = %run_id, error = %e, "failed to load resurrected run"),
        }
    }
}
