//! Orphaned-run janitor.
//!
//! A worker crash between "set RUNNING" and "container start" leaves a row
//! in RUNNING with no live driver. The janitor periodically fails RUNNING
//! runs whose `started_at + timeout_secs + grace` has passed. This is the
//! sole garbage-collection rule.

use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::runs::RunService;

pub(crate) async fn janitor_loop(
    runs: RunService,
    interval: Duration,
    grace: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => break,
        }
        if *shutdown.borrow() {
            break;
        }
        match runs.meta().fail_orphaned_runs(grace).await {
            Ok(orphaned) => {
                for run in orphaned {
                    warn!(run_id = %run.id, "orphaned run failed by janitor");
                }
            }
            Err(e) => debug!(error = %e, "janitor scan failed"),
        }
    }
    debug!("janitor stopped");
}
